use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backend_monitor::{
    MetricResponse, MetricsPayload,
    monitors::collect_metrics,
    reboot::{TokioCommandRunner, execute_reboot, find_in_path, plan_reboot},
    storage::{Retention, SnapshotHistory},
    util::{
        bearer_token, get_addr, get_allow_reboot, get_collect_interval, get_history_max_entries,
        get_history_retention, get_host_root, get_port, get_reboot_command, get_secret,
    },
};
use chrono::Utc;
use rocket::{
    Build, Rocket, State,
    fairing::AdHoc,
    figment::Figment,
    get,
    http::Status,
    launch, post,
    request::{FromRequest, Outcome},
    response::status,
    routes,
    serde::json::Json,
};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, level_filters::LevelFilter, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

struct AgentState {
    history: SnapshotHistory<(), MetricsPayload>,
    retention: Retention,
    host_root: PathBuf,
    secret: Option<String>,
    allow_reboot: bool,
    reboot_command: Option<String>,
}

impl AgentState {
    fn from_env() -> Self {
        let max_age = chrono::Duration::from_std(get_history_retention())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            history: SnapshotHistory::new(),
            retention: Retention::new(max_age, Some(get_history_max_entries())),
            host_root: get_host_root(),
            secret: get_secret(),
            allow_reboot: get_allow_reboot(),
            reboot_command: get_reboot_command(),
        }
    }

    /// Collect off the async runtime and record the reading.
    async fn collect(&self) -> anyhow::Result<MetricsPayload> {
        let host_root = self.host_root.clone();
        let payload = tokio::task::spawn_blocking(move || collect_metrics(&host_root))
            .await
            .context("metrics collection panicked")?;

        let pruned = self
            .history
            .record_and_prune((), payload.clone(), &self.retention, Utc::now())
            .await;
        if pruned > 0 {
            debug!("pruned {pruned} readings from history");
        }

        Ok(payload)
    }
}

async fn collect_loop(state: Arc<AgentState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = state.collect().await {
            error!("failed to collect metrics: {e:#}");
        }
    }
}

/// Fresh reading on every call, also recorded into the history.
#[get("/metrics")]
#[instrument(skip_all)]
async fn metrics(
    _auth: Authorized,
    state: &State<Arc<AgentState>>,
) -> Result<Json<MetricResponse>, Status> {
    match state.collect().await {
        Ok(metrics) => Ok(Json(MetricResponse { metrics })),
        Err(e) => {
            error!("failed to collect metrics: {e:#}");
            Err(Status::InternalServerError)
        }
    }
}

/// Newest reading from the background collector, or a fresh one while the
/// history is empty.
#[get("/metrics/latest")]
#[instrument(skip_all)]
async fn latest_metrics(
    auth: Authorized,
    state: &State<Arc<AgentState>>,
) -> Result<Json<MetricResponse>, Status> {
    match state.history.latest(&()).await {
        Some(metrics) => Ok(Json(MetricResponse { metrics })),
        None => metrics(auth, state).await,
    }
}

#[get("/history")]
async fn history(_auth: Authorized, state: &State<Arc<AgentState>>) -> Json<Value> {
    let metrics = state.history.all(&()).await;
    Json(json!({
        "count": metrics.len(),
        "metrics": metrics,
    }))
}

#[get("/health")]
fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[post("/reboot")]
#[instrument(skip_all)]
async fn reboot(
    _auth: Authorized,
    state: &State<Arc<AgentState>>,
) -> status::Custom<Json<Value>> {
    if !state.allow_reboot {
        return status::Custom(Status::Forbidden, Json(json!({"error": "Reboot disabled"})));
    }

    let chroot = find_in_path("chroot");
    let attempts = match plan_reboot(
        state.reboot_command.as_deref(),
        &state.host_root,
        chroot.as_deref(),
    ) {
        Ok(attempts) => attempts,
        Err(e) => {
            error!("{e}");
            return status::Custom(Status::BadGateway, Json(json!({"error": e.to_string()})));
        }
    };

    match execute_reboot(&TokioCommandRunner::default(), &attempts).await {
        Ok(attempt) => {
            warn!("host reboot issued via {}", attempt.describe());
            status::Custom(Status::Accepted, Json(json!({"status": "rebooting"})))
        }
        Err(e) => {
            error!("{e}");
            status::Custom(Status::BadGateway, Json(json!({"error": e.to_string()})))
        }
    }
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("backend_monitor", LevelFilter::DEBUG),
        ("monitor_agent", LevelFilter::DEBUG),
        ("rocket", LevelFilter::INFO),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(true),
        )
        .with(filter)
        .init();
}

fn get_config() -> Figment {
    rocket::Config::figment()
        .merge(("port", get_port()))
        .merge(("address", get_addr()))
        .merge(("workers", 1))
}

fn build(figment: Figment, state: Arc<AgentState>) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .mount("/", routes![metrics, latest_metrics, history, health, reboot])
}

#[launch]
fn rocket() -> _ {
    init();

    let state = Arc::new(AgentState::from_env());
    let interval = get_collect_interval();
    info!(
        "agent starting, collecting every {}s, reboot {}",
        interval.as_secs(),
        if state.allow_reboot { "enabled" } else { "disabled" }
    );

    build(get_config(), state).attach(AdHoc::on_liftoff("metrics collector", move |rocket| {
        Box::pin(async move {
            if let Some(state) = rocket.state::<Arc<AgentState>>() {
                tokio::spawn(collect_loop(Arc::clone(state), interval));
            }
        })
    }))
}

/// Request guard for the agent secret. Without a configured secret every
/// request passes.
#[derive(Debug)]
struct Authorized;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Authorized {
    type Error = ();

    async fn from_request(request: &'r rocket::Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(state) = request.rocket().state::<Arc<AgentState>>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        let Some(secret) = state.secret.as_deref() else {
            return Outcome::Success(Authorized);
        };

        let passed = request
            .headers()
            .get_one("Authorization")
            .and_then(bearer_token);
        if passed == Some(secret) {
            Outcome::Success(Authorized)
        } else {
            Outcome::Error((Status::Unauthorized, ()))
        }
    }
}
