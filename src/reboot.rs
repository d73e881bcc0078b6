//! Host reboot escalation for the agent
//!
//! A reboot is an ordered list of attempts. Commands run one after another
//! with a timeout each; the first one exiting with status 0 wins. The last
//! resort is writing `b` to the kernel's sysrq trigger.

use std::collections::HashSet;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, instrument, warn};

pub const SYSRQ_TRIGGER: &str = "/proc/sysrq-trigger";
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

const SHUTDOWN_BINARIES: [&str; 4] = [
    "/sbin/shutdown",
    "/usr/sbin/shutdown",
    "/sbin/reboot",
    "/usr/sbin/reboot",
];

#[derive(Debug, Error)]
pub enum RebootError {
    #[error("invalid reboot command: {0}")]
    InvalidCommand(#[from] shell_words::ParseError),

    #[error("reboot failed after {attempts} attempts: {details}")]
    Exhausted { attempts: usize, details: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootAttempt {
    Command(Vec<String>),
    Sysrq(PathBuf),
}

impl RebootAttempt {
    pub fn describe(&self) -> String {
        match self {
            Self::Command(argv) => argv.join(" "),
            Self::Sysrq(path) => format!("sysrq {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    fn succeeded(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr, else stdout, else the exit code.
    fn summary(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            match self.code {
                Some(code) => code.to_string(),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> io::Result<CommandOutcome>;
}

/// Runs commands with `tokio::process`, killing them after a timeout.
#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(ATTEMPT_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, argv: &[String]) -> io::Result<CommandOutcome> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
        };

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out"))??;

        Ok(CommandOutcome {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// First executable file called `name` on `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Ordered reboot attempts.
///
/// Without a configured command only the sysrq trigger is tried. Otherwise
/// the configured command comes first, followed by the well known shutdown
/// binaries (plain and under `host_root`) with the configured arguments,
/// then the same binaries through `chroot` when available. Duplicates are
/// removed by their string form.
pub fn plan_reboot(
    command: Option<&str>,
    host_root: &Path,
    chroot: Option<&Path>,
) -> Result<Vec<RebootAttempt>, RebootError> {
    let sysrq = RebootAttempt::Sysrq(PathBuf::from(SYSRQ_TRIGGER));

    let argv = match command.map(str::trim).filter(|c| !c.is_empty()) {
        Some(command) => shell_words::split(command)?,
        None => return Ok(vec![sysrq]),
    };
    let extra = argv.get(1..).unwrap_or_default();

    let mut commands = Vec::new();
    if !argv.is_empty() {
        commands.push(argv.clone());
    }

    let with_args = |program: String| {
        let mut full = vec![program];
        full.extend_from_slice(extra);
        full
    };

    for binary in SHUTDOWN_BINARIES {
        commands.push(with_args(binary.to_string()));
        let under_root = host_root.join(binary.trim_start_matches('/'));
        commands.push(with_args(under_root.display().to_string()));
    }

    if let Some(chroot) = chroot {
        for binary in SHUTDOWN_BINARIES {
            let mut full = vec![
                chroot.display().to_string(),
                host_root.display().to_string(),
                binary.to_string(),
            ];
            full.extend_from_slice(extra);
            commands.push(full);
        }
    }

    let mut seen = HashSet::new();
    let mut attempts: Vec<RebootAttempt> = commands
        .into_iter()
        .filter(|argv| seen.insert(argv.join(" ")))
        .map(RebootAttempt::Command)
        .collect();
    attempts.push(sysrq);

    Ok(attempts)
}

/// Run `attempts` in order until one succeeds.
#[instrument(skip(runner, attempts), fields(attempts = attempts.len()))]
pub async fn execute_reboot(
    runner: &dyn CommandRunner,
    attempts: &[RebootAttempt],
) -> Result<RebootAttempt, RebootError> {
    let mut failures = Vec::new();

    for attempt in attempts {
        let outcome = match attempt {
            RebootAttempt::Command(argv) => match runner.run(argv).await {
                Ok(outcome) if outcome.succeeded() => Ok(()),
                Ok(outcome) => Err(outcome.summary()),
                Err(e) => Err(e.to_string()),
            },
            RebootAttempt::Sysrq(path) => tokio::fs::write(path, b"b")
                .await
                .map_err(|e| e.to_string()),
        };

        match outcome {
            Ok(()) => {
                info!("reboot issued via {}", attempt.describe());
                return Ok(attempt.clone());
            }
            Err(detail) => {
                warn!("reboot attempt {} failed: {}", attempt.describe(), detail);
                failures.push(format!("{}: {}", attempt.describe(), detail));
            }
        }
    }

    Err(RebootError::Exhausted {
        attempts: attempts.len(),
        details: if failures.is_empty() {
            "no executable reboot command found".to_string()
        } else {
            failures.join("; ")
        },
    })
}
