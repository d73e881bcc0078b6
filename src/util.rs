//! Agent settings read from the environment

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const AGENT_PORT: &str = "AGENT_PORT";

const DEFAULT_PORT: u16 = 51243;

pub fn get_port() -> u16 {
    env_or(AGENT_PORT, DEFAULT_PORT)
}

const AGENT_ADDR: &str = "AGENT_ADDR";

const DEFAULT_ADDR: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

pub fn get_addr() -> Ipv4Addr {
    env_or(AGENT_ADDR, DEFAULT_ADDR)
}

const AGENT_SECRET: &str = "AGENT_SECRET";

pub fn get_secret() -> Option<String> {
    non_empty(std::env::var(AGENT_SECRET).ok())
}

const AGENT_HOST_ROOT: &str = "AGENT_HOST_ROOT";

pub const DEFAULT_HOST_ROOT: &str = "/hostfs";

/// Where the host filesystem is mounted when the agent runs in a container.
pub fn get_host_root() -> PathBuf {
    non_empty(std::env::var(AGENT_HOST_ROOT).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_ROOT))
}

const AGENT_REBOOT_COMMAND: &str = "AGENT_REBOOT_COMMAND";

pub fn get_reboot_command() -> Option<String> {
    non_empty(std::env::var(AGENT_REBOOT_COMMAND).ok())
}

const AGENT_ALLOW_REBOOT: &str = "AGENT_ALLOW_REBOOT";

pub fn get_allow_reboot() -> bool {
    parse_flag(std::env::var(AGENT_ALLOW_REBOOT).ok().as_deref())
}

const AGENT_HISTORY_RETENTION_SECONDS: &str = "AGENT_HISTORY_RETENTION_SECONDS";

pub const DEFAULT_HISTORY_RETENTION_SECONDS: u64 = 86_400;
pub const MIN_HISTORY_RETENTION_SECONDS: u64 = 60;

pub fn get_history_retention() -> Duration {
    Duration::from_secs(parse_bounded(
        std::env::var(AGENT_HISTORY_RETENTION_SECONDS).ok().as_deref(),
        DEFAULT_HISTORY_RETENTION_SECONDS,
        MIN_HISTORY_RETENTION_SECONDS,
    ))
}

const AGENT_HISTORY_MAX_ENTRIES: &str = "AGENT_HISTORY_MAX_ENTRIES";

pub const DEFAULT_HISTORY_MAX_ENTRIES: u64 = 1440;
pub const MIN_HISTORY_MAX_ENTRIES: u64 = 10;

pub fn get_history_max_entries() -> usize {
    parse_bounded(
        std::env::var(AGENT_HISTORY_MAX_ENTRIES).ok().as_deref(),
        DEFAULT_HISTORY_MAX_ENTRIES,
        MIN_HISTORY_MAX_ENTRIES,
    ) as usize
}

const AGENT_COLLECT_INTERVAL: &str = "AGENT_COLLECT_INTERVAL";

pub const DEFAULT_COLLECT_INTERVAL_SECONDS: u64 = 60;
pub const MIN_COLLECT_INTERVAL_SECONDS: u64 = 5;

pub fn get_collect_interval() -> Duration {
    Duration::from_secs(parse_bounded(
        std::env::var(AGENT_COLLECT_INTERVAL).ok().as_deref(),
        DEFAULT_COLLECT_INTERVAL_SECONDS,
        MIN_COLLECT_INTERVAL_SECONDS,
    ))
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key).map_or(default, |res| res.trim().parse().unwrap_or(default))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `1`, `true`, `yes` and `on` (any case) enable a flag; anything else disables it.
pub fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// Parse a number, falling back to `default` when absent or invalid and
/// raising it to `min`.
pub fn parse_bounded(raw: Option<&str>, default: u64, min: u64) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
        .max(min)
}

/// Token carried by an `Authorization: Bearer <token>` header. The scheme is
/// matched case-insensitively.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}
