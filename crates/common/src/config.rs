use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string (delayed notification store)
    pub database_url: String,

    /// Redis connection string (queue broker)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Verbose logging for the daemon (default: false)
    pub debug: bool,

    /// Bounded wait for a single fan-in queue pop, in seconds (default: 5)
    pub pop_wait_secs: u64,

    /// How long a routing worker waits on an empty queue before exiting (default: 5)
    pub worker_idle_secs: u64,

    /// Maximum fan-in items routed per supervisor iteration (default: 100)
    pub drain_batch: usize,

    /// Minimum gap between two spawns of the delayed-dispatch poller (default: 60)
    pub poller_respawn_secs: u64,

    /// Interval between two scans of the delayed notification store (default: 30)
    pub poller_scan_secs: u64,

    /// Verify TLS certificates of notification targets (default: true)
    pub verify_tls: bool,

    /// Port the submission API listens on (default: 3000)
    pub api_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            debug: parse_flag("NOTIFY_DEBUG", false)?,
            pop_wait_secs: parse_var("NOTIFY_POP_WAIT_SECS", "5")?,
            worker_idle_secs: parse_var("NOTIFY_WORKER_IDLE_SECS", "5")?,
            drain_batch: parse_var("NOTIFY_DRAIN_BATCH", "100")?,
            poller_respawn_secs: parse_var("NOTIFY_POLLER_RESPAWN_SECS", "60")?,
            poller_scan_secs: parse_var("NOTIFY_POLLER_SCAN_SECS", "30")?,
            verify_tls: parse_flag("NOTIFY_VERIFY_TLS", true)?,
            api_port: parse_var("API_PORT", "3000")?,
        })
    }

    pub fn pop_wait(&self) -> Duration {
        Duration::from_secs(self.pop_wait_secs)
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_secs(self.worker_idle_secs)
    }

    pub fn poller_respawn(&self) -> Duration {
        Duration::from_secs(self.poller_respawn_secs)
    }

    pub fn poller_scan(&self) -> Duration {
        Duration::from_secs(self.poller_scan_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>()))
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no` (case-insensitive).
fn parse_flag(name: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(anyhow::anyhow!("{} must be a boolean flag", name)),
        },
    }
}
