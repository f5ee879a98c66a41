//! PostgreSQL connection pool.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use sapphire_core::{Error, Result};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;

/// Pool sizing and health reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// How long `acquire` waits for a free connection.
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Period of the daemon's pool health log; `None` disables it.
    pub metrics_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            metrics_interval: Some(Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS)),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DB_MAX_CONNECTIONS` | `10` | Pool ceiling |
    /// | `DB_CONNECT_TIMEOUT_SECS` | `30` | Acquire timeout |
    /// | `DB_IDLE_TIMEOUT_SECS` | `600` | Idle connection lifetime |
    /// | `DB_METRICS_INTERVAL_SECS` | `60` | Health log period, `0` disables |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());
        let defaults = Self::default();

        Self {
            max_connections: lookup("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_connections)
                .max(1),
            connect_timeout: secs("DB_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            idle_timeout: secs("DB_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            metrics_interval: match secs("DB_METRICS_INTERVAL_SECS") {
                Some(0) => None,
                Some(n) => Some(Duration::from_secs(n)),
                None => defaults.metrics_interval,
            },
        }
    }
}

/// Open a pool and wait for the first connection.
pub async fn create_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    info!(
        subsystem = "database",
        component = "pool",
        max_connections = config.max_connections,
        connect_timeout_secs = config.connect_timeout.as_secs(),
        "Creating database connection pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Point-in-time connection counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    pub size: u32,
    pub idle: usize,
}

impl PoolHealth {
    /// Every open connection is checked out.
    pub fn is_exhausted(&self) -> bool {
        self.size > 0 && self.idle == 0
    }
}

/// Log the pool's connection counts; warns when none are idle.
pub fn log_pool_metrics(pool: &PgPool) -> PoolHealth {
    let health = PoolHealth {
        size: pool.size(),
        idle: pool.num_idle(),
    };
    if health.is_exhausted() {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = health.size,
            "Connection pool has no idle connections"
        );
    } else {
        debug!(
            subsystem = "database",
            component = "pool",
            pool_size = health.size,
            pool_idle = health.idle,
            "Pool health check"
        );
    }
    health
}
