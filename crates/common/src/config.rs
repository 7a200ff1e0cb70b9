use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Attempts per channel before a transient failure becomes terminal (default: 5)
    pub dispatch_max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 1000)
    pub retry_initial_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds (default: 300000 = 5 min)
    pub retry_max_delay_ms: u64,

    /// Exponential backoff multiplier (default: 2.0)
    pub retry_backoff_multiplier: f64,

    /// TTL of the idempotency dedup lock in seconds (default: 30)
    pub idempotency_ttl_secs: u64,

    /// Concurrent workers per channel kind (default: 4)
    pub workers_per_channel: usize,

    /// Settled notifications older than this are archived (default: 30)
    pub retention_days: u32,

    /// Interval between retention/reconciliation sweeps in seconds (default: 60)
    pub sweep_interval_secs: u64,

    /// Queued attempts untouched for this long are republished (default: 300)
    pub stale_queued_secs: u64,

    /// Attempts left sending or failed_transient for this long are recovered (default: 120)
    pub sending_lease_secs: u64,

    /// Ping interval on push gateway sockets in seconds (default: 15)
    pub push_ping_interval_secs: u64,

    /// Push sockets silent for this long are closed (default: 45)
    pub push_pong_timeout_secs: u64,

    /// HTTP email API endpoint (Resend-compatible)
    pub email_api_url: String,

    /// API key for the email provider
    pub email_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Redis stream that receives `queue` channel deliveries
    pub outbound_stream: String,

    /// Redis list carrying JSON submit requests for the intake consumer
    pub intake_queue: String,

    /// Listen address of the websocket push gateway (default: 0.0.0.0:3000)
    pub push_gateway_addr: String,
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
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
            dispatch_max_attempts: parse_env("DISPATCH_MAX_ATTEMPTS", "5")?,
            retry_initial_delay_ms: parse_env("RETRY_INITIAL_DELAY_MS", "1000")?,
            retry_max_delay_ms: parse_env("RETRY_MAX_DELAY_MS", "300000")?,
            retry_backoff_multiplier: parse_env("RETRY_BACKOFF_MULTIPLIER", "2.0")?,
            idempotency_ttl_secs: parse_env("IDEMPOTENCY_TTL_SECS", "30")?,
            workers_per_channel: parse_env("WORKERS_PER_CHANNEL", "4")?,
            retention_days: parse_env("RETENTION_DAYS", "30")?,
            sweep_interval_secs: parse_env("SWEEP_INTERVAL_SECS", "60")?,
            stale_queued_secs: parse_env("STALE_QUEUED_SECS", "300")?,
            sending_lease_secs: parse_env("SENDING_LEASE_SECS", "120")?,
            push_ping_interval_secs: parse_env("PUSH_PING_INTERVAL_SECS", "15")?,
            push_pong_timeout_secs: parse_env("PUSH_PONG_TIMEOUT_SECS", "45")?,
            email_api_url: std::env::var("EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".to_string()),
            email_api_key: std::env::var("EMAIL_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            outbound_stream: std::env::var("OUTBOUND_STREAM")
                .unwrap_or_else(|_| "courier:outbound".to_string()),
            intake_queue: std::env::var("INTAKE_QUEUE")
                .unwrap_or_else(|_| "courier:intake".to_string()),
            push_gateway_addr: std::env::var("PUSH_GATEWAY_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        })
    }
}

/// Read `name`, falling back to `default`, and parse it into `T`.
fn parse_env<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        })
}
