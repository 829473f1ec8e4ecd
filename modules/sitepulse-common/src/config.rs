use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Credential vault master passphrase (>= 32 chars, checked by Vault::new)
    pub encryption_key: String,

    // Observability
    pub log_level: String,
    pub otel_endpoint: Option<String>,
    pub app_version: String,
    pub app_env: String,

    // Worker pools
    pub scanner_concurrency: usize,
    pub google_concurrency: usize,
    pub indexnow_concurrency: usize,

    // Google Indexing API daily quota per project
    pub google_daily_quota: i64,

    // WebSocket surface
    pub ws_host: String,
    pub ws_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            encryption_key: required_env("ENCRYPTION_KEY"),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otel_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            app_version: env::var("APP_VERSION").unwrap_or_else(|_| "dev".to_string()),
            app_env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            scanner_concurrency: parsed_env("SCANNER_CONCURRENCY", 10),
            google_concurrency: parsed_env("GOOGLE_CONCURRENCY", 5),
            indexnow_concurrency: parsed_env("INDEXNOW_CONCURRENCY", 3),
            google_daily_quota: parsed_env("GOOGLE_DAILY_QUOTA", 200),
            ws_host: env::var("WS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            ws_port: parsed_env("WS_PORT", 3001),
        }
    }
}

fn required_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("{name} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
