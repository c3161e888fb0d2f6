use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use log::{info, warn};

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:8081";
pub const DEFAULT_PUBLIC_WS_URL: &str = "ws://127.0.0.1:8080/ws";
pub const CLEANUP_INTERVAL_SECS: u64 = 60;

// JWT Configuration
pub const DEFAULT_JWT_SECRET: &str = "your-secret-key-change-in-production";
pub const DEFAULT_API_KEY: &str = "dev-api-key-change-me";
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 60;

// Pipeline Configuration
pub const DEFAULT_CONSUMER_GROUP: &str = "candle-aggregators";
pub const DEFAULT_INGEST_BATCH_SIZE: usize = 100;
pub const DEFAULT_INGEST_BLOCK_MS: u64 = 1000;
pub const DEFAULT_INGEST_RETRY_MS: u64 = 1000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 150;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_CHANNEL_PREFIX: &str = "candles:";
pub const LOG_MAX_LEN: usize = 100_000;

// Data Configuration
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_REPLAY_INTERVAL_MS: u64 = 250;

// Broadcast Configuration
pub const BROADCAST_CHANNEL_SIZE: usize = 100;

// Client Configuration
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8081";
pub const DEFAULT_CLIENT_ID: &str = "candle-watch";
pub const DEFAULT_WATCH_SYMBOLS: &str = "AAPL";
pub const DEFAULT_TOKEN_REFRESH_SECS: u64 = 50;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_BACKFILL_TIMEOUT_MS: u64 = 3000;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_or(key, default)
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn mask(secret: &str) -> String {
    format!("{}***", secret.chars().take(4).collect::<String>())
}

pub struct ServerConfig {
    pub bind_address: String,
    pub api_bind_address: String,
    pub public_ws_url: String,
    pub jwt_secret: String,
    pub api_key: String,
    pub token_ttl_secs: i64,
    pub consumer_group: String,
    pub consumer_name: String,
    pub ingest_batch_size: usize,
    pub ingest_block: Duration,
    pub ingest_retry: Duration,
    pub flush_interval: Duration,
    pub stats_interval: Duration,
    pub channel_prefix: String,
    pub data_dir: PathBuf,
    pub replay_interval: Duration,
    pub log_level: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("BIND_ADDRESS", DEFAULT_BIND_ADDRESS),
            api_bind_address: env_or("API_BIND_ADDRESS", DEFAULT_API_BIND_ADDRESS),
            public_ws_url: env_or("PUBLIC_WS_URL", DEFAULT_PUBLIC_WS_URL),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("JWT_SECRET not set, using default (NOT for production!)");
                    DEFAULT_JWT_SECRET.to_string()
                }),
            api_key: env::var("API_KEY")
                .unwrap_or_else(|_| {
                    warn!("API_KEY not set, using default (NOT for production!)");
                    DEFAULT_API_KEY.to_string()
                }),
            token_ttl_secs: env_parse("TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS),
            consumer_group: env_or("CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP),
            consumer_name: env::var("CONSUMER_NAME")
                .unwrap_or_else(|_| format!("relay-{}", uuid::Uuid::new_v4())),
            ingest_batch_size: env_parse("INGEST_BATCH_SIZE", DEFAULT_INGEST_BATCH_SIZE),
            ingest_block: Duration::from_millis(env_parse("INGEST_BLOCK_MS", DEFAULT_INGEST_BLOCK_MS)),
            ingest_retry: Duration::from_millis(env_parse("INGEST_RETRY_MS", DEFAULT_INGEST_RETRY_MS)),
            flush_interval: Duration::from_millis(env_parse("FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS)),
            stats_interval: Duration::from_secs(env_parse("STATS_INTERVAL_SECS", DEFAULT_STATS_INTERVAL_SECS)),
            channel_prefix: env_or("CHANNEL_PREFIX", DEFAULT_CHANNEL_PREFIX),
            data_dir: PathBuf::from(env_or("DATA_DIR", DEFAULT_DATA_DIR)),
            replay_interval: Duration::from_millis(env_parse("REPLAY_INTERVAL_MS", DEFAULT_REPLAY_INTERVAL_MS)),
            log_level: env_or("RUST_LOG", "info"),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jwt_secret == DEFAULT_JWT_SECRET {
            warn!("Using default JWT secret - change for production!");
        }

        if self.jwt_secret.len() < 32 {
            return Err("JWT secret should be at least 32 characters long".to_string());
        }
        if self.api_key.len() < 16 {
            return Err("API key should be at least 16 characters long".to_string());
        }
        if self.token_ttl_secs <= 0 {
            return Err("TOKEN_TTL_SECS must be positive".to_string());
        }
        if self.ingest_batch_size == 0 {
            return Err("INGEST_BATCH_SIZE must be at least 1".to_string());
        }
        if self.flush_interval.is_zero() || self.stats_interval.is_zero() {
            return Err("Flush and stats intervals must be non-zero".to_string());
        }
        if !self.data_dir.exists() {
            warn!("Data directory not found: {} (replay unavailable)", self.data_dir.display());
        }

        Ok(())
    }

    pub fn log_config(&self) {
        info!("Server Configuration:");
        info!("  WebSocket Bind Address: {}", self.bind_address);
        info!("  API Bind Address: {}", self.api_bind_address);
        info!("  Public WebSocket URL: {}", self.public_ws_url);
        info!("  Consumer group: {} (consumer {})", self.consumer_group, self.consumer_name);
        info!("  Flush Interval: {:?}", self.flush_interval);
        info!("  Channel Prefix: {}", self.channel_prefix);
        info!("  Data Dir: {}", self.data_dir.display());
        info!("  Log Level: {}", self.log_level);
        info!("  JWT Secret: {}", mask(&self.jwt_secret));
        info!("  API Key: {}", mask(&self.api_key));
    }
}

pub struct ClientConfig {
    pub api_url: String,
    pub api_key: String,
    pub client_id: String,
    pub symbols: Vec<String>,
    pub quotes: Vec<String>,
    pub token_refresh: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backfill_timeout: Duration,
    pub log_level: String,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env_or("API_URL", DEFAULT_API_URL),
            api_key: env_or("API_KEY", DEFAULT_API_KEY),
            client_id: env_or("CLIENT_ID", DEFAULT_CLIENT_ID),
            symbols: env_list("WATCH_SYMBOLS", DEFAULT_WATCH_SYMBOLS),
            quotes: env_list("WATCH_QUOTES", ""),
            token_refresh: Duration::from_secs(env_parse("TOKEN_REFRESH_SECS", DEFAULT_TOKEN_REFRESH_SECS)),
            heartbeat_interval: Duration::from_secs(env_parse("HEARTBEAT_INTERVAL_SECS", DEFAULT_HEARTBEAT_INTERVAL_SECS)),
            heartbeat_timeout: Duration::from_secs(env_parse("HEARTBEAT_TIMEOUT_SECS", DEFAULT_HEARTBEAT_TIMEOUT_SECS)),
            backoff_base: Duration::from_millis(env_parse("BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS)),
            backoff_max: Duration::from_millis(env_parse("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)),
            backfill_timeout: Duration::from_millis(env_parse("BACKFILL_TIMEOUT_MS", DEFAULT_BACKFILL_TIMEOUT_MS)),
            log_level: env_or("RUST_LOG", "info"),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.symbols.is_empty() && self.quotes.is_empty() {
            return Err("Nothing to watch: set WATCH_SYMBOLS or WATCH_QUOTES".to_string());
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err("HEARTBEAT_TIMEOUT_SECS must exceed HEARTBEAT_INTERVAL_SECS".to_string());
        }
        if self.backoff_base.is_zero() || self.backoff_max < self.backoff_base {
            return Err("Backoff base must be non-zero and not exceed the maximum".to_string());
        }
        if self.token_refresh.is_zero() {
            return Err("TOKEN_REFRESH_SECS must be positive".to_string());
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!("Client Configuration:");
        info!("  API URL: {}", self.api_url);
        info!("  Client ID: {}", self.client_id);
        info!("  Candle Symbols: {:?}", self.symbols);
        info!("  Quote Symbols: {:?}", self.quotes);
        info!("  Token Refresh: {:?}", self.token_refresh);
        info!("  Heartbeat: every {:?}, timeout {:?}", self.heartbeat_interval, self.heartbeat_timeout);
        info!("  Backoff: {:?} .. {:?}", self.backoff_base, self.backoff_max);
        info!("  API Key: {}", mask(&self.api_key));
    }
}
