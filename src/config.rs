use tracing::warn;

/// Process-wide configuration, loaded once at boot via [`Config::from_env`].
///
/// Unknown or unparsable values never panic: they fall back to the documented
/// default and log a single `warn!`, the same discipline the original
/// `models::Config::from_env` used.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub redis_url: String,
    pub feed_api_key: Option<String>,
    pub upstream_feed_urls: Vec<String>,
    pub max_broadcast_tps: u32,
    pub tick_history_limit: usize,
    pub execution_latency_ms: u64,
    pub sltp_grace_ms: i64,
    pub price_stale_ms: i64,
    pub duplicate_order_ms: i64,
    pub enable_partial_fills: bool,
    pub partial_fill_ratio: f64,
    pub usdinr_default: f64,
    pub registry_refresh_secs: u64,
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let environment = match std::env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok(other) if !other.is_empty() && other != "development" && other != "dev" => {
                warn!(value = other, "unknown APP_ENV value, defaulting to development");
                Environment::Development
            }
            _ => Environment::Development,
        };

        let port = env_parse("PORT", 4000);
        let database_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./propcore.db".to_string());
        let redis_url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("UPSTASH_REDIS_URL"))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let feed_api_key = std::env::var("FEED_API_KEY").ok();
        if feed_api_key.is_none() && environment == Environment::Production {
            warn!("FEED_API_KEY is unset in a production environment; downstream WS auth will reject all clients");
        }

        let upstream_feed_urls = std::env::var("UPSTREAM_FEED_URLS")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let max_broadcast_tps = env_parse("MAX_BROADCAST_TPS", 20);
        let tick_history_limit = env_parse("TICK_HISTORY_LIMIT", 1000usize);
        let execution_latency_ms = env_parse("EXECUTION_LATENCY_MS", 150u64);
        let sltp_grace_ms = env_parse("SLTP_GRACE_MS", 1000i64);
        let price_stale_ms = env_parse("PRICE_STALE_MS", 5000i64);
        let duplicate_order_ms = env_parse("DUPLICATE_ORDER_MS", 500i64);
        let enable_partial_fills = env_parse("ENABLE_PARTIAL_FILLS", false);
        let partial_fill_ratio = env_parse("PARTIAL_FILL_RATIO", 0.5f64);
        let usdinr_default = env_parse("USDINR_DEFAULT", 83.0f64);
        let registry_refresh_secs = env_parse("REGISTRY_REFRESH_SECS", 600u64);

        Ok(Self {
            port,
            database_path,
            redis_url,
            feed_api_key,
            upstream_feed_urls,
            max_broadcast_tps,
            tick_history_limit,
            execution_latency_ms,
            sltp_grace_ms,
            price_stale_ms,
            duplicate_order_ms,
            enable_partial_fills,
            partial_fill_ratio,
            usdinr_default,
            registry_refresh_secs,
            environment,
        })
    }
}

/// Reads `key` from the environment, falling back to `default` and logging
/// once if the variable is present but fails to parse.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw, "invalid config value, falling back to default");
            default
        }),
        Err(_) => default,
    }
}
