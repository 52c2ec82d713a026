//! Boot entry point for the simulated prop-firm trading execution core.
//!
//! Wires the six components in a fixed order: registry -> shared state ->
//! event bus -> matching/risk -> price hub -> HTTP/WS servers. Each is an
//! `Arc`-held singleton constructed here and handed to the pieces that need
//! it; nothing below reaches for a process-wide global.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use propcore_backend::config::Config;
use propcore_backend::event_bus::EventBus;
use propcore_backend::kv::KvStore;
use propcore_backend::matching::{MatchingEngine, PriceSource};
use propcore_backend::middleware::request_logging_simple;
use propcore_backend::price_hub::{Broadcaster, PriceHub};
use propcore_backend::registry::{self, InstrumentSource, Registry};
use propcore_backend::risk::{RiskEngine, TradeCloser};
use propcore_backend::state::SharedTradeState;
use propcore_backend::store::Store;
use propcore_backend::ws::{self, WsAppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Arc::new(Config::from_env().context("loading configuration")?);
    info!(port = config.port, environment = ?config.environment, "booting trading execution core");

    if let Err(err) = PrometheusBuilder::new().install_recorder() {
        warn!(error = %err, "failed to install metrics recorder, counters/gauges become no-ops");
    }

    // ---- boot order: registry -> state -> event bus -> matching/risk -> price hub -> servers ----

    let store = Arc::new(Store::new(&config.database_path).context("opening relational store")?);

    let registry = Arc::new(Registry::new(registry::built_in_defaults()));
    registry.reload(store.as_ref() as &dyn InstrumentSource).await;
    registry.spawn_refresh_loop(store.clone() as Arc<dyn InstrumentSource>, Duration::from_secs(config.registry_refresh_secs));

    let state = Arc::new(SharedTradeState::new());
    let bus = Arc::new(EventBus::new());

    let kv = match KvStore::connect(&config.redis_url).await {
        Ok(kv) => Some(Arc::new(kv)),
        Err(err) => {
            warn!(error = %err, "KV store unreachable at boot, continuing without it");
            None
        }
    };

    let broadcaster = Broadcaster::new();
    let price_hub = PriceHub::new(registry.clone(), kv.clone(), bus.clone(), broadcaster.clone(), config.clone());

    let idempotency_store = kv.clone().map(|kv| kv as Arc<dyn propcore_backend::kv::IdempotencyStore>);
    let matching = Arc::new(MatchingEngine::new(
        registry.clone(),
        state.clone(),
        store.clone(),
        idempotency_store,
        bus.clone(),
        config.clone(),
        Some(price_hub.clone() as Arc<dyn PriceSource>),
    ));
    let risk = Arc::new(RiskEngine::new(
        registry.clone(),
        state.clone(),
        store.clone(),
        bus.clone(),
        matching.clone() as Arc<dyn TradeCloser>,
    ));
    matching.attach_risk_engine(risk.clone());

    price_hub.spawn_price_flush();
    spawn_upstream_feeds(&price_hub, &registry, &config, &matching);
    spawn_daily_reset(risk);

    // ---- HTTP / WS servers: only /health and /ws are in-crate; the HTTP
    // validation gateway and candle aggregator are out-of-scope external
    // collaborators ----

    let ws_state = WsAppState {
        registry: registry.clone(),
        state: state.clone(),
        bus: bus.clone(),
        kv: kv.clone(),
        broadcaster: broadcaster.clone(),
        api_key: config.feed_api_key.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .with_state(ws_state)
        .layer(axum::middleware::from_fn(request_logging_simple))
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await.context("binding HTTP listener")?;
    info!(%addr, "listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

/// Spawns one supervised upstream connection pair (trade + depth stream) per
/// `(base_url, pair)` combination, where `pair` is every distinct
/// `price_key` currently in the registry.
fn spawn_upstream_feeds(price_hub: &Arc<PriceHub>, registry: &Arc<Registry>, config: &Arc<Config>, matching: &Arc<MatchingEngine>) {
    let mut pairs: Vec<String> = registry
        .all_instruments()
        .into_iter()
        .map(|i| i.price_key)
        .collect();
    pairs.sort();
    pairs.dedup();

    if pairs.is_empty() {
        warn!("instrument registry is empty at boot, no upstream feeds will be started");
        return;
    }

    for base_url in &config.upstream_feed_urls {
        price_hub.spawn_feeds(base_url, &pairs, matching.clone());
    }
}

/// Runs the risk engine's daily-reset collaborator once per local calendar
/// day. Sleeps to the next local midnight, then resets on a 24h cadence; a
/// process restart simply re-aligns to the next midnight instead of firing
/// immediately.
fn spawn_daily_reset(risk: Arc<RiskEngine>) {
    tokio::spawn(async move {
        loop {
            let now = chrono::Local::now();
            let tomorrow_midnight = (now + chrono::Duration::days(1))
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always a valid time")
                .and_local_timezone(chrono::Local)
                .single()
                .unwrap_or_else(|| now + chrono::Duration::hours(24));
            let sleep_for = (tomorrow_midnight - now).to_std().unwrap_or(Duration::from_secs(24 * 3600));
            tokio::time::sleep(sleep_for).await;
            info!("running scheduled daily reset");
            risk.daily_reset().await;
        }
    });
}

async fn health_check() -> &'static str {
    "ok"
}

/// `tracing` + `tracing-subscriber` (env-filter + fmt layer), the same
/// composition the teacher's `init_tracing()` uses.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "propcore_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
