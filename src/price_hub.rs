//! Price Hub: ingests upstream exchange feeds, normalizes symbols, publishes
//! to the internal tick channel, writes the KV last-price hash and
//! tick-history ring, and throttle-broadcasts to downstream WebSocket clients.
//!
//! Grounded on `scrapers::polymarket_ws::PolymarketMarketWsCache` for the
//! upstream connection shape: one supervised `tokio-tungstenite` loop per
//! stream, exponential-backoff reconnect, a watchdog on message staleness.
//! This crate needs one such loop per `(symbol, stream class)` pair instead
//! of the teacher's single multiplexed connection, since each upstream pair
//! here is its own trade or depth stream URL.

use crate::config::Config;
use crate::event_bus::EventBus;
use crate::kv::{KvStore, PricePoint};
use crate::matching::{MatchingEngine, PriceSource};
use crate::models::{DepthSnapshot, Tick};
use crate::registry::Registry;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const WATCHDOG_IDLE_MS: u64 = 15_000;
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
const LAST_PRICE_FLUSH_MS: u64 = 200;
const TICK_PUSH_THROTTLE_MS: i64 = 1_000;
const ORDERBOOK_TTL_SECS: usize = 10;

/// One upstream trade-stream payload (`{p: price, T: ts, ...}`).
#[derive(Debug, Deserialize)]
struct TradePayload {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    ts: i64,
}

/// One upstream depth-stream payload (`{bids: [[p,q],...], asks: [...]}`).
#[derive(Debug, Deserialize)]
struct DepthPayload {
    #[serde(default)]
    bids: Vec<(String, String)>,
    #[serde(default)]
    asks: Vec<(String, String)>,
}

/// Process-wide token bucket for the downstream broadcast: at most
/// `MAX_BROADCAST_TPS` per 1s window, process-wide, excess dropped (not
/// queued). A relaxed atomic counter reset on a 1s ticker is sufficient —
/// it need not be exact under contention.
pub struct BroadcastLimiter {
    max_per_sec: u32,
    used: AtomicU32,
    dropped: AtomicU64,
}

impl BroadcastLimiter {
    pub fn new(max_per_sec: u32) -> Arc<Self> {
        let limiter = Arc::new(Self {
            max_per_sec,
            used: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
        });
        let reset = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                reset.used.store(0, Ordering::Relaxed);
            }
        });
        limiter
    }

    /// Returns `true` if the caller may broadcast this message.
    fn try_acquire(&self) -> bool {
        let prev = self.used.fetch_add(1, Ordering::Relaxed);
        if prev < self.max_per_sec {
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A downstream WS client's mailbox, registered by the WS layer
/// ([`crate::ws`]) and consulted here for the subscription + buffer-size
/// suppression rules.
pub trait BroadcastSink: Send + Sync {
    fn subscriptions(&self) -> Vec<String>;
    fn buffered_bytes(&self) -> usize;
    fn send(&self, payload: String);
}

const MAX_CLIENT_BUFFER_BYTES: usize = 1_000_000;

/// Fan-out registry of connected downstream clients. [`crate::ws`] registers
/// and unregisters clients as they connect/disconnect.
#[derive(Default)]
pub struct Broadcaster {
    clients: Mutex<HashMap<u64, Arc<dyn BroadcastSink>>>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, id: u64, sink: Arc<dyn BroadcastSink>) {
        self.clients.lock().await.insert(id, sink);
    }

    pub async fn unregister(&self, id: u64) {
        self.clients.lock().await.remove(&id);
    }

    /// Pushes `payload` (already serialized) to every client whose
    /// subscriptions admit `symbol`, skipping clients with a full send
    /// buffer.
    async fn push(&self, symbol: &str, payload: &str) {
        let clients = self.clients.lock().await;
        for sink in clients.values() {
            let subs = sink.subscriptions();
            if !subs.is_empty() && !subs.iter().any(|s| s == symbol) {
                continue;
            }
            if sink.buffered_bytes() > MAX_CLIENT_BUFFER_BYTES {
                continue;
            }
            sink.send(payload.to_string());
        }
    }

    /// Pushes to every client regardless of per-symbol subscription (used for
    /// channels without a symbol filter, e.g. account updates).
    pub async fn push_all(&self, payload: &str) {
        let clients = self.clients.lock().await;
        for sink in clients.values() {
            if sink.buffered_bytes() > MAX_CLIENT_BUFFER_BYTES {
                continue;
            }
            sink.send(payload.to_string());
        }
    }
}

pub struct PriceHub {
    registry: Arc<Registry>,
    kv: Option<Arc<KvStore>>,
    bus: Arc<EventBus>,
    broadcaster: Arc<Broadcaster>,
    limiter: Arc<BroadcastLimiter>,
    config: Arc<Config>,
    http: reqwest::Client,
    /// Last accepted `(price, ts_ms)` per symbol, consulted to suppress
    /// no-op broadcasts of an identical consecutive price.
    last_seen: Arc<Mutex<HashMap<String, (f64, i64)>>>,
    last_tick_push: Arc<Mutex<HashMap<String, i64>>>,
}

impl PriceHub {
    pub fn new(
        registry: Arc<Registry>,
        kv: Option<Arc<KvStore>>,
        bus: Arc<EventBus>,
        broadcaster: Arc<Broadcaster>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let limiter = BroadcastLimiter::new(config.max_broadcast_tps);
        Arc::new(Self {
            registry,
            kv,
            bus,
            broadcaster,
            limiter,
            config,
            http: reqwest::Client::new(),
            last_seen: Arc::new(Mutex::new(HashMap::new())),
            last_tick_push: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Spawns one supervised connection per `(pair, stream)` in
    /// `config.upstream_feed_urls` for the given symbols. `matching`
    /// receives every accepted tick via `process_tick`.
    pub fn spawn_feeds(self: &Arc<Self>, base_url: &str, pairs: &[String], matching: Arc<MatchingEngine>) {
        for pair in pairs {
            let hub = self.clone();
            let url = format!("{}/ws/{}@trade", base_url, pair.to_lowercase());
            let pair = pair.clone();
            let matching = matching.clone();
            tokio::spawn(async move {
                hub.run_trade_stream(url, pair, matching).await;
            });
        }
        for pair in pairs {
            let hub = self.clone();
            let url = format!("{}/ws/{}@depth10@100ms", base_url, pair.to_lowercase());
            let pair = pair.clone();
            tokio::spawn(async move {
                hub.run_depth_stream(url, pair).await;
            });
        }
    }

    /// Supervised loop: exponential-backoff reconnect capped at 30s, watchdog
    /// force-reconnect if idle >= 15s, re-marks feed health `up` on
    /// reconnect.
    async fn run_trade_stream(self: Arc<Self>, url: String, pair: String, matching: Arc<MatchingEngine>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.connect_trade_once(&url, &pair, &matching).await {
                Ok(()) => {
                    info!(pair, "trade stream ended cleanly, reconnecting");
                    backoff = Duration::from_secs(1);
                }
                Err(err) => {
                    warn!(pair, error = %err, backoff_s = backoff.as_secs(), "trade stream disconnected");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                }
            }
        }
    }

    async fn connect_trade_once(&self, url: &str, pair: &str, matching: &Arc<MatchingEngine>) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(pair, "feed up");
        metrics::gauge!("feed_health", "stream" => "trade", "pair" => pair.to_string()).set(1.0);
        let (_write, mut read) = ws_stream.split();

        loop {
            let msg = timeout(Duration::from_millis(WATCHDOG_IDLE_MS), read.next()).await;
            let Ok(msg) = msg else {
                metrics::gauge!("feed_health", "stream" => "trade", "pair" => pair.to_string()).set(0.0);
                anyhow::bail!("watchdog: no message within {WATCHDOG_IDLE_MS}ms");
            };
            let Some(msg) = msg else {
                anyhow::bail!("trade stream closed");
            };
            match msg? {
                Message::Text(text) => {
                    if let Ok(payload) = serde_json::from_str::<TradePayload>(&text) {
                        if let Ok(price) = payload.price.parse::<f64>() {
                            if price.is_finite() && price > 0.0 {
                                self.accept_trade(pair, price, payload.ts, matching).await;
                            }
                        }
                    }
                }
                Message::Close(_) => anyhow::bail!("trade stream sent close frame"),
                _ => {}
            }
        }
    }

    /// Publication contract: normalize, write KV, publish to the tick
    /// channel, feed the matching engine, throttle-broadcast.
    async fn accept_trade(&self, raw_symbol: &str, price: f64, ts: i64, matching: &Arc<MatchingEngine>) {
        let symbol = self.registry.normalize_symbol(raw_symbol);

        {
            let mut seen = self.last_seen.lock().await;
            if let Some((last_price, last_ts)) = seen.get(&symbol) {
                if *last_price == price && ts <= *last_ts {
                    return;
                }
            }
            seen.insert(symbol.clone(), (price, ts));
        }

        metrics::counter!("ticks_processed_total", "symbol" => symbol.clone()).increment(1);

        if let Some(kv) = &self.kv {
            let point = PricePoint { price, ts };
            if let Err(err) = kv.set_latest_price(&symbol, &point).await {
                warn!(symbol, error = %err, "failed to write latest_prices hash");
            }

            let mut pushes = self.last_tick_push.lock().await;
            let should_push = pushes
                .get(&symbol)
                .map(|last| ts - last >= TICK_PUSH_THROTTLE_MS)
                .unwrap_or(true);
            if should_push {
                pushes.insert(symbol.clone(), ts);
                drop(pushes);
                if let Err(err) = kv.push_tick(&symbol, &point, self.config.tick_history_limit as isize).await {
                    warn!(symbol, error = %err, "failed to push tick history");
                }
            }
        }

        self.bus.publish_tick(Tick { symbol: symbol.clone(), price, ts });

        // Matching and risk paths must never drop ticks, regardless of
        // broadcast pressure.
        matching.process_tick(&symbol, price).await;

        self.try_broadcast_price(&symbol, price, ts).await;
    }

    async fn try_broadcast_price(&self, symbol: &str, price: f64, ts: i64) {
        if !self.limiter.try_acquire() {
            return;
        }
        let payload = serde_json::json!({ "type": "price", "symbol": symbol, "price": price, "ts": ts });
        self.broadcaster.push(symbol, &payload.to_string()).await;
    }

    async fn run_depth_stream(self: Arc<Self>, url: String, pair: String) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.connect_depth_once(&url, &pair).await {
                Ok(()) => backoff = Duration::from_secs(1),
                Err(err) => {
                    warn!(pair, error = %err, "depth stream disconnected");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                }
            }
        }
    }

    async fn connect_depth_once(&self, url: &str, pair: &str) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        metrics::gauge!("feed_health", "stream" => "depth", "pair" => pair.to_string()).set(1.0);
        let (_write, mut read) = ws_stream.split();

        loop {
            let msg = timeout(Duration::from_millis(WATCHDOG_IDLE_MS), read.next()).await;
            let Ok(msg) = msg else {
                metrics::gauge!("feed_health", "stream" => "depth", "pair" => pair.to_string()).set(0.0);
                anyhow::bail!("watchdog: no depth message within {WATCHDOG_IDLE_MS}ms");
            };
            let Some(msg) = msg else {
                anyhow::bail!("depth stream closed");
            };
            if let Message::Text(text) = msg? {
                if let Ok(payload) = serde_json::from_str::<DepthPayload>(&text) {
                    self.accept_depth(pair, payload).await;
                }
            }
        }
    }

    /// Stores the snapshot under `orderbook:{symbol}` with a 10s TTL and
    /// emits on `orderbook_{symbol}`.
    async fn accept_depth(&self, raw_symbol: &str, payload: DepthPayload) {
        let symbol = self.registry.normalize_symbol(raw_symbol);
        let ts = chrono::Utc::now().timestamp_millis();

        let parse_levels = |levels: Vec<(String, String)>| -> Vec<(f64, f64)> {
            levels
                .into_iter()
                .filter_map(|(p, q)| Some((p.parse::<f64>().ok()?, q.parse::<f64>().ok()?)))
                .collect()
        };
        let snapshot = DepthSnapshot {
            symbol: symbol.clone(),
            bids: parse_levels(payload.bids),
            asks: parse_levels(payload.asks),
            ts,
        };

        if let Some(kv) = &self.kv {
            if let Err(err) = kv
                .set_orderbook(&symbol, &serde_json::json!(snapshot), ORDERBOOK_TTL_SECS)
                .await
            {
                warn!(symbol, error = %err, "failed to write orderbook snapshot");
            }
        }
        self.bus.publish_orderbook(snapshot.clone());

        let payload = serde_json::json!({ "type": "orderbook", "symbol": symbol, "bids": snapshot.bids, "asks": snapshot.asks, "ts": ts });
        self.broadcaster.push(&symbol, &payload.to_string()).await;
    }

    /// Flushes `latest_prices` to the KV hash every 200ms to coalesce bursts
    /// — a belt-and-braces periodic re-flush on top of the per-tick write,
    /// covering symbols that haven't ticked recently but whose cached value
    /// should still be kept warm in Redis.
    pub fn spawn_price_flush(self: &Arc<Self>) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(LAST_PRICE_FLUSH_MS));
            loop {
                ticker.tick().await;
                let Some(kv) = &hub.kv else { continue };
                let seen = hub.last_seen.lock().await.clone();
                for (symbol, (price, ts)) in seen {
                    if let Err(err) = kv.set_latest_price(&symbol, &PricePoint { price, ts }).await {
                        debug!(symbol, error = %err, "periodic latest_prices flush failed");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl PriceSource for PriceHub {
    /// Synchronous REST fallback for a stale/missing last price. Queries
    /// the upstream REST ticker endpoint directly rather than the WS stream.
    async fn fetch_price(&self, price_key: &str) -> anyhow::Result<f64> {
        let url = format!(
            "https://api.binance.com/api/v3/ticker/price?symbol={}",
            price_key.to_uppercase()
        );
        #[derive(Deserialize)]
        struct RestTicker {
            price: String,
        }
        let resp = self.http.get(&url).send().await?.json::<RestTicker>().await?;
        Ok(resp.price.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        subs: Vec<String>,
    }

    impl BroadcastSink for RecordingSink {
        fn subscriptions(&self) -> Vec<String> {
            self.subs.clone()
        }
        fn buffered_bytes(&self) -> usize {
            0
        }
        fn send(&self, payload: String) {
            self.sent.try_lock().unwrap().push(payload);
        }
    }

    #[tokio::test]
    async fn broadcaster_filters_by_subscription() {
        let broadcaster = Broadcaster::new();
        let btc_sink = Arc::new(RecordingSink { sent: Mutex::new(Vec::new()), subs: vec!["BTCUSD".into()] });
        let eth_sink = Arc::new(RecordingSink { sent: Mutex::new(Vec::new()), subs: vec!["ETHUSD".into()] });
        broadcaster.register(1, btc_sink.clone()).await;
        broadcaster.register(2, eth_sink.clone()).await;

        broadcaster.push("BTCUSD", "{\"type\":\"price\"}").await;

        assert_eq!(btc_sink.sent.lock().await.len(), 1);
        assert!(eth_sink.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn broadcaster_skips_full_buffer_clients() {
        struct FullSink;
        impl BroadcastSink for FullSink {
            fn subscriptions(&self) -> Vec<String> {
                vec![]
            }
            fn buffered_bytes(&self) -> usize {
                MAX_CLIENT_BUFFER_BYTES + 1
            }
            fn send(&self, _payload: String) {
                panic!("should have been skipped");
            }
        }
        let broadcaster = Broadcaster::new();
        broadcaster.register(1, Arc::new(FullSink)).await;
        broadcaster.push("BTCUSD", "{}").await;
    }

    #[test]
    fn limiter_drops_excess_within_window() {
        let limiter = Arc::new(BroadcastLimiter {
            max_per_sec: 20,
            used: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
        });
        let mut allowed = 0;
        for _ in 0..200 {
            if limiter.try_acquire() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
        assert_eq!(limiter.dropped_count(), 180);
    }
}
