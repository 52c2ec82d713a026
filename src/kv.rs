//! Key-value store: last-price cache, tick history ring, depth snapshots,
//! idempotency keys, and pub/sub channels. Backed by `redis` with the
//! `connection-manager` feature, which transparently reconnects — the
//! crate's single concession to not hand-rolling the reconnect logic the
//! teacher writes from scratch for WS feeds, since redis's own client
//! already does it correctly.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;

/// The idempotency-key claim/confirm pair the matching engine needs, pulled
/// out as a trait so tests can wire an in-memory fake instead of a live
/// Redis connection.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn claim_idempotency_key(&self, key: &str, placeholder: &str, ttl_secs: usize) -> anyhow::Result<Option<String>>;
    async fn confirm_idempotency_key(&self, key: &str, order_id: &str, ttl_secs: usize) -> anyhow::Result<()>;
}

pub struct KvStore {
    conn: ConnectionManager,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricePoint {
    pub price: f64,
    pub ts: i64,
}

impl KvStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Hash `latest_prices` field `{symbol} -> JSON {price, ts}`. Callers
    /// batch this every 200ms to coalesce bursts.
    pub async fn set_latest_price(&self, symbol: &str, point: &PricePoint) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(point)?;
        let _: () = conn.hset("latest_prices", symbol, payload).await?;
        Ok(())
    }

    pub async fn get_latest_prices(&self) -> anyhow::Result<std::collections::HashMap<String, PricePoint>> {
        let mut conn = self.conn.clone();
        let raw: std::collections::HashMap<String, String> = conn.hgetall("latest_prices").await?;
        Ok(raw
            .into_iter()
            .filter_map(|(symbol, payload)| serde_json::from_str(&payload).ok().map(|p| (symbol, p)))
            .collect())
    }

    /// Left-pushes `{ts, price}` to `ticks:{symbol}` and trims to 1000,
    /// keeping the ring at a fixed cap.
    pub async fn push_tick(&self, symbol: &str, point: &PricePoint, cap: isize) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = format!("ticks:{symbol}");
        let payload = serde_json::to_string(point)?;
        let _: () = conn.lpush(&key, payload).await?;
        let _: () = conn.ltrim(&key, 0, cap - 1).await?;
        Ok(())
    }

    /// `orderbook:{symbol}` JSON with a 10s TTL.
    pub async fn set_orderbook(&self, symbol: &str, payload: &serde_json::Value, ttl_secs: usize) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = format!("orderbook:{symbol}");
        let _: () = conn.set_ex(key, payload.to_string(), ttl_secs as u64).await?;
        Ok(())
    }

    /// Reads back the depth snapshot `set_orderbook` wrote, or `None` once
    /// it has expired or was never published.
    pub async fn get_orderbook(&self, symbol: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let key = format!("orderbook:{symbol}");
        let raw: Option<String> = conn.get(&key).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// `audit:orders` left-pushed, trimmed to 10000.
    pub async fn push_audit(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush("audit:orders", payload.to_string()).await?;
        let _: () = conn.ltrim("audit:orders", 0, 9999).await?;
        Ok(())
    }

    pub async fn publish(&self, channel: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload.to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for KvStore {
    /// `idem:{key} -> order_id` with a 300s TTL. Returns the existing order
    /// id if the key is already claimed, else claims it with `placeholder`
    /// (the caller doesn't know the real order id yet at claim time; it
    /// overwrites the placeholder via `confirm_idempotency_key` once the
    /// order is actually created).
    async fn claim_idempotency_key(&self, key: &str, placeholder: &str, ttl_secs: usize) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let redis_key = format!("idem:{key}");
        let existing: Option<String> = conn.get(&redis_key).await?;
        if let Some(existing) = existing {
            return Ok(Some(existing));
        }
        let _: () = conn.set_ex(&redis_key, placeholder, ttl_secs as u64).await?;
        Ok(None)
    }

    /// Overwrites `idem:{key}` with the real order id once it exists,
    /// preserving the original TTL window so a second submission within it
    /// resolves to the order id the first caller actually received.
    async fn confirm_idempotency_key(&self, key: &str, order_id: &str, ttl_secs: usize) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let redis_key = format!("idem:{key}");
        let _: () = conn.set_ex(&redis_key, order_id, ttl_secs as u64).await?;
        Ok(())
    }
}
