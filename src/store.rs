//! Relational store: durable accounts/instruments/orders/trades/audit rows.
//!
//! Grounded on `vault::user_accounts::UserAccountsDB` — a `rusqlite`
//! connection behind `Arc<tokio::sync::Mutex<_>>`, `new()` creating tables +
//! indexes, manual row mapping. The schema itself is an out-of-scope
//! external contract; this module only needs to read/write rows in the
//! shapes the rest of the crate expects.

use crate::models::{Account, ClosedTrade, Instrument, PendingOrder};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                status TEXT NOT NULL,
                start_balance REAL NOT NULL,
                current_balance REAL NOT NULL,
                peak_balance REAL NOT NULL,
                max_loss REAL NOT NULL,
                daily_loss_limit REAL NOT NULL,
                max_intraday_loss REAL NOT NULL,
                trail_drawdown REAL NOT NULL,
                trailing_dd_mode TEXT NOT NULL,
                profit_target REAL NOT NULL,
                total_profit REAL NOT NULL,
                best_day_profit REAL NOT NULL,
                consistency_flag INTEGER NOT NULL,
                start_of_day_equity REAL NOT NULL,
                session_day TEXT NOT NULL,
                liquidity_gap REAL NOT NULL DEFAULT 0,
                blown_reason TEXT
            );
            CREATE TABLE IF NOT EXISTS instruments (
                symbol TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                is_open INTEGER NOT NULL,
                time_opened TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trade_audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_account ON trades(account_id);
            CREATE INDEX IF NOT EXISTS idx_orders_account ON orders(account_id);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn upsert_account(&self, account: &Account) -> anyhow::Result<()> {
        let account = account.clone();
        self.with_retry(move |conn| {
            conn.execute(
                r#"INSERT INTO accounts (
                    id, tier, status, start_balance, current_balance, peak_balance,
                    max_loss, daily_loss_limit, max_intraday_loss, trail_drawdown,
                    trailing_dd_mode, profit_target, total_profit, best_day_profit,
                    consistency_flag, start_of_day_equity, session_day, liquidity_gap,
                    blown_reason
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
                ON CONFLICT(id) DO UPDATE SET
                    status=excluded.status, current_balance=excluded.current_balance,
                    peak_balance=excluded.peak_balance, trailing_dd_mode=excluded.trailing_dd_mode,
                    total_profit=excluded.total_profit, best_day_profit=excluded.best_day_profit,
                    consistency_flag=excluded.consistency_flag,
                    start_of_day_equity=excluded.start_of_day_equity,
                    session_day=excluded.session_day, liquidity_gap=excluded.liquidity_gap,
                    blown_reason=excluded.blown_reason"#,
                params![
                    account.id,
                    serde_json::to_string(&account.tier)?,
                    serde_json::to_string(&account.status)?,
                    account.start_balance,
                    account.current_balance,
                    account.peak_balance,
                    account.max_loss,
                    account.daily_loss_limit,
                    account.max_intraday_loss,
                    account.trail_drawdown,
                    serde_json::to_string(&account.trailing_dd_mode)?,
                    account.profit_target,
                    account.total_profit,
                    account.best_day_profit,
                    account.consistency_flag as i64,
                    account.start_of_day_equity,
                    account.session_day.to_string(),
                    account.liquidity_gap,
                    account.blown_reason,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_pending_order(&self, order: &PendingOrder) -> anyhow::Result<()> {
        let order = order.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO orders (id, account_id, payload, status, created_at) VALUES (?1,?2,?3,?4,?5)",
                params![
                    order.id,
                    order.account_id,
                    serde_json::to_string(&order)?,
                    "pending",
                    order.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_order_status(&self, order_id: &str, status: &str) -> anyhow::Result<()> {
        let order_id = order_id.to_string();
        let status = status.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE orders SET status = ?1 WHERE id = ?2",
                params![status, order_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_trade(&self, payload: &Value, account_id: &str, trade_id: &str, time_opened: &str) -> anyhow::Result<()> {
        let payload = payload.clone();
        let account_id = account_id.to_string();
        let trade_id = trade_id.to_string();
        let time_opened = time_opened.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trades (id, account_id, payload, is_open, time_opened) VALUES (?1,?2,?3,1,?4)",
                params![trade_id, account_id, serde_json::to_string(&payload)?, time_opened],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn close_trade(&self, closed: &ClosedTrade) -> anyhow::Result<()> {
        let closed = closed.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE trades SET payload = ?1, is_open = 0 WHERE id = ?2",
                params![serde_json::to_string(&closed)?, closed.id],
            )?;
            Ok(())
        })
        .await
    }

    /// `trade_audit_logs` row: `{event, payload, created_at}`.
    pub async fn audit(&self, event: &str, payload: Value) -> anyhow::Result<()> {
        let event = event.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO trade_audit_logs (event, payload, created_at) VALUES (?1,?2,?3)",
                params![event, serde_json::to_string(&payload)?, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn fetch_active_instruments(&self) -> anyhow::Result<Vec<Instrument>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM instruments")?;
            let rows = stmt
                .query_map([], |row| {
                    let payload: String = row.get(0)?;
                    Ok(payload)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let instruments = rows
                .into_iter()
                .filter_map(|p| serde_json::from_str::<Instrument>(&p).ok())
                .collect();
            Ok(instruments)
        })
        .await
    }

    /// Runs `f` against the connection, retrying up to 5 times with
    /// `300ms * 2^n` capped backoff on transient `rusqlite` errors.
    async fn with_retry<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        const MAX_ATTEMPTS: u32 = 5;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let conn = self.conn.lock().await;
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(err) if attempt < MAX_ATTEMPTS => {
                    let backoff = Duration::from_millis(300 * 2u64.pow(attempt.min(4) - 1)).min(Duration::from_secs(5));
                    warn!(attempt, error = %err, backoff_ms = backoff.as_millis() as u64, "store write failed, retrying");
                    drop(conn);
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::registry::InstrumentSource for Store {
    async fn fetch_active(&self) -> anyhow::Result<Vec<Instrument>> {
        self.fetch_active_instruments().await
    }
}
