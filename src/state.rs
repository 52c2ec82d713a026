//! Shared Trade State: the in-memory authoritative snapshot of accounts,
//! open trades and pending orders, plus the concurrency primitives matching
//! and risk serialize through.

use crate::models::{Account, OpenTrade, PendingOrder, SessionPnl};
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

struct Inner {
    accounts: HashMap<String, Account>,
    open_trades: HashMap<String, OpenTrade>,
    pending_orders: HashMap<String, PendingOrder>,
    /// account_id -> trade ids, so trades never hold a back-reference to
    /// their account, avoiding a cyclic trade/account graph.
    account_trades: HashMap<String, Vec<String>>,
    /// Per-account, per-calendar-day realized PnL accumulator. Rebuilt on
    /// day rollover by `roll_session`.
    sessions: HashMap<String, SessionPnl>,
    /// Last accepted `(price, ts_ms)` per symbol. Consulted by the risk
    /// engine's breach slippage model for symbols other than the one that
    /// carried the triggering tick, and by the matching engine's
    /// `PRICE_STALE_MS` check on market orders.
    marks: HashMap<String, (f64, i64)>,
}

/// Process-wide, mutex-guarded facade. One `parking_lot::Mutex` guards the
/// three maps for short critical sections; longer-lived serialization (fills,
/// closes) goes through the per-account async mutex registry instead.
pub struct SharedTradeState {
    inner: Mutex<Inner>,
    account_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Expiring duplicate-order hash set: entries evicted lazily after
    /// `DUPLICATE_ORDER_MS` on next lookup.
    recent_orders: DashMap<String, Instant>,
}

impl Default for SharedTradeState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedTradeState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                accounts: HashMap::new(),
                open_trades: HashMap::new(),
                pending_orders: HashMap::new(),
                account_trades: HashMap::new(),
                sessions: HashMap::new(),
                marks: HashMap::new(),
            }),
            account_locks: DashMap::new(),
            recent_orders: DashMap::new(),
        }
    }

    // -- read paths: copy-on-read snapshots, never iterate under a writer --

    pub fn get_accounts(&self) -> Vec<Account> {
        self.inner.lock().accounts.values().cloned().collect()
    }

    pub fn get_account(&self, id: &str) -> Option<Account> {
        self.inner.lock().accounts.get(id).cloned()
    }

    pub fn get_open_trades(&self) -> Vec<OpenTrade> {
        self.inner.lock().open_trades.values().cloned().collect()
    }

    pub fn get_open_trades_for_symbol(&self, symbol: &str) -> Vec<OpenTrade> {
        self.inner
            .lock()
            .open_trades
            .values()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn get_open_trades_for_account(&self, account_id: &str) -> Vec<OpenTrade> {
        let inner = self.inner.lock();
        let Some(ids) = inner.account_trades.get(account_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.open_trades.get(id).cloned())
            .collect()
    }

    pub fn get_pending_orders(&self) -> Vec<PendingOrder> {
        self.inner.lock().pending_orders.values().cloned().collect()
    }

    pub fn get_pending_orders_for_symbol(&self, symbol: &str) -> Vec<PendingOrder> {
        self.inner
            .lock()
            .pending_orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    // -- mutators --

    pub fn upsert_account(&self, account: Account) {
        self.inner.lock().accounts.insert(account.id.clone(), account);
    }

    /// Applies `patch` to the account under the lock and returns the updated
    /// copy, or `None` if the account does not exist.
    pub fn update_account(&self, id: &str, patch: impl FnOnce(&mut Account)) -> Option<Account> {
        let mut inner = self.inner.lock();
        let account = inner.accounts.get_mut(id)?;
        patch(account);
        Some(account.clone())
    }

    pub fn add_pending_order(&self, order: PendingOrder) {
        self.inner.lock().pending_orders.insert(order.id.clone(), order);
    }

    pub fn remove_pending_order(&self, id: &str) -> Option<PendingOrder> {
        self.inner.lock().pending_orders.remove(id)
    }

    pub fn add_open_trade(&self, trade: OpenTrade) {
        let mut inner = self.inner.lock();
        inner
            .account_trades
            .entry(trade.account_id.clone())
            .or_default()
            .push(trade.id.clone());
        inner.open_trades.insert(trade.id.clone(), trade);
    }

    pub fn remove_open_trade(&self, id: &str) -> Option<OpenTrade> {
        let mut inner = self.inner.lock();
        let trade = inner.open_trades.remove(id)?;
        if let Some(ids) = inner.account_trades.get_mut(&trade.account_id) {
            ids.retain(|t| t != id);
        }
        Some(trade)
    }

    // -- per-account serialization --

    /// Non-reentrant async mutex keyed by `account_id`, held only around
    /// fill/close. The registry entry itself is cheap and never evicted —
    /// account ids are bounded and long-lived.
    pub fn account_lock(&self, account_id: &str) -> Arc<AsyncMutex<()>> {
        self.account_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    // -- mark cache --

    pub fn set_mark(&self, symbol: &str, price: f64, ts_ms: i64) {
        self.inner.lock().marks.insert(symbol.to_string(), (price, ts_ms));
    }

    pub fn get_mark(&self, symbol: &str) -> Option<f64> {
        self.inner.lock().marks.get(symbol).map(|(p, _)| *p)
    }

    pub fn get_mark_with_age(&self, symbol: &str, now_ms: i64) -> Option<(f64, i64)> {
        self.inner
            .lock()
            .marks
            .get(symbol)
            .map(|(p, ts)| (*p, now_ms - ts))
    }

    // -- session PnL --

    /// Returns the account's current-day session accumulator, rolling it
    /// over to a fresh zeroed one first if `today` differs from the
    /// account's `session_day`. The account's own `session_day` is the
    /// authoritative rollover clock; this map just mirrors it.
    pub fn session_for_day(&self, account_id: &str, today: NaiveDate) -> SessionPnl {
        let mut inner = self.inner.lock();
        let carry_forward = inner
            .accounts
            .get(account_id)
            .map(|a| (a.session_day, a.total_profit, a.best_day_profit))
            .unwrap_or((today, 0.0, 0.0));
        let session = inner
            .sessions
            .entry(account_id.to_string())
            .or_insert_with(|| SessionPnl {
                realized: 0.0,
                best_day: carry_forward.2,
                total: carry_forward.1,
            });
        if carry_forward.0 != today {
            session.realized = 0.0;
        }
        session.clone()
    }

    pub fn update_session(&self, account_id: &str, patch: impl FnOnce(&mut SessionPnl)) -> SessionPnl {
        let mut inner = self.inner.lock();
        let session = inner.sessions.entry(account_id.to_string()).or_default();
        patch(session);
        session.clone()
    }

    // -- duplicate-order suppression --

    /// Returns `true` if `key` was seen within the last `ttl`; records `key`
    /// as seen either way. Stale entries are evicted lazily on lookup rather
    /// than by a background sweep, since the set only matters hot.
    pub fn check_and_record_duplicate(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        if let Some(entry) = self.recent_orders.get(key) {
            if now.duration_since(*entry) < ttl {
                return true;
            }
        }
        self.recent_orders.insert(key.to_string(), now);
        false
    }
}
