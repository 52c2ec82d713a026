//! Risk Engine: pre-trade gate, post-fill immediate gate, per-tick account
//! evaluator, breach liquidation, consistency/profit-target transitions, and
//! daily reset. Grounded on the teacher's `risk.rs` for the shape of a
//! stateful risk manager with a tagged-outcome API, generalized from
//! Kelly/VaR position sizing to a prop-firm rule matrix.
//!
//! Circular-dependency resolution: the matching engine is a *direct*
//! dependency here (pre-trade/post-fill checks are called by it
//! synchronously), but the reverse edge — the risk engine closing a trade —
//! is never a direct import. [`TradeCloser`] is injected at boot instead.

use crate::errors::{RiskErrorCode, RiskResult};
use crate::event_bus::EventBus;
use crate::models::{Account, AccountStatus, ExitReason, OpenTrade, TrailingDdMode};
use crate::registry::Registry;
use crate::state::SharedTradeState;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Injected function value through which the risk engine closes positions
/// without importing the matching engine directly.
#[async_trait]
pub trait TradeCloser: Send + Sync {
    async fn close_trade(&self, trade: OpenTrade, close_price: f64, reason: ExitReason);
}

pub struct RiskEngine {
    registry: Arc<Registry>,
    state: Arc<SharedTradeState>,
    store: Arc<Store>,
    #[allow(dead_code)]
    bus: Arc<EventBus>,
    closer: Arc<dyn TradeCloser>,
}

impl RiskEngine {
    pub fn new(
        registry: Arc<Registry>,
        state: Arc<SharedTradeState>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        closer: Arc<dyn TradeCloser>,
    ) -> Self {
        Self {
            registry,
            state,
            store,
            bus,
            closer,
        }
    }

    /// Pure function over a fresh account fetch + instrument metadata.
    /// Never mutates state.
    pub fn pre_trade_risk_check(
        &self,
        account_id: &str,
        symbol: &str,
        quantity: f64,
        now: DateTime<Utc>,
    ) -> RiskResult<()> {
        let account = self
            .state
            .get_account(account_id)
            .ok_or(RiskErrorCode::AccountNotFound)?;
        self.check_account_active(&account)?;

        let instrument = self
            .registry
            .get_contract(symbol)
            .ok_or(RiskErrorCode::SymbolNotSupported)?;

        if !self.registry.is_within_trading_hours(symbol, now) {
            return Err(RiskErrorCode::MarketClosed);
        }

        if !instrument.is_valid_lot(quantity) {
            return Err(RiskErrorCode::InvalidLotSize);
        }
        if quantity > instrument.max_lots_for(account.tier) {
            return Err(RiskErrorCode::MaxLotSize);
        }

        let today = now.date_naive();
        let session = self.state.session_for_day(account_id, today);
        if session.realized <= -account.daily_loss_limit {
            return Err(RiskErrorCode::DailyLossLimit);
        }

        Ok(())
    }

    /// Same account fetch, plus max-loss and trailing-DD tests against the
    /// *hypothetical post-fill* balance. Invoked once after fill latency,
    /// before the trade is written.
    pub fn evaluate_immediate_risk(
        &self,
        account_id: &str,
        symbol: &str,
        quantity: f64,
        hypothetical_balance: f64,
    ) -> RiskResult<()> {
        let account = self
            .state
            .get_account(account_id)
            .ok_or(RiskErrorCode::AccountNotFound)?;
        self.check_account_active(&account)?;

        let instrument = self
            .registry
            .get_contract(symbol)
            .ok_or(RiskErrorCode::SymbolNotSupported)?;
        if !instrument.is_valid_lot(quantity) {
            return Err(RiskErrorCode::InvalidLotSize);
        }
        if quantity > instrument.max_lots_for(account.tier) {
            return Err(RiskErrorCode::MaxLotSize);
        }

        if hypothetical_balance <= account.start_balance - account.max_loss {
            return Err(RiskErrorCode::MaxLoss);
        }

        let floor = trailing_dd_floor(&account);
        if hypothetical_balance <= floor {
            return Err(RiskErrorCode::TrailingDrawdown);
        }

        Ok(())
    }

    fn check_account_active(&self, account: &Account) -> RiskResult<()> {
        if !account.is_active() {
            return Err(RiskErrorCode::AccountInactive);
        }
        Ok(())
    }

    /// Per-tick evaluator. Iterates every account and applies the rule
    /// matrix; breaches hand off to [`Self::handle_breach`], which
    /// closes positions independently of the tick that caused the breach
    /// (never recurses into the matching engine's `processTick`).
    pub async fn evaluate_open_positions(&self, symbol: &str, price: f64) {
        let now = Utc::now();
        self.state.set_mark(symbol, price, now.timestamp_millis());
        let today = now.date_naive();

        for account in self.state.get_accounts() {
            if !account.is_active() {
                continue;
            }

            let Some(account) = self.state.update_account(&account.id, update_peak) else {
                continue;
            };

            if account.current_balance <= account.start_balance - account.max_loss {
                self.handle_breach(&account.id, ExitReason::MaxLoss, symbol, price).await;
                continue;
            }

            let session = self.state.session_for_day(&account.id, today);
            if session.realized <= -account.daily_loss_limit {
                self.handle_breach(&account.id, ExitReason::DailyLossLimit, symbol, price).await;
                continue;
            }

            if account.start_of_day_equity - account.current_balance >= account.max_intraday_loss {
                self.handle_breach(&account.id, ExitReason::MaxIntradayLoss, symbol, price).await;
                continue;
            }

            let floor = trailing_dd_floor(&account);
            if account.current_balance <= floor {
                self.handle_breach(&account.id, ExitReason::TrailingDrawdown, symbol, price).await;
                continue;
            }

            self.evaluate_consistency_and_target(&account).await;
        }
    }

    async fn evaluate_consistency_and_target(&self, account: &Account) {
        let mut consistency_now = account.consistency_flag;
        if !consistency_now && account.best_day_profit > 0.5 * account.profit_target {
            consistency_now = true;
            self.state.update_account(&account.id, |a| a.consistency_flag = true);
            self.audit("CONSISTENCY_FLAGGED", &account.id, json!({})).await;
        }

        if !consistency_now && account.total_profit >= account.profit_target {
            self.state.update_account(&account.id, |a| {
                a.status = AccountStatus::Passed;
                a.trailing_dd_mode = TrailingDdMode::Frozen;
            });
            if let Some(updated) = self.state.get_account(&account.id) {
                let _ = self.store.upsert_account(&updated).await;
            }
            info!(account_id = %account.id, "account passed, trailing drawdown frozen");
            self.audit("ACCOUNT_PASSED", &account.id, json!({})).await;
        }
    }

    /// Updates the account row with the new status and reason before
    /// closing positions, then closes every open trade with a
    /// slippage-adjusted exit price. The close loop runs after this
    /// returns, not recursively inside tick processing.
    async fn handle_breach(&self, account_id: &str, reason: ExitReason, tick_symbol: &str, tick_price: f64) {
        let Some(account) = self.state.update_account(account_id, |a| {
            a.status = AccountStatus::Blown;
            a.blown_reason = Some(reason.to_string());
        }) else {
            return;
        };
        let _ = self.store.upsert_account(&account).await;
        warn!(account_id, reason = %reason.to_string(), "account blown, liquidating");
        self.audit("ACCOUNT_BLOWN", account_id, json!({ "reason": reason.to_string() })).await;

        for trade in self.state.get_open_trades_for_account(account_id) {
            let mark = if trade.symbol == tick_symbol {
                tick_price
            } else {
                self.state.get_mark(&trade.symbol).unwrap_or(trade.entry_price)
            };
            let exit_price = apply_breach_slippage(&account, &trade, mark);
            self.closer.close_trade(trade, exit_price, reason).await;
        }
    }

    /// Daily-reset collaborator, called by a scheduled job at local-day
    /// rollover. Force-closes overnight positions only for instruments
    /// flagged `force_close_on_reset`.
    pub async fn daily_reset(&self) {
        let today = Utc::now().date_naive();
        for account in self.state.get_accounts() {
            for trade in self.state.get_open_trades_for_account(&account.id) {
                let force_close = self
                    .registry
                    .get_contract(&trade.symbol)
                    .map(|i| i.force_close_on_reset)
                    .unwrap_or(false);
                if force_close {
                    let mark = self.state.get_mark(&trade.symbol).unwrap_or(trade.entry_price);
                    self.closer.close_trade(trade, mark, ExitReason::DailyReset).await;
                }
            }

            self.state.update_account(&account.id, |a| {
                a.session_day = today;
                a.start_of_day_equity = a.current_balance;
            });
            self.state.update_session(&account.id, |s| {
                s.realized = 0.0;
            });
            if let Some(updated) = self.state.get_account(&account.id) {
                let _ = self.store.upsert_account(&updated).await;
            }
            self.audit("DAILY_RESET", &account.id, json!({})).await;
        }
    }

    async fn audit(&self, event: &str, account_id: &str, mut payload: serde_json::Value) {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("account_id".to_string(), json!(account_id));
        }
        if let Err(err) = self.store.audit(event, payload).await {
            warn!(error = %err, event, "failed to write trade_audit_logs row");
        }
    }
}

/// While the account is LIVE, the peak advances with current balance. Once
/// `passed`/`Frozen`, the peak is fixed.
fn update_peak(account: &mut Account) {
    if account.trailing_dd_mode == TrailingDdMode::Live && account.current_balance > account.peak_balance {
        account.peak_balance = account.current_balance;
    }
}

/// `ddFloor = max(start_balance - trail_drawdown, peak - trail_drawdown)`
/// while LIVE; `peak - trail_drawdown` once FROZEN (peak no longer advances).
fn trailing_dd_floor(account: &Account) -> f64 {
    let peak = account.peak_balance.max(account.start_balance);
    match account.trailing_dd_mode {
        TrailingDdMode::Live => {
            (account.start_balance - account.trail_drawdown).max(peak - account.trail_drawdown)
        }
        TrailingDdMode::Frozen => peak - account.trail_drawdown,
    }
}

/// Breach-only slippage model: normal SL/TP exits use the raw tick price
/// directly; this one is strictly worse for the account, modeling a forced
/// liquidation eating through the book.
fn apply_breach_slippage(account: &Account, trade: &OpenTrade, mark: f64) -> f64 {
    let slippage = trade.entry_price * 0.0001 + account.liquidity_gap * 0.25;
    match trade.side {
        crate::models::Side::Buy => mark - slippage,
        crate::models::Side::Sell => mark + slippage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Side, Tier};
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingCloser {
        closed: AsyncMutex<Vec<(String, f64, ExitReason)>>,
    }

    #[async_trait]
    impl TradeCloser for RecordingCloser {
        async fn close_trade(&self, trade: OpenTrade, close_price: f64, reason: ExitReason) {
            self.closed.lock().await.push((trade.id, close_price, reason));
        }
    }

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            tier: Tier::Evaluation,
            status: AccountStatus::Active,
            start_balance: 100_000.0,
            current_balance: 100_000.0,
            peak_balance: 100_000.0,
            max_loss: 10_000.0,
            daily_loss_limit: 5_000.0,
            max_intraday_loss: 1_000.0,
            trail_drawdown: 2_000.0,
            trailing_dd_mode: TrailingDdMode::Live,
            profit_target: 3_000.0,
            total_profit: 0.0,
            best_day_profit: 0.0,
            consistency_flag: false,
            start_of_day_equity: 100_000.0,
            session_day: Utc::now().date_naive(),
            liquidity_gap: 0.0,
            blown_reason: None,
        }
    }

    fn engine(state: Arc<SharedTradeState>, closer: Arc<dyn TradeCloser>) -> RiskEngine {
        RiskEngine::new(
            Arc::new(Registry::new(HashMap::new())),
            state,
            Arc::new(Store::new(":memory:").unwrap()),
            Arc::new(EventBus::new()),
            closer,
        )
    }

    #[tokio::test]
    async fn max_intraday_loss_breach_closes_open_trades() {
        let state = Arc::new(SharedTradeState::new());
        let mut a = account("a1");
        a.max_intraday_loss = 80.0;
        a.current_balance = 99_900.0; // 100 loss so far, over 80 MIL
        state.upsert_account(a);
        state.add_open_trade(OpenTrade {
            id: "t1".into(),
            account_id: "a1".into(),
            symbol: "BTCUSD".into(),
            side: Side::Buy,
            quantity: 0.1,
            entry_price: 30000.0,
            stop_loss: None,
            take_profit: None,
            time_opened: Utc::now(),
            pnl: -5.0,
            order_id: "o1".into(),
        });

        let closer = Arc::new(RecordingCloser { closed: AsyncMutex::new(Vec::new()) });
        let engine = engine(state.clone(), closer.clone());
        engine.evaluate_open_positions("BTCUSD", 29400.0).await;

        let updated = state.get_account("a1").unwrap();
        assert_eq!(updated.status, AccountStatus::Blown);
        assert_eq!(updated.blown_reason.as_deref(), Some("MAX_INTRADAY_LOSS"));
        assert_eq!(closer.closed.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn below_threshold_intraday_loss_does_not_blow_account() {
        let state = Arc::new(SharedTradeState::new());
        let mut a = account("a2");
        a.max_intraday_loss = 1000.0;
        a.current_balance = 99_900.0;
        state.upsert_account(a);

        let closer = Arc::new(RecordingCloser { closed: AsyncMutex::new(Vec::new()) });
        let engine = engine(state.clone(), closer.clone());
        engine.evaluate_open_positions("BTCUSD", 29400.0).await;

        let updated = state.get_account("a2").unwrap();
        assert_eq!(updated.status, AccountStatus::Active);
        assert!(closer.closed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn profit_target_passes_and_freezes_trailing_dd() {
        let state = Arc::new(SharedTradeState::new());
        let mut a = account("a3");
        a.trail_drawdown = 2_000.0;
        a.profit_target = 3_000.0;
        a.current_balance = 103_500.0;
        a.peak_balance = 103_500.0;
        a.total_profit = 3_500.0;
        a.best_day_profit = 1_000.0; // below half of target, no consistency flag
        state.upsert_account(a);

        let closer = Arc::new(RecordingCloser { closed: AsyncMutex::new(Vec::new()) });
        let engine = engine(state.clone(), closer);
        engine.evaluate_open_positions("BTCUSD", 30000.0).await;

        let updated = state.get_account("a3").unwrap();
        assert_eq!(updated.status, AccountStatus::Passed);
        assert_eq!(updated.trailing_dd_mode, TrailingDdMode::Frozen);

        let floor_before = trailing_dd_floor(&updated);
        let mut frozen = updated.clone();
        frozen.peak_balance = 110_000.0; // hypothetical later increase
        assert_eq!(trailing_dd_floor(&frozen), floor_before.max(110_000.0 - 2_000.0));
    }

    #[test]
    fn pre_trade_rejects_inactive_account() {
        let state = Arc::new(SharedTradeState::new());
        let mut a = account("a4");
        a.status = AccountStatus::Blown;
        state.upsert_account(a);
        let closer = Arc::new(RecordingCloser { closed: AsyncMutex::new(Vec::new()) });
        let engine = engine(state, closer);
        let err = engine
            .pre_trade_risk_check("a4", "BTCUSD", 0.01, Utc::now())
            .unwrap_err();
        assert_eq!(err, RiskErrorCode::AccountInactive);
    }
}
