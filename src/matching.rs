//! Matching Engine: reacts to ticks, matches pending limit orders, triggers
//! SL/TP, executes fills with latency/spread/slippage and commission, and
//! persists the result. Grounded on the teacher's `vault::trade_executor`
//! for the "apply cost model, then write state, then emit events" shape,
//! generalized from a single paper-trading ledger to the full
//! tick → match → fill → close pipeline.

use crate::config::Config;
use crate::errors::RiskErrorCode;
use crate::event_bus::{AccountUpnlEvent, EventBus, OrderEvent, OrderEventKind, TradeEvent, TradeEventKind};
use crate::kv::IdempotencyStore;
use crate::models::{ClosedTrade, ExitReason, Instrument, OpenTrade, OrderStatus, OrderType, PendingOrder, Side};
use crate::registry::Registry;
use crate::risk::{RiskEngine, TradeCloser};
use crate::state::SharedTradeState;
use crate::store::Store;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const IDEMPOTENCY_TTL_SECS: usize = 300;

/// Synchronous REST fallback for a stale/missing last price. The
/// upstream-feed contract is injected so the matching engine never
/// hardcodes a venue; [`crate::price_hub`] supplies a real implementation,
/// tests supply a fixture.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_price(&self, price_key: &str) -> anyhow::Result<f64>;
}

#[derive(Debug, Clone)]
pub struct NewOrderRequest {
    pub account_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug)]
pub enum PlaceOrderOutcome {
    Filled(OpenTrade),
    Pending(PendingOrder),
    Duplicate(String),
    Rejected(RiskErrorCode),
}

pub struct MatchingEngine {
    registry: Arc<Registry>,
    state: Arc<SharedTradeState>,
    store: Arc<Store>,
    /// Consulted only for the idempotency-key claim; deployments that don't
    /// wire a KV store (tests, backtests) simply skip that dedup layer.
    kv: Option<Arc<dyn crate::kv::IdempotencyStore>>,
    bus: Arc<EventBus>,
    config: Arc<Config>,
    price_source: Option<Arc<dyn PriceSource>>,
    /// Set once at boot, right after [`RiskEngine`] is constructed with this
    /// engine as its [`TradeCloser`], to avoid a direct import cycle.
    risk: ArcSwapOption<RiskEngine>,
}

impl MatchingEngine {
    pub fn new(
        registry: Arc<Registry>,
        state: Arc<SharedTradeState>,
        store: Arc<Store>,
        kv: Option<Arc<dyn crate::kv::IdempotencyStore>>,
        bus: Arc<EventBus>,
        config: Arc<Config>,
        price_source: Option<Arc<dyn PriceSource>>,
    ) -> Self {
        Self {
            registry,
            state,
            store,
            kv,
            bus,
            config,
            price_source,
            risk: ArcSwapOption::empty(),
        }
    }

    pub fn attach_risk_engine(&self, risk: Arc<RiskEngine>) {
        self.risk.store(Some(risk));
    }

    fn risk(&self) -> Arc<RiskEngine> {
        self.risk
            .load_full()
            .expect("risk engine must be attached before the matching engine is used")
    }

    // ---- tick handling ----

    /// Invoked for every accepted tick. Steps run in this exact order so a
    /// single tick cannot both fill a limit order and then trigger its own
    /// SL.
    pub async fn process_tick(&self, symbol: &str, price: f64) {
        let now = Utc::now();
        let prev_price = self.state.get_mark(symbol);
        self.state.set_mark(symbol, price, now.timestamp_millis());

        self.refresh_unrealized_pnl(symbol, price);

        let prev_price = prev_price.unwrap_or(price);
        for order in self.state.get_pending_orders_for_symbol(symbol) {
            if Self::limit_fill_eligible(&order, price) {
                self.fill_order(order, price, prev_price).await;
            }
        }

        for trade in self.state.get_open_trades_for_symbol(symbol) {
            if trade.age_ms(now) < self.config.sltp_grace_ms {
                continue;
            }
            if let Some((reason, barrier_price)) = sl_tp_trigger(&trade, price) {
                self.close_trade(trade, barrier_price, reason).await;
            }
        }

        self.risk().evaluate_open_positions(symbol, price).await;
    }

    fn limit_fill_eligible(order: &PendingOrder, price: f64) -> bool {
        let Some(limit) = order.limit_price else { return false };
        match order.side {
            Side::Buy => price <= limit,
            Side::Sell => price >= limit,
        }
    }

    /// Purely observational: aggregates per-account unrealized PnL and
    /// emits `account_upnl`, never persisted.
    fn refresh_unrealized_pnl(&self, symbol: &str, price: f64) {
        let Some(instrument) = self.registry.get_contract(symbol) else { return };
        let mut per_account: HashMap<String, f64> = HashMap::new();
        for trade in self.state.get_open_trades_for_symbol(symbol) {
            *per_account.entry(trade.account_id.clone()).or_insert(0.0) +=
                trade.unrealized_pnl(price, instrument.tick_value);
        }
        for (account_id, upnl) in per_account {
            self.bus.publish_account_upnl(AccountUpnlEvent { account_id, upnl });
        }
    }

    // ---- order submission ----

    pub async fn place_order(&self, req: NewOrderRequest) -> PlaceOrderOutcome {
        if let (Some(key), Some(kv)) = (&req.idempotency_key, &self.kv) {
            // Claims the key with a throwaway placeholder before the real
            // order id exists, purely to block a concurrent second submission;
            // `confirm_idempotency` overwrites it with the real order id once
            // one has been assigned, so a later duplicate resolves to the id
            // the first caller actually received.
            let placeholder = Uuid::new_v4().to_string();
            match kv.claim_idempotency_key(key, &placeholder, IDEMPOTENCY_TTL_SECS).await {
                Ok(Some(existing)) => return PlaceOrderOutcome::Duplicate(existing),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "idempotency claim failed, proceeding without it");
                }
            }
        }

        let symbol = self.registry.normalize_symbol(&req.symbol);
        if self.registry.get_contract(&symbol).is_none() {
            self.reject(&req, RiskErrorCode::SymbolNotSupported).await;
            return PlaceOrderOutcome::Rejected(RiskErrorCode::SymbolNotSupported);
        }

        let dup_key = format!(
            "{}:{}:{:?}:{}:{:?}",
            req.account_id, symbol, req.side, req.quantity, req.order_type
        );
        if self
            .state
            .check_and_record_duplicate(&dup_key, Duration::from_millis(self.config.duplicate_order_ms as u64))
        {
            self.reject(&req, RiskErrorCode::DuplicateOrder).await;
            return PlaceOrderOutcome::Rejected(RiskErrorCode::DuplicateOrder);
        }

        if let Err(err) = self.risk().pre_trade_risk_check(&req.account_id, &symbol, req.quantity, Utc::now()) {
            self.reject(&req, err).await;
            return PlaceOrderOutcome::Rejected(err);
        }

        match req.order_type {
            OrderType::Market => self.place_market_order(req, symbol).await,
            OrderType::Limit => self.place_limit_order(req, symbol).await,
        }
    }

    async fn place_market_order(&self, req: NewOrderRequest, symbol: String) -> PlaceOrderOutcome {
        let instrument = self.registry.get_contract(&symbol).expect("validated above");
        let now = Utc::now();

        let mut price = match self.state.get_mark_with_age(&symbol, now.timestamp_millis()) {
            Some((p, age)) if age < self.config.price_stale_ms => Some(p),
            _ => None,
        };

        if price.is_none() {
            if let Some(source) = &self.price_source {
                price = source.fetch_price(&instrument.price_key).await.ok();
            }
        }

        let Some(mut price) = price else {
            self.reject(&req, RiskErrorCode::NoLivePrice).await;
            return PlaceOrderOutcome::Rejected(RiskErrorCode::NoLivePrice);
        };

        if instrument.convert_to_inr {
            let usdinr = self.state.get_mark("USDINR").unwrap_or(self.config.usdinr_default);
            price *= usdinr;
        }

        let order = PendingOrder {
            id: Uuid::new_v4().to_string(),
            account_id: req.account_id.clone(),
            user_id: req.user_id.clone(),
            symbol: symbol.clone(),
            side: req.side,
            quantity: req.quantity,
            order_type: OrderType::Market,
            limit_price: None,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            idempotency_key: req.idempotency_key.clone(),
            created_at: now,
            status: OrderStatus::Filled,
        };
        self.confirm_idempotency(&order).await;
        if let Err(err) = self.store.insert_pending_order(&order).await {
            warn!(error = %err, "failed to persist market order row");
        }
        if let Err(err) = self.store.mark_order_status(&order.id, "filled").await {
            warn!(error = %err, "failed to mark order filled");
        }

        let hypothetical_balance = self
            .state
            .get_account(&req.account_id)
            .map(|a| a.current_balance - instrument.commission * req.quantity)
            .unwrap_or(f64::NEG_INFINITY);
        if let Err(err) =
            self.risk()
                .evaluate_immediate_risk(&req.account_id, &symbol, req.quantity, hypothetical_balance)
        {
            let _ = self.store.mark_order_status(&order.id, "rejected").await;
            self.reject(&req, err).await;
            return PlaceOrderOutcome::Rejected(err);
        }

        let prev_price = self.state.get_mark(&symbol).unwrap_or(price);
        match self.fill_order(order, price, prev_price).await {
            Some(trade) => PlaceOrderOutcome::Filled(trade),
            None => PlaceOrderOutcome::Rejected(RiskErrorCode::RiskEngineError),
        }
    }

    async fn place_limit_order(&self, req: NewOrderRequest, symbol: String) -> PlaceOrderOutcome {
        let Some(limit_price) = req.limit_price else {
            self.reject(&req, RiskErrorCode::LimitPriceRequired).await;
            return PlaceOrderOutcome::Rejected(RiskErrorCode::LimitPriceRequired);
        };

        let order = PendingOrder {
            id: Uuid::new_v4().to_string(),
            account_id: req.account_id,
            user_id: req.user_id,
            symbol,
            side: req.side,
            quantity: req.quantity,
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            idempotency_key: req.idempotency_key,
            created_at: Utc::now(),
            status: OrderStatus::Pending,
        };
        self.confirm_idempotency(&order).await;

        self.state.add_pending_order(order.clone());
        if let Err(err) = self.store.insert_pending_order(&order).await {
            warn!(error = %err, "failed to persist pending order row");
        }
        self.bus.publish_order_event(OrderEvent {
            kind: OrderEventKind::OrderPending,
            order: order.clone(),
            reason: None,
        });
        PlaceOrderOutcome::Pending(order)
    }

    /// Overwrites the `idem:{key}` claim placed at the top of `place_order`
    /// with the real order id, once one exists, so a duplicate submission
    /// arriving later resolves to the id the first caller received.
    async fn confirm_idempotency(&self, order: &PendingOrder) {
        let (Some(key), Some(kv)) = (&order.idempotency_key, &self.kv) else {
            return;
        };
        if let Err(err) = kv.confirm_idempotency_key(key, &order.id, IDEMPOTENCY_TTL_SECS).await {
            warn!(error = %err, "failed to confirm idempotency key with real order id");
        }
    }

    async fn reject(&self, req: &NewOrderRequest, code: RiskErrorCode) {
        warn!(account_id = %req.account_id, symbol = %req.symbol, error = %code, "order rejected");
        let _ = self
            .store
            .audit(
                "ORDER_REJECTED",
                json!({ "account_id": req.account_id, "symbol": req.symbol, "reason": code.to_string() }),
            )
            .await;
    }

    // ---- fill execution ----

    /// Serializes per-account via the account's async mutex: the guard is
    /// held across the artificial execution-latency sleep, the one
    /// sanctioned exception to "no critical section spans a suspension".
    async fn fill_order(&self, order: PendingOrder, base_price: f64, prev_price: f64) -> Option<OpenTrade> {
        let lock = self.state.account_lock(&order.account_id);
        let _guard = lock.lock().await;

        tokio::time::sleep(Duration::from_millis(self.config.execution_latency_ms)).await;

        let instrument = self.registry.get_contract(&order.symbol)?;

        let slippage = (base_price - prev_price).abs() * 0.2;
        let max_slippage = instrument.max_slippage.unwrap_or(5.0);
        let slippage = slippage.min(max_slippage);
        let exec_price = match order.side {
            Side::Buy => base_price + instrument.spread + slippage,
            Side::Sell => base_price - instrument.spread - slippage,
        };

        let (filled_qty, remaining_qty) = self.split_for_partial_fill(&order, &instrument);

        let hypothetical_balance = self
            .state
            .get_account(&order.account_id)
            .map(|a| a.current_balance - instrument.commission * filled_qty)
            .unwrap_or(f64::NEG_INFINITY);
        if let Err(err) = self.risk().evaluate_immediate_risk(
            &order.account_id,
            &order.symbol,
            filled_qty,
            hypothetical_balance,
        ) {
            self.state.remove_pending_order(&order.id);
            let _ = self.store.mark_order_status(&order.id, "rejected").await;
            self.bus.publish_order_event(OrderEvent {
                kind: OrderEventKind::OrderRejected,
                order,
                reason: Some(err.to_string()),
            });
            return None;
        }

        if remaining_qty > 0.0 {
            self.requeue_residual(&order, remaining_qty, base_price).await;
        }
        self.state.remove_pending_order(&order.id);

        let trade = OpenTrade {
            id: Uuid::new_v4().to_string(),
            account_id: order.account_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: filled_qty,
            entry_price: exec_price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            time_opened: Utc::now(),
            pnl: -instrument.commission * filled_qty,
            order_id: order.id.clone(),
        };

        self.state.add_open_trade(trade.clone());
        if let Err(err) = self.store.insert_trade(&json!(trade), &trade.account_id, &trade.id, &trade.time_opened.to_rfc3339()).await {
            warn!(error = %err, "failed to persist open trade");
        }
        let _ = self.store.mark_order_status(&order.id, "filled").await;

        self.bus.publish_order_event(OrderEvent {
            kind: OrderEventKind::OrderFilled,
            order,
            reason: None,
        });
        self.bus.publish_trade_event(TradeEvent {
            kind: TradeEventKind::TradeOpened,
            trade: trade.clone(),
            reason: None,
        });
        info!(account_id = %trade.account_id, symbol = %trade.symbol, qty = filled_qty, price = exec_price, "trade opened");

        Some(trade)
    }

    /// `filled = max(1 qtyStep, floor(quantity * r / qtyStep) * qtyStep)`;
    /// residual smaller than `minQty` is dropped rather than resurrected.
    fn split_for_partial_fill(&self, order: &PendingOrder, instrument: &Instrument) -> (f64, f64) {
        if !self.config.enable_partial_fills || !instrument.allow_partial_fills {
            return (order.quantity, 0.0);
        }
        let ratio = instrument.partial_fill_ratio.unwrap_or(self.config.partial_fill_ratio);
        let raw = order.quantity * ratio;
        let steps = (raw / instrument.qty_step).floor().max(1.0);
        let filled = (steps * instrument.qty_step).min(order.quantity);
        let remaining = order.quantity - filled;
        if remaining > 0.0 && remaining < instrument.min_qty {
            (filled, 0.0)
        } else {
            (filled, remaining)
        }
    }

    async fn requeue_residual(&self, order: &PendingOrder, remaining_qty: f64, base_price: f64) {
        let residual = PendingOrder {
            id: Uuid::new_v4().to_string(),
            account_id: order.account_id.clone(),
            user_id: order.user_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: remaining_qty,
            order_type: order.order_type,
            limit_price: Some(order.limit_price.unwrap_or(base_price)),
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            idempotency_key: None,
            created_at: Utc::now(),
            status: OrderStatus::Pending,
        };
        self.state.add_pending_order(residual.clone());
        if let Err(err) = self.store.insert_pending_order(&residual).await {
            warn!(error = %err, "failed to persist residual partial-fill order");
        }
        self.bus.publish_order_event(OrderEvent {
            kind: OrderEventKind::OrderPending,
            order: residual,
            reason: Some("partial_fill_residual".to_string()),
        });
    }

    // ---- close ----

    async fn close_trade_impl(&self, trade: OpenTrade, close_price: f64, reason: ExitReason) {
        let instrument = self.registry.get_contract(&trade.symbol);
        let tick_value = instrument.as_ref().map(|i| i.tick_value).unwrap_or(1.0);
        let pnl_delta = match trade.side {
            Side::Buy => (close_price - trade.entry_price) * trade.quantity * tick_value,
            Side::Sell => (trade.entry_price - close_price) * trade.quantity * tick_value,
        };
        // Folds in entry commission already held in `trade.pnl`; no closing
        // commission is added.
        let net_pnl = pnl_delta + trade.pnl;

        let closed = ClosedTrade {
            id: trade.id.clone(),
            account_id: trade.account_id.clone(),
            symbol: trade.symbol.clone(),
            side: trade.side,
            quantity: trade.quantity,
            entry_price: trade.entry_price,
            exit_price: close_price,
            time_opened: trade.time_opened,
            time_closed: Utc::now(),
            exit_reason: reason,
            pnl: net_pnl,
            order_id: trade.order_id.clone(),
        };

        self.state.remove_open_trade(&trade.id);
        if let Err(err) = self.store.close_trade(&closed).await {
            warn!(error = %err, "failed to persist closed trade");
        }
        self.bus.publish_trade_event(TradeEvent {
            kind: TradeEventKind::TradeClosed,
            trade: trade.clone(),
            reason: Some(reason),
        });

        let today = closed.time_closed.date_naive();
        let existing_day = self.state.get_account(&trade.account_id).map(|a| a.session_day);
        if existing_day != Some(today) {
            self.state.update_account(&trade.account_id, |a| {
                a.session_day = today;
                a.start_of_day_equity = a.current_balance;
            });
            self.state.update_session(&trade.account_id, |s| {
                s.realized = 0.0;
            });
        }
        let session = self.state.update_session(&trade.account_id, |s| {
            s.realized += net_pnl;
            s.total += net_pnl;
            s.best_day = s.best_day.max(s.realized);
        });

        let updated = self.state.update_account(&trade.account_id, |a| {
            a.current_balance += net_pnl;
            a.total_profit = session.total;
            a.best_day_profit = session.best_day;
        });
        if let Some(account) = updated {
            if let Err(err) = self.store.upsert_account(&account).await {
                warn!(error = %err, "failed to persist account patch after close");
            }
        }

        info!(
            account_id = %trade.account_id,
            symbol = %trade.symbol,
            pnl = net_pnl,
            reason = %reason.to_string(),
            "trade closed"
        );
    }

    pub async fn close_trade(&self, trade: OpenTrade, close_price: f64, reason: ExitReason) {
        self.close_trade_impl(trade, close_price, reason).await
    }
}

#[async_trait]
impl TradeCloser for MatchingEngine {
    async fn close_trade(&self, trade: OpenTrade, close_price: f64, reason: ExitReason) {
        MatchingEngine::close_trade(self, trade, close_price, reason).await
    }
}

/// buy: close if `stop_loss` hit (price <= sl) or `take_profit` hit (price
/// >= tp); sell: symmetric. Returns the barrier price, not the triggering
/// tick — a tick that gaps through a barrier still exits at the declared
/// SL/TP level.
fn sl_tp_trigger(trade: &OpenTrade, price: f64) -> Option<(ExitReason, f64)> {
    match trade.side {
        Side::Buy => {
            if let Some(sl) = trade.stop_loss.filter(|sl| price <= *sl) {
                Some((ExitReason::SlHit, sl))
            } else if let Some(tp) = trade.take_profit.filter(|tp| price >= *tp) {
                Some((ExitReason::TpHit, tp))
            } else {
                None
            }
        }
        Side::Sell => {
            if let Some(sl) = trade.stop_loss.filter(|sl| price >= *sl) {
                Some((ExitReason::SlHit, sl))
            } else if let Some(tp) = trade.take_profit.filter(|tp| price <= *tp) {
                Some((ExitReason::TpHit, tp))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, AccountStatus, Tier, TrailingDdMode};
    use std::collections::HashMap as StdHashMap;

    fn instrument(symbol: &str) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            symbol_aliases: vec![],
            qty_step: 0.01,
            min_qty: 0.01,
            price_key: symbol.to_lowercase(),
            display: symbol.to_string(),
            tick_value: 1.0,
            convert_to_inr: false,
            max_lots: StdHashMap::from([(Tier::Evaluation, 10.0), (Tier::Funded, 20.0)]),
            trading_hours: (0, 24),
            daily_loss_limit: 1000.0,
            commission: 50.0,
            spread: 5.0,
            allow_partial_fills: false,
            partial_fill_ratio: None,
            max_slippage: None,
            force_close_on_reset: false,
        }
    }

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            tier: Tier::Evaluation,
            status: AccountStatus::Active,
            start_balance: 50_000.0,
            current_balance: 50_000.0,
            peak_balance: 50_000.0,
            max_loss: 2_500.0,
            daily_loss_limit: 1_000.0,
            max_intraday_loss: 1_000.0,
            trail_drawdown: 2_000.0,
            trailing_dd_mode: TrailingDdMode::Live,
            profit_target: 3_000.0,
            total_profit: 0.0,
            best_day_profit: 0.0,
            consistency_flag: false,
            start_of_day_equity: 50_000.0,
            session_day: Utc::now().date_naive(),
            liquidity_gap: 0.0,
            blown_reason: None,
        }
    }

    fn setup() -> (Arc<MatchingEngine>, Arc<Config>) {
        setup_with_kv(None)
    }

    /// An in-memory stand-in for `KvStore` so the idempotency-claim path can
    /// be exercised without a live Redis connection.
    #[derive(Default)]
    struct FakeIdempotencyStore {
        claims: std::sync::Mutex<StdHashMap<String, String>>,
    }

    #[async_trait]
    impl crate::kv::IdempotencyStore for FakeIdempotencyStore {
        async fn claim_idempotency_key(&self, key: &str, placeholder: &str, _ttl_secs: usize) -> anyhow::Result<Option<String>> {
            let mut claims = self.claims.lock().unwrap();
            if let Some(existing) = claims.get(key) {
                return Ok(Some(existing.clone()));
            }
            claims.insert(key.to_string(), placeholder.to_string());
            Ok(None)
        }

        async fn confirm_idempotency_key(&self, key: &str, order_id: &str, _ttl_secs: usize) -> anyhow::Result<()> {
            self.claims.lock().unwrap().insert(key.to_string(), order_id.to_string());
            Ok(())
        }
    }

    fn setup_with_kv(kv: Option<Arc<dyn crate::kv::IdempotencyStore>>) -> (Arc<MatchingEngine>, Arc<Config>) {
        let mut table = StdHashMap::new();
        table.insert("BTCUSD".to_string(), instrument("BTCUSD"));
        let registry = Arc::new(Registry::new(table));
        let state = Arc::new(SharedTradeState::new());
        state.upsert_account(account("a1"));
        let store = Arc::new(Store::new(":memory:").unwrap());
        let bus = Arc::new(EventBus::new());
        let config = Arc::new(test_config());

        let matching = Arc::new(MatchingEngine::new(
            registry.clone(),
            state.clone(),
            store.clone(),
            kv,
            bus.clone(),
            config.clone(),
            None,
        ));
        let risk = Arc::new(RiskEngine::new(registry, state, store, bus, matching.clone()));
        matching.attach_risk_engine(risk);
        (matching, config)
    }

    fn test_config() -> Config {
        Config {
            port: 4000,
            database_path: ":memory:".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            feed_api_key: None,
            upstream_feed_urls: vec![],
            max_broadcast_tps: 20,
            tick_history_limit: 1000,
            execution_latency_ms: 1,
            sltp_grace_ms: 0,
            price_stale_ms: 5000,
            duplicate_order_ms: 500,
            enable_partial_fills: false,
            partial_fill_ratio: 0.5,
            usdinr_default: 83.0,
            registry_refresh_secs: 600,
            environment: crate::config::Environment::Development,
        }
    }

    #[tokio::test]
    async fn market_buy_fills_with_spread_and_closes_on_tp() {
        let (matching, _config) = setup();

        matching.process_tick("BTCUSD", 30000.0).await;
        matching.process_tick("BTCUSD", 30010.0).await;

        let outcome = matching
            .place_order(NewOrderRequest {
                account_id: "a1".into(),
                user_id: "u1".into(),
                symbol: "BTCUSD".into(),
                side: Side::Buy,
                quantity: 1.0,
                order_type: OrderType::Market,
                limit_price: None,
                stop_loss: None,
                take_profit: Some(30200.0),
                idempotency_key: None,
            })
            .await;

        let trade = match outcome {
            PlaceOrderOutcome::Filled(t) => t,
            other => panic!("expected fill, got {other:?}"),
        };
        assert_eq!(trade.entry_price, 30015.0); // 30010 + spread(5) + slippage(0)
        assert_eq!(trade.pnl, -50.0);

        matching.process_tick("BTCUSD", 30100.0).await;
        matching.process_tick("BTCUSD", 30250.0).await;

        // TP triggers on the 30250 tick but exits at the 30200 barrier, not
        // the triggering tick: net_pnl = (30200 - 30015) * 1.0 * 1.0 + (-50) = 135
        let account = matching.state.get_account("a1").unwrap();
        assert_eq!(account.current_balance, 50_135.0);
        assert!(matching.state.get_open_trades().is_empty());
    }

    #[tokio::test]
    async fn limit_sell_above_market_never_fills() {
        let (matching, _config) = setup();
        let outcome = matching
            .place_order(NewOrderRequest {
                account_id: "a1".into(),
                user_id: "u1".into(),
                symbol: "BTCUSD".into(),
                side: Side::Sell,
                quantity: 0.1,
                order_type: OrderType::Limit,
                limit_price: Some(35000.0),
                stop_loss: None,
                take_profit: None,
                idempotency_key: None,
            })
            .await;
        assert!(matches!(outcome, PlaceOrderOutcome::Pending(_)));

        for price in [34000.0, 34500.0, 34900.0] {
            matching.process_tick("BTCUSD", price).await;
        }

        assert_eq!(matching.state.get_pending_orders().len(), 1);
        assert!(matching.state.get_open_trades().is_empty());
    }

    #[tokio::test]
    async fn duplicate_submission_resolves_to_the_real_order_id_via_kv() {
        let kv: Arc<dyn crate::kv::IdempotencyStore> = Arc::new(FakeIdempotencyStore::default());
        let (matching, _config) = setup_with_kv(Some(kv));

        let request = || NewOrderRequest {
            account_id: "a1".into(),
            user_id: "u1".into(),
            symbol: "BTCUSD".into(),
            side: Side::Buy,
            quantity: 0.1,
            order_type: OrderType::Limit,
            limit_price: Some(29000.0),
            stop_loss: None,
            take_profit: None,
            idempotency_key: Some("client-key-1".into()),
        };

        let first = matching.place_order(request()).await;
        let first_id = match first {
            PlaceOrderOutcome::Pending(order) => order.id,
            other => panic!("expected pending, got {other:?}"),
        };

        let second = matching.place_order(request()).await;
        match second {
            PlaceOrderOutcome::Duplicate(id) => assert_eq!(id, first_id),
            other => panic!("expected duplicate, got {other:?}"),
        }
    }
}
