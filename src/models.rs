//! Domain model for the simulated trading execution core: instruments,
//! accounts, orders and trades, ticks and depth snapshots.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Account tier; gates lot-size caps and is otherwise opaque to matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Evaluation,
    Funded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Paused,
    Passed,
    Blown,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrailingDdMode {
    Live,
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    #[serde(rename = "SL Hit")]
    SlHit,
    #[serde(rename = "TP Hit")]
    TpHit,
    DailyLossLimit,
    MaxLoss,
    MaxIntradayLoss,
    TrailingDrawdown,
    DailyReset,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        write!(f, "{s}")
    }
}

/// A tradable instrument, keyed by its normalized symbol.
///
/// `symbol_aliases` backs `Registry::normalize_symbol`'s alias table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub symbol_aliases: Vec<String>,
    pub qty_step: f64,
    pub min_qty: f64,
    pub price_key: String,
    pub display: String,
    pub tick_value: f64,
    pub convert_to_inr: bool,
    pub max_lots: HashMap<Tier, f64>,
    /// (start_hour, end_hour) in the declared time zone; wrap-around when start > end.
    pub trading_hours: (u8, u8),
    pub daily_loss_limit: f64,
    pub commission: f64,
    pub spread: f64,
    pub allow_partial_fills: bool,
    pub partial_fill_ratio: Option<f64>,
    pub max_slippage: Option<f64>,
    /// Whether this instrument's open trades are force-closed at the daily
    /// reset boundary rather than carried into the next session.
    pub force_close_on_reset: bool,
}

impl Instrument {
    pub fn max_lots_for(&self, tier: Tier) -> f64 {
        self.max_lots.get(&tier).copied().unwrap_or(f64::MAX)
    }

    /// `quantity >= minQty` and `quantity` is an integer multiple of
    /// `qtyStep`, within floating-point tolerance.
    pub fn is_valid_lot(&self, quantity: f64) -> bool {
        if quantity < self.min_qty - f64::EPSILON {
            return false;
        }
        let steps = quantity / self.qty_step;
        (steps - steps.round()).abs() < 1e-6
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub tier: Tier,
    pub status: AccountStatus,
    pub start_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub max_loss: f64,
    pub daily_loss_limit: f64,
    pub max_intraday_loss: f64,
    pub trail_drawdown: f64,
    pub trailing_dd_mode: TrailingDdMode,
    pub profit_target: f64,
    pub total_profit: f64,
    pub best_day_profit: f64,
    pub consistency_flag: bool,
    pub start_of_day_equity: f64,
    pub session_day: NaiveDate,
    /// Most recent observed bid/ask half-spread, used only by the breach
    /// slippage model. Defaults to 0.
    pub liquidity_gap: f64,
    pub blown_reason: Option<String>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        matches!(self.status, AccountStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: String,
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
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTrade {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub time_opened: DateTime<Utc>,
    /// Running pnl; starts at `-commission * quantity` and is folded into
    /// `net_pnl` on close.
    pub pnl: f64,
    pub order_id: String,
}

impl OpenTrade {
    pub fn unrealized_pnl(&self, price: f64, tick_value: f64) -> f64 {
        let delta = match self.side {
            Side::Buy => price - self.entry_price,
            Side::Sell => self.entry_price - price,
        };
        delta * self.quantity * tick_value
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.time_opened).num_milliseconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub time_opened: DateTime<Utc>,
    pub time_closed: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub pnl: f64,
    pub order_id: String,
}

/// Per-account, per-calendar-day realized PnL accumulator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionPnl {
    pub realized: f64,
    pub best_day: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    /// Descending price.
    pub bids: Vec<(f64, f64)>,
    /// Ascending price.
    pub asks: Vec<(f64, f64)>,
    pub ts: i64,
}
