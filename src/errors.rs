use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged business-logic outcome codes. These ride across the risk/matching
/// boundary, the event bus, and the WS wire as plain strings — they are never
/// thrown as exceptions, matching the crate's exception-to-result policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskErrorCode {
    // Validation
    MissingField,
    InvalidSide,
    InvalidOrderType,
    LimitPriceRequired,
    InvalidLotSize,
    SymbolNotSupported,
    ContractMetaNotFound,
    MarketClosed,

    // Risk
    AccountNotFound,
    AccountInactive,
    MaxLotSize,
    MaxLoss,
    TrailingDrawdown,
    DailyLossLimit,
    MaxIntradayLoss,

    // Operational
    NoLivePrice,
    DuplicateOrder,
    RiskEngineError,
}

impl fmt::Display for RiskErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Serde already knows the SCREAMING_SNAKE_CASE wire form; reuse it
        // instead of hand-maintaining a second string table.
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        write!(f, "{s}")
    }
}

impl RiskErrorCode {
    /// Whether this code belongs to the validation taxonomy surfaced as HTTP 400
    /// by the (out-of-scope) gateway — kept here since the taxonomy lives with
    /// the codes, not the gateway.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RiskErrorCode::MissingField
                | RiskErrorCode::InvalidSide
                | RiskErrorCode::InvalidOrderType
                | RiskErrorCode::LimitPriceRequired
                | RiskErrorCode::InvalidLotSize
                | RiskErrorCode::SymbolNotSupported
                | RiskErrorCode::ContractMetaNotFound
                | RiskErrorCode::MarketClosed
        )
    }
}

/// Outcome of a gate check: either ok, or a tagged rejection reason.
pub type RiskResult<T> = Result<T, RiskErrorCode>;
