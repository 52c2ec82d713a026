//! Instrument Registry: loads per-symbol contract metadata and exposes
//! normalization + trading-hours helpers. The table is held behind an
//! `ArcSwap` so readers never block a writer — the same RCU discipline the
//! teacher uses for its orderbook snapshots (`scrapers::polymarket_book_store`).

use crate::models::Instrument;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

pub type InstrumentTable = HashMap<String, Instrument>;

/// The built-in fallback table merged under freshly loaded store rows. Keeps
/// the process tradable even before the relational store has any
/// `instruments` rows seeded, and is the source of the `{symbol,price_key}`
/// pairs the Price Hub subscribes to at boot.
pub fn built_in_defaults() -> InstrumentTable {
    use crate::models::Tier;

    let mut table = InstrumentTable::new();
    let mut insert = |i: Instrument| {
        table.insert(i.symbol.clone(), i);
    };

    insert(Instrument {
        symbol: "BTCUSD".to_string(),
        symbol_aliases: vec!["BTC:USD".to_string(), "BTC_USD".to_string(), "BTCUSDT".to_string()],
        qty_step: 0.01,
        min_qty: 0.01,
        price_key: "btcusdt".to_string(),
        display: "Bitcoin / US Dollar".to_string(),
        tick_value: 1.0,
        convert_to_inr: false,
        max_lots: HashMap::from([(Tier::Evaluation, 5.0), (Tier::Funded, 10.0)]),
        trading_hours: (0, 24),
        daily_loss_limit: 1000.0,
        commission: 50.0,
        spread: 5.0,
        allow_partial_fills: false,
        partial_fill_ratio: None,
        max_slippage: Some(5.0),
        force_close_on_reset: false,
    });
    insert(Instrument {
        symbol: "ETHUSD".to_string(),
        symbol_aliases: vec!["ETH:USD".to_string(), "ETH_USD".to_string(), "ETHUSDT".to_string()],
        qty_step: 0.01,
        min_qty: 0.01,
        price_key: "ethusdt".to_string(),
        display: "Ethereum / US Dollar".to_string(),
        tick_value: 1.0,
        convert_to_inr: false,
        max_lots: HashMap::from([(Tier::Evaluation, 50.0), (Tier::Funded, 100.0)]),
        trading_hours: (0, 24),
        daily_loss_limit: 1000.0,
        commission: 10.0,
        spread: 0.5,
        allow_partial_fills: false,
        partial_fill_ratio: None,
        max_slippage: Some(2.0),
        force_close_on_reset: false,
    });
    insert(Instrument {
        symbol: "XAUUSD".to_string(),
        symbol_aliases: vec!["XAU:USD".to_string(), "XAU_USD".to_string(), "GOLD".to_string()],
        qty_step: 0.01,
        min_qty: 0.01,
        price_key: "paxgusdt".to_string(),
        display: "Gold / US Dollar".to_string(),
        tick_value: 100.0,
        convert_to_inr: false,
        max_lots: HashMap::from([(Tier::Evaluation, 2.0), (Tier::Funded, 5.0)]),
        // Wraps overnight: open 22:00 UTC, close 06:00 UTC.
        trading_hours: (22, 6),
        daily_loss_limit: 800.0,
        commission: 7.0,
        spread: 0.3,
        allow_partial_fills: true,
        partial_fill_ratio: Some(0.5),
        max_slippage: Some(1.0),
        force_close_on_reset: true,
    });

    table
}

/// Fetches instrument rows from the durable store. Callers supply an
/// implementation (a thin rusqlite query in production, a fixture in
/// tests).
#[async_trait::async_trait]
pub trait InstrumentSource: Send + Sync {
    async fn fetch_active(&self) -> anyhow::Result<Vec<Instrument>>;
}

pub struct Registry {
    table: ArcSwap<InstrumentTable>,
    defaults: InstrumentTable,
}

impl Registry {
    /// `defaults` is the built-in fallback table merged under freshly loaded
    /// rows, so unknown-but-listed instruments still have metadata even if
    /// the store omits fields.
    pub fn new(defaults: InstrumentTable) -> Self {
        Self {
            table: ArcSwap::new(Arc::new(defaults.clone())),
            defaults,
        }
    }

    /// Loads once at boot and on every scheduled refresh. Fails softly: if
    /// the store is unreachable, the previous `Arc` snapshot is kept.
    pub async fn reload(&self, source: &dyn InstrumentSource) {
        match source.fetch_active().await {
            Ok(rows) => {
                let mut merged = self.defaults.clone();
                for instrument in rows {
                    merged.insert(instrument.symbol.clone(), instrument);
                }
                info!(count = merged.len(), "instrument registry reloaded");
                self.table.store(Arc::new(merged));
            }
            Err(err) => {
                error!(error = %err, "instrument registry reload failed, keeping previous snapshot");
            }
        }
    }

    /// Spawns the coarse (~10 min, configurable) reload timer.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        source: Arc<dyn InstrumentSource>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; defaults already loaded
            loop {
                ticker.tick().await;
                registry.reload(source.as_ref()).await;
            }
        })
    }

    pub fn get_contract(&self, symbol: &str) -> Option<Instrument> {
        self.table.load().get(symbol).cloned()
    }

    /// Snapshot of every loaded instrument, consulted at boot to derive the
    /// set of upstream `(pair)` feeds the Price Hub subscribes to.
    pub fn all_instruments(&self) -> Vec<Instrument> {
        self.table.load().values().cloned().collect()
    }

    /// Case-insensitive; strips `:` and `_`; resolves a declared alias table;
    /// else returns the uppercased input.
    pub fn normalize_symbol(&self, raw: &str) -> String {
        let stripped: String = raw.chars().filter(|c| *c != ':' && *c != '_').collect();
        let upper = stripped.to_uppercase();

        let table = self.table.load();
        for instrument in table.values() {
            if instrument
                .symbol_aliases
                .iter()
                .any(|alias| alias.to_uppercase() == upper)
            {
                return instrument.symbol.clone();
            }
        }
        upper
    }

    /// Handles wrap-around windows where `start > end` (e.g. 22..6).
    pub fn is_within_trading_hours(&self, symbol: &str, now: chrono::DateTime<chrono::Utc>) -> bool {
        use chrono::Timelike;
        let Some(instrument) = self.get_contract(symbol) else {
            warn!(symbol, "trading-hours check on unknown symbol");
            return false;
        };
        let (start, end) = instrument.trading_hours;
        let hour = now.hour() as u8;
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}
