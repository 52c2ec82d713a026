//! Event Bus: publish/subscribe channels for `price_ticks`,
//! `orderbook_{symbol}`, `trade_events`, `order_events`, plus the
//! observational `account_upnl` stream the matching engine emits on every
//! tick.
//!
//! Grounded on the teacher's `main.rs` WS broadcaster, which wires a
//! `tokio::sync::broadcast` channel between producers and a fan-out task
//! (`websocket_broadcaster`) feeding every connected client. This crate has
//! more channels but the same discipline: at-most-once delivery, a bounded
//! ring buffer per channel, and subscribers that tolerate message loss by
//! falling back to the KV `latest_prices` hash and in-memory state.

use crate::models::{DepthSnapshot, ExitReason, OpenTrade, PendingOrder, Tick};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeEventKind {
    TradeOpened,
    TradeClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "type")]
    pub kind: TradeEventKind,
    pub trade: OpenTrade,
    pub reason: Option<ExitReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderEventKind {
    OrderPending,
    OrderFilled,
    OrderRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    #[serde(rename = "type")]
    pub kind: OrderEventKind,
    pub order: PendingOrder,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpnlEvent {
    pub account_id: String,
    pub upnl: f64,
}

/// Process-wide pub/sub hub. One `broadcast::Sender` per logical channel;
/// `orderbook_{symbol}` is modeled as a single tagged stream rather than one
/// channel per symbol, since subscribers already filter by `symbol` field
/// the way the downstream WS layer filters by client subscription.
pub struct EventBus {
    price_ticks: broadcast::Sender<Tick>,
    orderbook: broadcast::Sender<DepthSnapshot>,
    trade_events: broadcast::Sender<TradeEvent>,
    order_events: broadcast::Sender<OrderEvent>,
    account_upnl: broadcast::Sender<AccountUpnlEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            price_ticks: broadcast::channel(CHANNEL_CAPACITY).0,
            orderbook: broadcast::channel(CHANNEL_CAPACITY).0,
            trade_events: broadcast::channel(CHANNEL_CAPACITY).0,
            order_events: broadcast::channel(CHANNEL_CAPACITY).0,
            account_upnl: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn publish_tick(&self, tick: Tick) {
        let _ = self.price_ticks.send(tick);
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<Tick> {
        self.price_ticks.subscribe()
    }

    pub fn publish_orderbook(&self, snapshot: DepthSnapshot) {
        let _ = self.orderbook.send(snapshot);
    }

    pub fn subscribe_orderbook(&self) -> broadcast::Receiver<DepthSnapshot> {
        self.orderbook.subscribe()
    }

    pub fn publish_trade_event(&self, event: TradeEvent) {
        let _ = self.trade_events.send(event);
    }

    pub fn subscribe_trade_events(&self) -> broadcast::Receiver<TradeEvent> {
        self.trade_events.subscribe()
    }

    pub fn publish_order_event(&self, event: OrderEvent) {
        let _ = self.order_events.send(event);
    }

    pub fn subscribe_order_events(&self) -> broadcast::Receiver<OrderEvent> {
        self.order_events.subscribe()
    }

    pub fn publish_account_upnl(&self, event: AccountUpnlEvent) {
        let _ = self.account_upnl.send(event);
    }

    pub fn subscribe_account_upnl(&self) -> broadcast::Receiver<AccountUpnlEvent> {
        self.account_upnl.subscribe()
    }
}
