//! Downstream WebSocket surface. Grounded on the teacher's `main.rs`
//! `websocket_handler`/`handle_socket` pair: an axum upgrade handler that
//! authenticates before the 101 response, then a `tokio::select!` loop
//! forwarding bus events out and inbound client messages in. Auth
//! extraction follows `auth::middleware`'s query-param / header precedence,
//! generalized to a static API-key scheme instead of a bearer-token
//! verifier.

use crate::event_bus::EventBus;
use crate::kv::KvStore;
use crate::price_hub::{Broadcaster, BroadcastSink};
use crate::state::SharedTradeState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct WsAppState {
    pub registry: Arc<crate::registry::Registry>,
    pub state: Arc<SharedTradeState>,
    pub bus: Arc<EventBus>,
    pub kv: Option<Arc<KvStore>>,
    pub broadcaster: Arc<Broadcaster>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    key: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
}

/// A connected client's outbound mailbox, registered with the [`Broadcaster`]
/// so price/orderbook pushes reach it without the WS task polling the bus
/// directly for those two channels.
struct ClientSink {
    tx: mpsc::UnboundedSender<String>,
    buffered_bytes: std::sync::atomic::AtomicUsize,
    subscriptions: SyncMutex<HashSet<String>>,
}

impl BroadcastSink for ClientSink {
    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    fn send(&self, payload: String) {
        let len = payload.len();
        if self.tx.send(payload).is_ok() {
            self.buffered_bytes.fetch_add(len, Ordering::Relaxed);
        }
    }
}

/// Extracts the static API key from `sec-websocket-protocol` or `?key=`/
/// `?token=`, mirroring `auth::middleware`'s header-then-query precedence;
/// either carrier is accepted.
fn extract_api_key(headers: &axum::http::HeaderMap, params: &WsAuthParams) -> Option<String> {
    if let Some(protocol) = headers.get("sec-websocket-protocol") {
        if let Ok(value) = protocol.to_str() {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    params.key.clone().or_else(|| params.token.clone())
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsAppState>,
    Query(params): Query<WsAuthParams>,
    headers: axum::http::HeaderMap,
) -> Response {
    let presented = extract_api_key(&headers, &params);
    let expected = state.api_key.as_deref();
    match (expected, presented.as_deref()) {
        (Some(expected), Some(presented)) if expected == presented => {}
        (None, _) => {
            warn!("rejecting WS upgrade: no FEED_API_KEY configured");
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
        _ => {
            warn!("rejecting WS upgrade: API key mismatch");
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection loop: sends `welcome`, then forwards bus events
/// (trade/order/account) and broadcaster pushes (price/orderbook) out while
/// reading client `subscribe`/`unsubscribe` messages in, with a 25s
/// heartbeat terminating unresponsive clients.
async fn handle_socket(socket: WebSocket, app: WsAppState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let sink = Arc::new(ClientSink {
        tx: tx.clone(),
        buffered_bytes: std::sync::atomic::AtomicUsize::new(0),
        subscriptions: SyncMutex::new(HashSet::new()),
    });
    app.broadcaster.register(client_id, sink.clone()).await;

    if let Some(welcome) = build_welcome(&app).await {
        let _ = tx.send(welcome);
    }

    let mut trade_rx = app.bus.subscribe_trade_events();
    let mut order_rx = app.bus.subscribe_order_events();
    let mut upnl_rx = app.bus.subscribe_account_upnl();

    let mut heartbeat = interval(Duration::from_secs(25));
    let mut awaiting_pong = false;

    info!(client_id, "ws client connected");

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    info!(client_id, "ws client missed heartbeat, terminating");
                    break;
                }
                awaiting_pong = true;
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            Some(payload) = rx.recv() => {
                sink.buffered_bytes.fetch_sub(payload.len(), Ordering::Relaxed);
                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            event = trade_rx.recv() => {
                match event {
                    Ok(event) => {
                        let msg_type = match event.kind {
                            crate::event_bus::TradeEventKind::TradeOpened => "trade_fill",
                            crate::event_bus::TradeEventKind::TradeClosed => "trade_close",
                        };
                        let payload = serde_json::json!({ "type": msg_type, "trade": event.trade });
                        if sender.send(Message::Text(payload.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            event = order_rx.recv() => {
                match event {
                    Ok(event) => {
                        let msg_type = match event.kind {
                            crate::event_bus::OrderEventKind::OrderPending => "order_pending",
                            crate::event_bus::OrderEventKind::OrderFilled => continue,
                            crate::event_bus::OrderEventKind::OrderRejected => "order_reject",
                        };
                        let payload = serde_json::json!({ "type": msg_type, "order": event.order, "reason": event.reason });
                        if sender.send(Message::Text(payload.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            event = upnl_rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(account) = app.state.get_account(&event.account_id) {
                            let payload = serde_json::json!({ "type": "account_update", "account": account });
                            if sender.send(Message::Text(payload.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_client_message(&text, &sink),
                    Some(Ok(Message::Pong(_))) => { awaiting_pong = false; }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    app.broadcaster.unregister(client_id).await;
    info!(client_id, "ws client disconnected");
}

fn handle_client_message(text: &str, sink: &Arc<ClientSink>) {
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        return;
    };
    match msg {
        ClientMessage::Subscribe { symbol } => {
            sink.subscriptions.lock().insert(symbol.to_uppercase());
        }
        ClientMessage::Unsubscribe { symbol } => {
            sink.subscriptions.lock().remove(&symbol.to_uppercase());
        }
    }
}

/// `{type:"welcome", prices, orderbooks, accounts, pendingOrders,
/// openTrades}`: the snapshot a reconnecting client combines with
/// subsequent pushes to reconstruct server state.
async fn build_welcome(app: &WsAppState) -> Option<String> {
    let prices = match &app.kv {
        Some(kv) => kv.get_latest_prices().await.unwrap_or_default(),
        None => Default::default(),
    };
    let orderbooks = build_orderbook_snapshot(app).await;
    let accounts = app.state.get_accounts();
    let pending_orders = app.state.get_pending_orders();
    let open_trades = app.state.get_open_trades();
    let payload = serde_json::json!({
        "type": "welcome",
        "prices": prices,
        "orderbooks": orderbooks,
        "accounts": accounts,
        "pendingOrders": pending_orders,
        "openTrades": open_trades,
    });
    Some(payload.to_string())
}

/// `{symbol: {bids, asks}}` for every registered instrument, read from the
/// KV depth snapshots `price_hub` publishes. An instrument with no snapshot
/// yet (or an unreachable KV store) is simply absent from the map.
async fn build_orderbook_snapshot(app: &WsAppState) -> serde_json::Map<String, serde_json::Value> {
    let mut orderbooks = serde_json::Map::new();
    let Some(kv) = &app.kv else { return orderbooks };
    for instrument in app.registry.all_instruments() {
        if let Ok(Some(book)) = kv.get_orderbook(&instrument.symbol).await {
            orderbooks.insert(instrument.symbol, book);
        }
    }
    orderbooks
}

/// `{type:"sync_state", accounts, pendingOrders, openTrades}`: available for
/// callers that want a full resync outside the connect path (e.g. after a
/// registry reload).
pub fn build_sync_state(state: &SharedTradeState) -> String {
    let payload = serde_json::json!({
        "type": "sync_state",
        "accounts": state.get_accounts(),
        "pendingOrders": state.get_pending_orders(),
        "openTrades": state.get_open_trades(),
    });
    payload.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(key: Option<&str>, token: Option<&str>) -> WsAuthParams {
        WsAuthParams {
            key: key.map(str::to_string),
            token: token.map(str::to_string),
        }
    }

    #[test]
    fn extracts_key_from_query_param() {
        let headers = axum::http::HeaderMap::new();
        let p = params(Some("secret"), None);
        assert_eq!(extract_api_key(&headers, &p), Some("secret".to_string()));
    }

    #[test]
    fn extracts_key_from_token_param_when_key_absent() {
        let headers = axum::http::HeaderMap::new();
        let p = params(None, Some("secret"));
        assert_eq!(extract_api_key(&headers, &p), Some("secret".to_string()));
    }

    #[test]
    fn extracts_key_from_sec_websocket_protocol_header() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("sec-websocket-protocol", "secret".parse().unwrap());
        let p = params(None, None);
        assert_eq!(extract_api_key(&headers, &p), Some("secret".to_string()));
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("sec-websocket-protocol", "from-header".parse().unwrap());
        let p = params(Some("from-query"), None);
        assert_eq!(extract_api_key(&headers, &p), Some("from-header".to_string()));
    }

    #[test]
    fn client_subscribe_then_unsubscribe_clears_filter() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ClientSink {
            tx,
            buffered_bytes: std::sync::atomic::AtomicUsize::new(0),
            subscriptions: SyncMutex::new(HashSet::new()),
        });
        handle_client_message(r#"{"type":"subscribe","symbol":"btcusd"}"#, &sink);
        assert_eq!(sink.subscriptions(), vec!["BTCUSD".to_string()]);
        handle_client_message(r#"{"type":"unsubscribe","symbol":"BTCUSD"}"#, &sink);
        assert!(sink.subscriptions().is_empty());
    }
}
