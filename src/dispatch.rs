//! Order queue and result correlation.
//!
//! One dispatcher is constructed at startup and shared between the log
//! tailing task (producer) and the HTTP handlers (consumer). The FIFO queue
//! and the status table sit behind independent locks; the status table is
//! never pruned and lives as long as the process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::signal::Signal;

/// ATR-based stop parameters forwarded to the EA when ATR mode is on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtrParams {
    pub period: u32,
    pub mult_sl: f64,
    pub mult_tp: f64,
}

/// Dispatcher knobs, decoupled from the CLI surface
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Lot size for orders built from signals
    pub default_volume: f64,
    /// Magic number stamped on orders that do not carry one
    pub magic_number: i64,
    /// When set, signal orders defer SL/TP to the EA's ATR computation
    pub atr: Option<AtrParams>,
    /// Uppercased symbol allow-list; `None` allows everything
    pub symbol_filter: Option<HashSet<String>>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_volume: 0.01,
            magic_number: 987_654,
            atr: None,
            symbol_filter: None,
        }
    }
}

/// A market order in the wire format the EA polls for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    /// "BUY" or "SELL"
    pub order_type: String,
    pub volume: f64,
    /// Ignored for market orders by the EA
    pub price: f64,
    pub sl: f64,
    pub tp: f64,
    pub comment: String,
    pub magic_number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl_tp_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_mult_sl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_mult_tp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
}

/// Validation failures surfaced to the HTTP caller as a 400 body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    MissingFields,
    MissingSlTp,
    MissingOrderId,
    NotAnObject,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFields => write!(f, "Missing required fields in order"),
            Self::MissingSlTp => write!(f, "Missing sl/tp; or set sl_tp_mode=ATR"),
            Self::MissingOrderId => write!(f, "Missing order_id"),
            Self::NotAnObject => write!(f, "Order must be a JSON object"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// FIFO hand-off queue plus a status-by-id side table.
pub struct OrderDispatcher {
    config: DispatchConfig,
    queue: Mutex<VecDeque<Value>>,
    results: Mutex<HashMap<String, Value>>,
    /// Last issued order id, kept strictly increasing across callers
    last_id: AtomicI64,
}

impl OrderDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            results: Mutex::new(HashMap::new()),
            last_id: AtomicI64::new(0),
        }
    }

    /// Build and queue a market order from an accepted signal. Signals that
    /// fail the acceptance rules are dropped without any observable effect.
    pub async fn enqueue_from_signal(&self, sig: &Signal) {
        let symbol = sig.symbol.to_uppercase();
        if symbol.is_empty() {
            debug!("dropping signal with empty symbol");
            return;
        }
        if let Some(filter) = &self.config.symbol_filter {
            if !filter.contains(&symbol) {
                debug!("dropping {} signal, symbol not in allow-list", symbol);
                return;
            }
        }

        let order_id = self.next_order_id();
        // kind, timeframe, source and signal time, skipping empty parts
        let comment = [
            sig.kind.as_str(),
            sig.timeframe.as_str(),
            sig.source.as_str(),
            sig.timestamp(),
        ]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");

        let mut order = Order {
            order_id: order_id.clone(),
            symbol,
            order_type: sig.side.as_order_type().to_string(),
            volume: self.config.default_volume,
            price: 0.0,
            sl: 0.0,
            tp: 0.0,
            comment,
            magic_number: self.config.magic_number,
            sl_tp_mode: None,
            atr_period: None,
            atr_mult_sl: None,
            atr_mult_tp: None,
            timeframe: None,
        };

        // With ATR mode on, the EA computes SL/TP at execution time
        if let Some(atr) = &self.config.atr {
            order.sl_tp_mode = Some("ATR".to_string());
            order.atr_period = Some(atr.period);
            order.atr_mult_sl = Some(atr.mult_sl);
            order.atr_mult_tp = Some(atr.mult_tp);
            order.timeframe = Some(sig.timeframe.clone());
        }

        let value = match serde_json::to_value(&order) {
            Ok(v) => v,
            Err(e) => {
                error!("failed to serialize order {order_id}: {e}");
                return;
            }
        };

        info!("enqueued market order from signal: {value}");
        // Both locks held across the pair (queue first, as in
        // enqueue_explicit) so no consumer can see an order whose id has no
        // status entry yet.
        let mut queue = self.queue.lock().await;
        let mut results = self.results.lock().await;
        queue.push_back(value);
        results.insert(order_id, json!({"status": "pending"}));
    }

    /// Queue one fully-specified order or an ordered batch submitted over
    /// HTTP. The whole batch is validated before anything is queued, so one
    /// invalid member leaves the queue untouched. Returns the ids in order.
    pub async fn enqueue_explicit(&self, payload: Value) -> Result<Vec<String>, DispatchError> {
        let items = match payload {
            Value::Array(items) => items,
            single => vec![single],
        };

        let mut batch = Vec::with_capacity(items.len());
        for item in items {
            let Value::Object(order) = item else {
                return Err(DispatchError::NotAnObject);
            };
            validate_explicit(&order)?;
            batch.push(order);
        }

        let mut order_ids = Vec::with_capacity(batch.len());
        let mut queue = self.queue.lock().await;
        let mut results = self.results.lock().await;
        for mut order in batch {
            let order_id = match order_id_of(&order) {
                Some(id) => id,
                None => self.next_order_id(),
            };
            order.insert("order_id".to_string(), Value::String(order_id.clone()));
            order
                .entry("comment".to_string())
                .or_insert_with(|| json!("API Order"));
            order
                .entry("magic_number".to_string())
                .or_insert_with(|| json!(self.config.magic_number));

            let order = Value::Object(order);
            info!("order queued: {order}");
            queue.push_back(order);
            results.insert(order_id.clone(), json!({"status": "pending"}));
            order_ids.push(order_id);
        }
        Ok(order_ids)
    }

    /// Oldest queued order, or `None`. Never blocks past the lock itself.
    pub async fn dequeue(&self) -> Option<Value> {
        self.queue.lock().await.pop_front()
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Store an execution result, overwriting any prior entry for that id.
    /// Results for ids this process never issued are accepted as-is; a
    /// JSON-number id is keyed by its decimal-string form so a later
    /// `/order_status/{id}` lookup finds it.
    pub async fn record_result(&self, result: Value) -> Result<String, DispatchError> {
        let order_id = match result.get("order_id") {
            Some(id) => order_id_string(id).ok_or(DispatchError::MissingOrderId)?,
            None => return Err(DispatchError::MissingOrderId),
        };
        self.results.lock().await.insert(order_id.clone(), result);
        Ok(order_id)
    }

    /// Stored result for an id, or `None` if it was never seen
    pub async fn status(&self, order_id: &str) -> Option<Value> {
        self.results.lock().await.get(order_id).cloned()
    }

    /// Millis-since-epoch as a decimal string, bumped past the previously
    /// issued id so a burst within one millisecond cannot collide.
    fn next_order_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1).to_string()
    }
}

/// Caller-supplied id from an explicit order, if usable
fn order_id_of(order: &Map<String, Value>) -> Option<String> {
    order.get("order_id").and_then(order_id_string)
}

/// Usable id value: a non-empty string, or a number coerced to its
/// decimal-string form. Everything else counts as missing.
fn order_id_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Shared required-field check for explicitly submitted orders. ATR-mode
/// orders may omit `sl`/`tp`; the EA computes them.
fn validate_explicit(order: &Map<String, Value>) -> Result<(), DispatchError> {
    const REQUIRED: [&str; 4] = ["symbol", "order_type", "volume", "price"];
    if REQUIRED.iter().any(|field| !order.contains_key(*field)) {
        return Err(DispatchError::MissingFields);
    }
    let atr_mode = order
        .get("sl_tp_mode")
        .and_then(Value::as_str)
        .is_some_and(|mode| mode.eq_ignore_ascii_case("ATR"));
    if !atr_mode && (!order.contains_key("sl") || !order.contains_key("tp")) {
        return Err(DispatchError::MissingSlTp);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Side, SignalKind};
    use std::sync::Arc;

    fn signal(symbol: &str, side: Side) -> Signal {
        Signal {
            kind: SignalKind::Arrow,
            side,
            symbol: symbol.to_string(),
            timeframe: "M5".to_string(),
            signal_time: Some("23:05".to_string()),
            signal_datetime: None,
            entry_price: None,
            log_time: "04:10:00.966".to_string(),
            source: "Dark Bands MT5".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        d.enqueue_from_signal(&signal("XAUUSD", Side::Buy)).await;
        d.enqueue_from_signal(&signal("BTCUSD", Side::Sell)).await;

        let first = d.dequeue().await.unwrap();
        let second = d.dequeue().await.unwrap();
        assert_eq!(first["symbol"], "XAUUSD");
        assert_eq!(first["order_type"], "BUY");
        assert_eq!(second["symbol"], "BTCUSD");
        assert_eq!(second["order_type"], "SELL");
        assert!(d.dequeue().await.is_none());
        assert!(d.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_signal_order_shape_and_status() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        d.enqueue_from_signal(&signal("XAUUSD", Side::Buy)).await;

        let order = d.dequeue().await.unwrap();
        assert_eq!(order["volume"], 0.01);
        assert_eq!(order["price"], 0.0);
        assert_eq!(order["sl"], 0.0);
        assert_eq!(order["tp"], 0.0);
        assert_eq!(order["magic_number"], 987_654);
        assert_eq!(order["comment"], "arrow M5 Dark Bands MT5 23:05");
        assert!(order.get("sl_tp_mode").is_none());

        let id = order["order_id"].as_str().unwrap();
        assert_eq!(d.status(id).await.unwrap(), json!({"status": "pending"}));
    }

    #[tokio::test]
    async fn test_comment_tolerates_gaps() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let mut sig = signal("XAUUSD", Side::Buy);
        sig.source = String::new();
        d.enqueue_from_signal(&sig).await;

        let order = d.dequeue().await.unwrap();
        assert_eq!(order["comment"], "arrow M5 23:05");
    }

    #[tokio::test]
    async fn test_atr_mode_attaches_parameters() {
        let config = DispatchConfig {
            atr: Some(AtrParams {
                period: 14,
                mult_sl: 2.0,
                mult_tp: 3.0,
            }),
            ..Default::default()
        };
        let d = OrderDispatcher::new(config);
        d.enqueue_from_signal(&signal("XAUUSD", Side::Buy)).await;

        let order = d.dequeue().await.unwrap();
        assert_eq!(order["sl_tp_mode"], "ATR");
        assert_eq!(order["atr_period"], 14);
        assert_eq!(order["atr_mult_sl"], 2.0);
        assert_eq!(order["atr_mult_tp"], 3.0);
        assert_eq!(order["timeframe"], "M5");
    }

    #[tokio::test]
    async fn test_symbol_filter() {
        let config = DispatchConfig {
            symbol_filter: Some(["BTCUSD".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let d = OrderDispatcher::new(config);

        d.enqueue_from_signal(&signal("ETHUSD", Side::Sell)).await;
        assert_eq!(d.queue_len().await, 0);

        d.enqueue_from_signal(&signal("BTCUSD", Side::Sell)).await;
        assert_eq!(d.queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_symbol_rejected() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        d.enqueue_from_signal(&signal("", Side::Buy)).await;
        assert_eq!(d.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_explicit_single_order() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let ids = d
            .enqueue_explicit(json!({
                "symbol": "EURUSD",
                "order_type": "BUY",
                "volume": 0.1,
                "price": 1.1,
                "sl": 1.0,
                "tp": 1.2
            }))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let order = d.dequeue().await.unwrap();
        assert_eq!(order["order_id"], ids[0].as_str());
        assert_eq!(order["comment"], "API Order");
        assert_eq!(order["magic_number"], 987_654);
        assert_eq!(d.status(&ids[0]).await.unwrap(), json!({"status": "pending"}));
    }

    #[tokio::test]
    async fn test_explicit_atr_order_without_sl_tp() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let ids = d
            .enqueue_explicit(json!({
                "symbol": "EURUSD",
                "order_type": "SELL",
                "volume": 0.1,
                "price": 0.0,
                "sl_tp_mode": "atr"
            }))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_missing_sl_tp() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let err = d
            .enqueue_explicit(json!({
                "symbol": "EURUSD",
                "order_type": "SELL",
                "volume": 0.1,
                "price": 0.0
            }))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::MissingSlTp);
        assert_eq!(d.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_explicit_batch_is_atomic() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let err = d
            .enqueue_explicit(json!([
                {"symbol": "EURUSD", "order_type": "BUY", "volume": 0.1, "price": 1.1, "sl": 1.0, "tp": 1.2},
                {"symbol": "GBPUSD"}
            ]))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::MissingFields);
        // First member must not have been queued
        assert_eq!(d.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_explicit_keeps_caller_id() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let ids = d
            .enqueue_explicit(json!({
                "symbol": "EURUSD",
                "order_type": "BUY",
                "volume": 0.1,
                "price": 1.1,
                "sl": 1.0,
                "tp": 1.2,
                "order_id": "client-7"
            }))
            .await
            .unwrap();
        assert_eq!(ids, vec!["client-7".to_string()]);
    }

    #[tokio::test]
    async fn test_result_roundtrip_and_overwrite() {
        let d = OrderDispatcher::new(DispatchConfig::default());

        // Unknown ids are accepted
        let result = json!({"order_id": "999", "status": "filled", "ticket": 42});
        assert_eq!(d.record_result(result.clone()).await.unwrap(), "999");
        assert_eq!(d.status("999").await.unwrap(), result);

        // Overwrite wins
        let newer = json!({"order_id": "999", "status": "closed"});
        d.record_result(newer.clone()).await.unwrap();
        assert_eq!(d.status("999").await.unwrap(), newer);
    }

    #[tokio::test]
    async fn test_queued_order_never_lacks_status_entry() {
        let d = Arc::new(OrderDispatcher::new(DispatchConfig::default()));

        // Stall the status table while a signal is being enqueued: the order
        // must not become poppable before its pending entry can exist.
        let stall = d.results.lock().await;
        let producer = {
            let d = d.clone();
            tokio::spawn(async move { d.enqueue_from_signal(&signal("XAUUSD", Side::Buy)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        match d.queue.try_lock() {
            // Producer is parked on the status table and still owns the queue
            Err(_) => {}
            Ok(queue) => assert!(queue.is_empty()),
        }

        drop(stall);
        producer.await.unwrap();
        let order = d.dequeue().await.unwrap();
        let id = order["order_id"].as_str().unwrap();
        assert_eq!(d.status(id).await.unwrap(), json!({"status": "pending"}));
    }

    #[tokio::test]
    async fn test_result_numeric_order_id_is_coerced() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let result = json!({"order_id": 12345, "status": "filled"});
        assert_eq!(d.record_result(result.clone()).await.unwrap(), "12345");
        assert_eq!(d.status("12345").await.unwrap(), result);
    }

    #[tokio::test]
    async fn test_explicit_numeric_caller_id_is_coerced() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let ids = d
            .enqueue_explicit(json!({
                "symbol": "EURUSD",
                "order_type": "BUY",
                "volume": 0.1,
                "price": 1.1,
                "sl": 1.0,
                "tp": 1.2,
                "order_id": 42
            }))
            .await
            .unwrap();
        assert_eq!(ids, vec!["42".to_string()]);

        let order = d.dequeue().await.unwrap();
        assert_eq!(order["order_id"], "42");
        assert_eq!(d.status("42").await.unwrap(), json!({"status": "pending"}));
    }

    #[tokio::test]
    async fn test_result_requires_order_id() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let err = d.record_result(json!({"status": "filled"})).await.unwrap_err();
        assert_eq!(err, DispatchError::MissingOrderId);
        let err = d.record_result(json!({"order_id": ""})).await.unwrap_err();
        assert_eq!(err, DispatchError::MissingOrderId);
    }

    #[tokio::test]
    async fn test_status_for_unknown_id() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        assert!(d.status("never-seen").await.is_none());
    }

    #[test]
    fn test_order_ids_strictly_increase() {
        let d = OrderDispatcher::new(DispatchConfig::default());
        let mut prev: i64 = 0;
        for _ in 0..1000 {
            let id: i64 = d.next_order_id().parse().unwrap();
            assert!(id > prev);
            prev = id;
        }
    }
}
