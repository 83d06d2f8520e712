// =============================================================================
// Raw payload shapes returned by the venue's copy-trade endpoints
// =============================================================================
//
// The venue wraps every response in a `{success, data}` envelope. Sub-field
// shapes are dynamic (numbers arrive as strings, fields appear and disappear
// between app releases), so everything below the envelope is kept as
// `serde_json::Value` and interpreted by the normaliser. Only the presence of
// `activePositions[]` and `orderHistory.allOrders[]` is contractual.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Order-history page for one lead trader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderHistory {
    pub total: u64,
    pub all_orders: Vec<Value>,
}

/// Everything the scraper collected for one lead trader in one cycle.
///
/// A `None` subfield means that endpoint failed or returned a non-success
/// envelope this cycle; the rest of the payload is still processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadPayload {
    pub lead_id: String,
    /// When the scrape finished, epoch milliseconds UTC.
    pub fetched_at: i64,
    /// ROI window requested from the venue (e.g. "30D").
    pub time_range: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub lead_common: Option<Value>,
    pub portfolio_detail: Option<Value>,
    pub roi_series: Vec<Value>,
    pub asset_preferences: Option<Value>,
    pub active_positions: Vec<Value>,
    pub order_history: OrderHistory,
}

impl LeadPayload {
    /// The `positionShow` flag from the portfolio detail, if the venue
    /// exposed it. Missing detail or missing flag both yield `None`
    /// (segment UNKNOWN).
    pub fn position_show(&self) -> Option<bool> {
        self.portfolio_detail
            .as_ref()
            .and_then(|d| d.get("positionShow"))
            .and_then(Value::as_bool)
    }

    /// Trader nickname from the detail endpoint, if present.
    pub fn nickname(&self) -> Option<String> {
        self.portfolio_detail
            .as_ref()
            .and_then(|d| d.get("nickname"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Unwrap a `{success, data}` envelope, treating `success != true` as a
/// failed fetch.
pub fn unwrap_envelope(body: Value) -> Result<Value> {
    let success = body
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if !success {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        anyhow::bail!("venue returned non-success envelope: {message}");
    }

    body.get("data")
        .cloned()
        .context("success envelope missing 'data'")
}

/// Interpret an order-history `data` payload. The venue has shipped both
/// `{total, list}` objects and bare arrays; tolerate either.
pub fn parse_order_history(data: &Value) -> OrderHistory {
    if let Some(arr) = data.as_array() {
        return OrderHistory {
            total: arr.len() as u64,
            all_orders: arr.clone(),
        };
    }

    let all_orders = data
        .get("list")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let total = data
        .get("total")
        .and_then(Value::as_u64)
        .unwrap_or(all_orders.len() as u64);

    OrderHistory { total, all_orders }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwrap_success_envelope() {
        let body = json!({ "success": true, "data": { "x": 1 } });
        let data = unwrap_envelope(body).unwrap();
        assert_eq!(data["x"], 1);
    }

    #[test]
    fn unwrap_failure_envelope() {
        let body = json!({ "success": false, "message": "rate limited" });
        let err = unwrap_envelope(body).unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn unwrap_missing_success_is_failure() {
        let err = unwrap_envelope(json!({ "data": {} })).unwrap_err();
        assert!(err.to_string().contains("non-success"));
    }

    #[test]
    fn order_history_object_shape() {
        let data = json!({ "total": 120, "list": [{ "symbol": "BTCUSDT" }] });
        let oh = parse_order_history(&data);
        assert_eq!(oh.total, 120);
        assert_eq!(oh.all_orders.len(), 1);
    }

    #[test]
    fn order_history_bare_array_shape() {
        let data = json!([{ "symbol": "ETHUSDT" }, { "symbol": "BTCUSDT" }]);
        let oh = parse_order_history(&data);
        assert_eq!(oh.total, 2);
        assert_eq!(oh.all_orders.len(), 2);
    }

    #[test]
    fn position_show_extraction() {
        let payload = LeadPayload {
            lead_id: "L1".into(),
            fetched_at: 0,
            time_range: "30D".into(),
            start_time: None,
            end_time: None,
            lead_common: None,
            portfolio_detail: Some(json!({ "positionShow": false, "nickname": "whale" })),
            roi_series: vec![],
            asset_preferences: None,
            active_positions: vec![],
            order_history: OrderHistory::default(),
        };
        assert_eq!(payload.position_show(), Some(false));
        assert_eq!(payload.nickname().as_deref(), Some("whale"));
    }
}
