// =============================================================================
// Payload Normaliser — raw venue shapes to internal position/event records
// =============================================================================
//
// The venue's payloads are dynamically typed: numbers arrive as strings,
// optional fields come and go. Everything here converts `serde_json::Value`
// entries into typed records with explicit rules; unrecognised fields survive
// only in the RawIngest blob.
//
// Traps handled here:
//   - One-way accounts report `positionSide=BOTH`; the side is inferred from
//     the sign of `positionAmount` and BOTH is never carried forward.
//   - Order timestamps: prefer the epoch-millisecond field; fall back to the
//     "MM-DD, HH:MM:SS" text tag reconstructed with the fetch year, stepping
//     one year back when the result would lie in the future.
// =============================================================================

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::IngestError;
use crate::types::{EventType, MarginType, Side};
use crate::venue::models::LeadPayload;

/// Window format of the textual order timestamp, without a year.
const EVENT_TIME_TEXT_FMT: &str = "%m-%d, %H:%M:%S";

// ---------------------------------------------------------------------------
// Normalised records
// ---------------------------------------------------------------------------

/// One observed position of a lead trader at a single fetch instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedPosition {
    pub symbol: String,
    pub side: Side,
    pub contract_type: Option<String>,
    pub leverage: Option<f64>,
    /// Position amount as reported, sign semantics per side.
    pub size: Option<f64>,
    pub entry_price: Option<f64>,
    pub mark_price: Option<f64>,
    pub margin_usdt: Option<f64>,
    pub margin_type: MarginType,
    pub pnl_usdt: Option<f64>,
    pub roe_pct: Option<f64>,
    /// Original entry, preserved verbatim.
    pub raw: Value,
}

/// One order-history entry mapped to a semantic action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// `platform|leadId|eventType|symbol|eventTimeText|amount|price` — the
    /// amount/price components use the raw text as scraped so the key is
    /// stable across re-ingests.
    pub event_key: String,
    pub event_type: EventType,
    pub symbol: String,
    pub price: Option<f64>,
    pub amount: Option<f64>,
    pub amount_asset: Option<String>,
    /// Realised PnL, kept only when positive.
    pub realized_pnl: Option<f64>,
    pub event_time_text: String,
    /// Absolute UTC epoch milliseconds.
    pub event_time: i64,
    pub fetched_at: i64,
}

/// Output of normalising one raw payload.
#[derive(Debug, Clone, Default)]
pub struct NormalizedPayload {
    pub positions: Vec<NormalizedPosition>,
    pub events: Vec<NormalizedEvent>,
    /// Entries skipped because they were structurally unusable.
    pub skipped_entries: usize,
}

// ---------------------------------------------------------------------------
// Tolerant value extraction
// ---------------------------------------------------------------------------

/// Read a JSON value that may be either a string or a number as `f64`.
pub fn value_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Read a JSON value that may be either a string or a number as `i64`.
pub fn value_i64(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}

fn value_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(Value::as_str)
}

/// The raw textual form of a field, used for stable dedup keys.
fn value_text(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Normalisation entry point
// ---------------------------------------------------------------------------

/// Normalise one raw payload. Pure: the output is a function of the payload
/// alone, so replaying the same RawIngest yields identical records.
pub fn normalize_payload(
    platform: &str,
    payload: &LeadPayload,
) -> Result<NormalizedPayload, IngestError> {
    if payload.lead_id.is_empty() {
        return Err(IngestError::Validation {
            lead_id: String::new(),
            detail: "payload has no lead id".to_string(),
        });
    }

    let mut out = NormalizedPayload::default();

    for entry in &payload.active_positions {
        match normalize_position(entry) {
            Some(p) => out.positions.push(p),
            None => {
                warn!(lead_id = %payload.lead_id, "skipping unusable position entry");
                out.skipped_entries += 1;
            }
        }
    }

    for order in &payload.order_history.all_orders {
        match normalize_order(platform, &payload.lead_id, order, payload.fetched_at) {
            Some(e) => out.events.push(e),
            None => {
                warn!(lead_id = %payload.lead_id, "skipping unusable order entry");
                out.skipped_entries += 1;
            }
        }
    }

    // Chronological order matters for the hidden tracker.
    out.events.sort_by_key(|e| e.event_time);

    Ok(out)
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

fn normalize_position(entry: &Value) -> Option<NormalizedPosition> {
    let symbol = value_str(entry.get("symbol"))?.to_string();

    let size = value_f64(entry.get("positionAmount"));
    let side = match value_str(entry.get("positionSide")) {
        Some("LONG") => Side::Long,
        Some("SHORT") => Side::Short,
        // One-way account: side comes from the sign of the amount.
        _ => {
            if size.unwrap_or(0.0) >= 0.0 {
                Side::Long
            } else {
                Side::Short
            }
        }
    };

    let leverage = value_f64(entry.get("leverage"));
    let notional = value_f64(entry.get("notionalValue"));
    let margin_usdt = match (notional, leverage) {
        (Some(n), Some(l)) if l > 0.0 => Some(n.abs() / l),
        _ => None,
    };

    let margin_type = if entry.get("isolated").and_then(Value::as_bool) == Some(true) {
        MarginType::Isolated
    } else {
        MarginType::Cross
    };

    Some(NormalizedPosition {
        symbol,
        side,
        contract_type: value_str(entry.get("contractType")).map(str::to_string),
        leverage,
        size,
        entry_price: value_f64(entry.get("entryPrice")),
        mark_price: value_f64(entry.get("markPrice")),
        margin_usdt,
        margin_type,
        pnl_usdt: value_f64(entry.get("unrealizedProfit")),
        roe_pct: value_f64(entry.get("roe")).map(|r| r * 100.0),
        raw: entry.clone(),
    })
}

// ---------------------------------------------------------------------------
// Orders → events
// ---------------------------------------------------------------------------

/// Map the (side, positionSide) pair of a raw order to a semantic action.
fn classify_order(side: Option<&str>, position_side: Option<&str>) -> EventType {
    match (side, position_side) {
        (Some("BUY"), Some("LONG")) => EventType::OpenLong,
        (Some("SELL"), Some("LONG")) => EventType::CloseLong,
        (Some("SELL"), Some("SHORT")) => EventType::OpenShort,
        (Some("BUY"), Some("SHORT")) => EventType::CloseShort,
        _ => EventType::Unknown,
    }
}

fn normalize_order(
    platform: &str,
    lead_id: &str,
    order: &Value,
    fetched_at: i64,
) -> Option<NormalizedEvent> {
    let symbol = value_str(order.get("symbol"))?.to_string();

    let event_type = classify_order(
        value_str(order.get("side")),
        value_str(order.get("positionSide")),
    );

    // Prefer the epoch-millisecond field; reconstruct from text otherwise.
    let (event_time, event_time_text) = match value_i64(order.get("orderUpdateTime"))
        .or_else(|| value_i64(order.get("orderTime")))
    {
        Some(ms) => {
            let text = Utc
                .timestamp_millis_opt(ms)
                .single()?
                .format(EVENT_TIME_TEXT_FMT)
                .to_string();
            (ms, text)
        }
        None => {
            let text = value_str(order.get("updateTimeText"))?.to_string();
            let ms = reconstruct_event_time(&text, fetched_at)?;
            (ms, text)
        }
    };

    let qty_text = value_text(order.get("executedQty"));
    let price_text = value_text(order.get("avgPrice"));
    let event_key = format!(
        "{platform}|{lead_id}|{}|{symbol}|{event_time_text}|{qty_text}|{price_text}",
        event_type.as_str()
    );

    let realized_pnl = value_f64(order.get("totalPnl")).filter(|pnl| *pnl > 0.0);

    Some(NormalizedEvent {
        event_key,
        event_type,
        symbol,
        price: value_f64(order.get("avgPrice")),
        amount: value_f64(order.get("executedQty")),
        amount_asset: value_str(order.get("baseAsset")).map(str::to_string),
        realized_pnl,
        event_time_text,
        event_time,
        fetched_at,
    })
}

/// Rebuild an absolute UTC instant from a year-less "MM-DD, HH:MM:SS" tag.
///
/// The year is taken from `fetched_at`; if the reconstructed instant lies in
/// the future relative to `fetched_at`, the previous year is selected. This
/// rule must be preserved exactly — getting it wrong corrupts lifecycle
/// ordering around New Year.
pub fn reconstruct_event_time(text: &str, fetched_at: i64) -> Option<i64> {
    let fetched: DateTime<Utc> = Utc.timestamp_millis_opt(fetched_at).single()?;

    let parse_with_year = |year: i32| -> Option<i64> {
        let full = format!("{year}-{text}");
        let naive = NaiveDateTime::parse_from_str(&full, "%Y-%m-%d, %H:%M:%S").ok()?;
        Some(Utc.from_utc_datetime(&naive).timestamp_millis())
    };

    let this_year = parse_with_year(fetched.year());
    match this_year {
        Some(ms) if ms <= fetched_at => Some(ms),
        // Future relative to fetch, or an invalid date this year (Feb 29):
        // the observation must belong to the previous year.
        _ => parse_with_year(fetched.year() - 1),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::models::OrderHistory;
    use serde_json::json;

    fn payload_with(positions: Vec<Value>, orders: Vec<Value>) -> LeadPayload {
        LeadPayload {
            lead_id: "L1".into(),
            fetched_at: 1_700_000_000_000,
            time_range: "30D".into(),
            start_time: None,
            end_time: None,
            lead_common: None,
            portfolio_detail: None,
            roi_series: vec![],
            asset_preferences: None,
            active_positions: positions,
            order_history: OrderHistory {
                total: orders.len() as u64,
                all_orders: orders,
            },
        }
    }

    #[test]
    fn one_way_account_side_is_inferred_from_amount_sign() {
        let p = payload_with(
            vec![
                json!({ "symbol": "BTCUSDT", "positionSide": "BOTH", "positionAmount": "0.5" }),
                json!({ "symbol": "ETHUSDT", "positionSide": "BOTH", "positionAmount": "-2.0" }),
                json!({ "symbol": "SOLUSDT", "positionSide": "SHORT", "positionAmount": "10" }),
            ],
            vec![],
        );
        let out = normalize_payload("binance", &p).unwrap();
        assert_eq!(out.positions[0].side, Side::Long);
        assert_eq!(out.positions[1].side, Side::Short);
        assert_eq!(out.positions[2].side, Side::Short);
    }

    #[test]
    fn margin_is_notional_over_leverage() {
        let p = payload_with(
            vec![json!({
                "symbol": "BTCUSDT",
                "positionSide": "LONG",
                "positionAmount": "0.5",
                "notionalValue": "-30000",
                "leverage": "10",
                "isolated": true,
            })],
            vec![],
        );
        let out = normalize_payload("binance", &p).unwrap();
        let pos = &out.positions[0];
        assert_eq!(pos.margin_usdt, Some(3000.0));
        assert_eq!(pos.margin_type, MarginType::Isolated);
    }

    #[test]
    fn margin_is_null_without_notional() {
        let p = payload_with(
            vec![json!({ "symbol": "BTCUSDT", "positionSide": "LONG", "leverage": "10" })],
            vec![],
        );
        let out = normalize_payload("binance", &p).unwrap();
        assert_eq!(out.positions[0].margin_usdt, None);
        assert_eq!(out.positions[0].margin_type, MarginType::Cross);
    }

    #[test]
    fn order_classification_covers_all_pairs() {
        assert_eq!(
            classify_order(Some("BUY"), Some("LONG")),
            EventType::OpenLong
        );
        assert_eq!(
            classify_order(Some("SELL"), Some("LONG")),
            EventType::CloseLong
        );
        assert_eq!(
            classify_order(Some("SELL"), Some("SHORT")),
            EventType::OpenShort
        );
        assert_eq!(
            classify_order(Some("BUY"), Some("SHORT")),
            EventType::CloseShort
        );
        assert_eq!(classify_order(Some("BUY"), Some("BOTH")), EventType::Unknown);
        assert_eq!(classify_order(None, Some("LONG")), EventType::Unknown);
    }

    #[test]
    fn event_key_uses_raw_text_fields() {
        let p = payload_with(
            vec![],
            vec![json!({
                "symbol": "BTCUSDT",
                "side": "BUY",
                "positionSide": "LONG",
                "executedQty": "0.100",
                "avgPrice": "60000.5",
                "orderUpdateTime": 1_699_999_000_000_i64,
            })],
        );
        let out = normalize_payload("binance", &p).unwrap();
        let ev = &out.events[0];
        assert!(ev.event_key.starts_with("binance|L1|OPEN_LONG|BTCUSDT|"));
        assert!(ev.event_key.ends_with("|0.100|60000.5"));
        assert_eq!(ev.event_time, 1_699_999_000_000);
    }

    #[test]
    fn realized_pnl_kept_only_when_positive() {
        let orders = vec![
            json!({ "symbol": "A", "side": "SELL", "positionSide": "LONG",
                    "orderUpdateTime": 1_000_i64, "totalPnl": "12.5" }),
            json!({ "symbol": "B", "side": "SELL", "positionSide": "LONG",
                    "orderUpdateTime": 2_000_i64, "totalPnl": "-3.0" }),
        ];
        let p = payload_with(vec![], orders);
        let out = normalize_payload("binance", &p).unwrap();
        assert_eq!(out.events[0].realized_pnl, Some(12.5));
        assert_eq!(out.events[1].realized_pnl, None);
    }

    #[test]
    fn events_are_sorted_chronologically() {
        let orders = vec![
            json!({ "symbol": "A", "side": "BUY", "positionSide": "LONG",
                    "orderUpdateTime": 5_000_i64 }),
            json!({ "symbol": "A", "side": "SELL", "positionSide": "LONG",
                    "orderUpdateTime": 1_000_i64 }),
        ];
        let p = payload_with(vec![], orders);
        let out = normalize_payload("binance", &p).unwrap();
        assert_eq!(out.events[0].event_time, 1_000);
        assert_eq!(out.events[1].event_time, 5_000);
    }

    #[test]
    fn time_reconstruction_uses_fetch_year() {
        // fetched 2023-11-14 22:13:20 UTC
        let fetched_at = 1_700_000_000_000_i64;
        let ms = reconstruct_event_time("11-01, 08:30:00", fetched_at).unwrap();
        let dt = Utc.timestamp_millis_opt(ms).unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2023-11-01 08:30:00");
    }

    #[test]
    fn time_reconstruction_steps_back_a_year_for_future_dates() {
        // fetched 2024-01-01 10:00:00 UTC; a "12-31" tag must mean last year.
        let fetched_at = Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .unwrap()
            .timestamp_millis();
        let ms = reconstruct_event_time("12-31, 23:00:00", fetched_at).unwrap();
        let dt = Utc.timestamp_millis_opt(ms).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2023-12-31");
    }

    #[test]
    fn normalisation_is_deterministic() {
        let p = payload_with(
            vec![json!({ "symbol": "BTCUSDT", "positionSide": "LONG", "positionAmount": "1" })],
            vec![json!({ "symbol": "BTCUSDT", "side": "BUY", "positionSide": "LONG",
                         "executedQty": "1", "avgPrice": "60000",
                         "orderUpdateTime": 1_000_i64 })],
        );
        let a = normalize_payload("binance", &p).unwrap();
        let b = normalize_payload("binance", &p).unwrap();
        assert_eq!(a.events[0].event_key, b.events[0].event_key);
        assert_eq!(a.positions.len(), b.positions.len());
    }

    #[test]
    fn unusable_entries_are_skipped_not_fatal() {
        let p = payload_with(
            vec![json!({ "positionSide": "LONG" })], // no symbol
            vec![json!({ "side": "BUY" })],          // no symbol either
        );
        let out = normalize_payload("binance", &p).unwrap();
        assert!(out.positions.is_empty());
        assert!(out.events.is_empty());
        assert_eq!(out.skipped_entries, 2);
    }
}
