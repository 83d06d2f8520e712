// =============================================================================
// Visible Position Tracker — snapshot-set diffing with bounded timing
// =============================================================================
//
// For a trader whose open positions are revealed, each cycle yields a set of
// (symbol, side) keys. Diffing that set against the ACTIVE lifecycle rows
// produces three groups:
//
//   new          -> create an ACTIVE arc; open time refined by a matching
//                   OPEN event within the last 5 minutes, else the fetch
//                   instant (conservative latest bound)
//   still-active -> bump last_seen_at
//   disappeared  -> close the arc; estimated close time is the midpoint of
//                   [last_seen_at, fetched_at]
//
// With cycle interval T this bounds open-time uncertainty by T and close-time
// uncertainty by T/2.
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::normalize::NormalizedPosition;
use crate::store;
use crate::types::Side;

/// How far back an OPEN event may lie and still date a newly-seen position.
const OPEN_EVENT_MATCH_WINDOW_MS: i64 = 5 * 60 * 1_000;

/// Counts of lifecycle transitions caused by one snapshot diff.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VisibleOutcome {
    pub opened: usize,
    pub refreshed: usize,
    pub closed: usize,
}

/// Diff the snapshot set for one trader at `fetched_at` against its ACTIVE
/// lifecycle rows. Runs inside the per-trader ingest transaction.
pub fn track_visible(
    conn: &Connection,
    platform: &str,
    lead_id: &str,
    positions: &[NormalizedPosition],
    fetched_at: i64,
) -> Result<VisibleOutcome> {
    let mut outcome = VisibleOutcome::default();

    // 1. Current keys, first entry wins on duplicates.
    let mut current: HashMap<(String, Side), &NormalizedPosition> = HashMap::new();
    for p in positions {
        current.entry((p.symbol.clone(), p.side)).or_insert(p);
    }

    // 2. ACTIVE rows for this trader.
    let active = store::active_states(conn, lead_id)?;
    let active_keys: HashSet<(String, Side)> = active
        .iter()
        .map(|s| (s.symbol.clone(), s.direction))
        .collect();

    // 3. New keys: create ACTIVE arcs.
    for (key, pos) in &current {
        if active_keys.contains(key) {
            continue;
        }

        let matched = store::find_open_event(
            conn,
            lead_id,
            &key.0,
            key.1,
            fetched_at - OPEN_EVENT_MATCH_WINDOW_MS,
            fetched_at,
        )?;
        let (open_event_id, estimated_open_time) = match matched {
            Some((event_key, event_time)) => (Some(event_key), event_time),
            None => (None, fetched_at),
        };

        conn.execute(
            "INSERT INTO position_states
                 (platform, lead_id, symbol, direction, status, entry_price, amount, leverage,
                  first_seen_at, last_seen_at, estimated_open_time, open_event_id)
             VALUES (?1, ?2, ?3, ?4, 'ACTIVE', ?5, ?6, ?7, ?8, ?8, ?9, ?10)",
            params![
                platform,
                lead_id,
                key.0,
                key.1.as_str(),
                pos.entry_price,
                pos.size,
                pos.leverage,
                fetched_at,
                estimated_open_time,
                open_event_id,
            ],
        )?;
        outcome.opened += 1;
    }

    // 4. Still-active keys: bump last_seen_at.
    for state in &active {
        let key = (state.symbol.clone(), state.direction);
        if current.contains_key(&key) {
            conn.execute(
                "UPDATE position_states SET last_seen_at = ?1 WHERE id = ?2",
                params![fetched_at, state.id],
            )?;
            outcome.refreshed += 1;
        }
    }

    // 5. Disappeared keys: close with midpoint estimate.
    for state in &active {
        let key = (state.symbol.clone(), state.direction);
        if current.contains_key(&key) {
            continue;
        }
        conn.execute(
            "UPDATE position_states SET
                 status = 'CLOSED',
                 disappeared_at = ?1,
                 estimated_close_time = (last_seen_at + ?1) / 2
             WHERE id = ?2",
            params![fetched_at, state.id],
        )?;
        outcome.closed += 1;
    }

    debug!(
        lead_id,
        opened = outcome.opened,
        refreshed = outcome.refreshed,
        closed = outcome.closed,
        "visible tracker diff applied"
    );

    Ok(outcome)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NormalizedEvent;
    use crate::store::Store;
    use crate::types::{EventType, LifecycleStatus, MarginType};
    use serde_json::json;

    fn pos(symbol: &str, side: Side, entry: f64, leverage: f64) -> NormalizedPosition {
        NormalizedPosition {
            symbol: symbol.to_string(),
            side,
            contract_type: None,
            leverage: Some(leverage),
            size: Some(1.0),
            entry_price: Some(entry),
            mark_price: Some(entry),
            margin_usdt: None,
            margin_type: MarginType::Cross,
            pnl_usdt: None,
            roe_pct: None,
            raw: json!({}),
        }
    }

    fn open_event(key: &str, symbol: &str, side: Side, t: i64) -> NormalizedEvent {
        NormalizedEvent {
            event_key: key.to_string(),
            event_type: EventType::open_for(side),
            symbol: symbol.to_string(),
            price: Some(3000.0),
            amount: Some(1.0),
            amount_asset: None,
            realized_pnl: None,
            event_time_text: "01-01, 00:00:00".into(),
            event_time: t,
            fetched_at: t,
        }
    }

    #[test]
    fn lifecycle_via_snapshot_diff() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        // Cycle 0: empty snapshot, nothing happens.
        let out = track_visible(&conn, "binance", "T2", &[], 0).unwrap();
        assert_eq!(out, VisibleOutcome::default());

        // Cycle 1 at t=60s: position appears.
        let positions = vec![pos("ETHUSDT", Side::Long, 3000.0, 10.0)];
        let out = track_visible(&conn, "binance", "T2", &positions, 60_000).unwrap();
        assert_eq!(out.opened, 1);

        let states = store::active_states(&conn, "T2").unwrap();
        assert_eq!(states.len(), 1);
        let s = &states[0];
        assert_eq!(s.first_seen_at, 60_000);
        assert_eq!(s.last_seen_at, 60_000);
        // No matching OPEN event: conservative latest bound.
        assert_eq!(s.estimated_open_time, 60_000);
        assert_eq!(s.entry_price, Some(3000.0));

        // Cycle 2 at t=120s: position gone.
        let out = track_visible(&conn, "binance", "T2", &[], 120_000).unwrap();
        assert_eq!(out.closed, 1);

        let rows = store::states_for_trader(&conn, "T2", 10).unwrap();
        assert_eq!(rows.len(), 1);
        let s = &rows[0];
        assert_eq!(s.status, LifecycleStatus::Closed);
        assert_eq!(s.disappeared_at, Some(120_000));
        // Midpoint of [60s, 120s].
        assert_eq!(s.estimated_close_time, Some(90_000));
        assert!(s.last_seen_at < s.disappeared_at.unwrap());
    }

    #[test]
    fn open_event_within_window_refines_open_time() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        store::insert_events(
            &conn,
            "binance",
            "T2",
            &[open_event("k-open", "ETHUSDT", Side::Long, 58_000)],
        )
        .unwrap();

        let positions = vec![pos("ETHUSDT", Side::Long, 3000.0, 10.0)];
        track_visible(&conn, "binance", "T2", &positions, 60_000).unwrap();

        let s = &store::active_states(&conn, "T2").unwrap()[0];
        assert_eq!(s.estimated_open_time, 58_000);
        assert_eq!(s.open_event_id.as_deref(), Some("k-open"));
    }

    #[test]
    fn open_event_outside_window_is_ignored() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let fetched_at = 10 * 60 * 1000;
        store::insert_events(
            &conn,
            "binance",
            "T2",
            &[open_event(
                "k-old",
                "ETHUSDT",
                Side::Long,
                fetched_at - OPEN_EVENT_MATCH_WINDOW_MS - 1,
            )],
        )
        .unwrap();

        let positions = vec![pos("ETHUSDT", Side::Long, 3000.0, 10.0)];
        track_visible(&conn, "binance", "T2", &positions, fetched_at).unwrap();

        let s = &store::active_states(&conn, "T2").unwrap()[0];
        assert_eq!(s.estimated_open_time, fetched_at);
        assert_eq!(s.open_event_id, None);
    }

    #[test]
    fn repeated_snapshots_keep_a_single_active_row() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let positions = vec![pos("BTCUSDT", Side::Short, 60_000.0, 5.0)];

        track_visible(&conn, "binance", "T1", &positions, 1_000).unwrap();
        let out = track_visible(&conn, "binance", "T1", &positions, 2_000).unwrap();
        assert_eq!(out.opened, 0);
        assert_eq!(out.refreshed, 1);

        let states = store::active_states(&conn, "T1").unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].last_seen_at, 2_000);
        assert_eq!(states[0].first_seen_at, 1_000);
    }

    #[test]
    fn long_and_short_on_same_symbol_are_distinct_arcs() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let positions = vec![
            pos("BTCUSDT", Side::Long, 60_000.0, 5.0),
            pos("BTCUSDT", Side::Short, 60_000.0, 5.0),
        ];

        let out = track_visible(&conn, "binance", "T1", &positions, 1_000).unwrap();
        assert_eq!(out.opened, 2);

        // Only the short disappears.
        let remaining = vec![pos("BTCUSDT", Side::Long, 60_000.0, 5.0)];
        let out = track_visible(&conn, "binance", "T1", &remaining, 2_000).unwrap();
        assert_eq!(out.closed, 1);
        assert_eq!(out.refreshed, 1);

        let active = store::active_states(&conn, "T1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].direction, Side::Long);
    }
}
