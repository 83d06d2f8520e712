// =============================================================================
// Symbol Aggregator — open-interest counts from each trader's latest snapshot
// =============================================================================
//
// For every trader that has any snapshot rows, only the set at that trader's
// maximum `fetched_at` counts. The whole table for the platform is rebuilt on
// every ingest, so the computation is idempotent under replay of the same
// input.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::types::Side;

/// Rebuild `symbol_aggregations` for `platform`. Returns the number of
/// symbols written. Runs inside the per-trader ingest transaction, which
/// serialises it globally.
pub fn recompute(conn: &Connection, platform: &str, now: i64) -> Result<usize> {
    // Latest snapshot set per trader, counted by (symbol, side).
    let mut stmt = conn.prepare(
        "SELECT s.symbol, s.side, COUNT(*)
         FROM position_snapshots s
         JOIN (SELECT lead_id, MAX(fetched_at) AS max_fetched
               FROM position_snapshots WHERE platform = ?1 GROUP BY lead_id) latest
           ON s.lead_id = latest.lead_id AND s.fetched_at = latest.max_fetched
         WHERE s.platform = ?1
         GROUP BY s.symbol, s.side",
    )?;

    let mut counts: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    let rows = stmt.query_map(params![platform], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for row in rows {
        let (symbol, side, n) = row?;
        let entry = counts.entry(symbol).or_insert((0, 0));
        match Side::parse(&side) {
            Some(Side::Long) => entry.0 += n,
            Some(Side::Short) => entry.1 += n,
            None => {}
        }
    }

    conn.execute(
        "DELETE FROM symbol_aggregations WHERE platform = ?1",
        params![platform],
    )?;

    let mut insert = conn.prepare(
        "INSERT INTO symbol_aggregations
             (platform, symbol, open_long_count, open_short_count, total_open,
              latest_event_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5,
                 (SELECT MAX(event_time) FROM events WHERE platform = ?1 AND symbol = ?2),
                 ?6)",
    )?;

    let written = counts.len();
    for (symbol, (longs, shorts)) in counts {
        insert.execute(params![platform, symbol, longs, shorts, longs + shorts, now])?;
    }

    debug!(platform, symbols = written, "symbol aggregations rebuilt");
    Ok(written)
}
