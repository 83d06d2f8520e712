// =============================================================================
// Hidden Position Tracker — lifecycle arcs from deduplicated order events
// =============================================================================
//
// For traders whose positions the venue hides, the order log is the only
// signal. Freshly-inserted events are replayed in chronological order:
//
//   OPEN_*   -> create an ACTIVE arc if none exists for the key, else refresh
//   CLOSE_*  -> close the most recent ACTIVE arc for the key; a close with no
//               matching open is counted (confidence input) but creates no row
//
// Because the caller passes only events that were new this cycle, re-ingesting
// an identical payload is a no-op here.
// =============================================================================

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::normalize::NormalizedEvent;

/// Counts of lifecycle transitions caused by one event replay.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HiddenOutcome {
    pub opened: usize,
    pub refreshed: usize,
    pub closed: usize,
    /// CLOSE events with no matching ACTIVE arc.
    pub orphan_closes: usize,
}

/// Replay `fresh_events` (chronological) into lifecycle rows for one trader.
/// Runs inside the per-trader ingest transaction.
pub fn track_hidden(
    conn: &Connection,
    platform: &str,
    lead_id: &str,
    fresh_events: &[NormalizedEvent],
) -> Result<HiddenOutcome> {
    let mut outcome = HiddenOutcome::default();

    for event in fresh_events {
        let Some(side) = event.event_type.side() else {
            continue; // UNKNOWN actions carry no lifecycle information
        };

        if event.event_type.is_open() {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM position_states
                     WHERE lead_id = ?1 AND symbol = ?2 AND direction = ?3 AND status = 'ACTIVE'",
                    params![lead_id, event.symbol, side.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE position_states
                         SET last_seen_at = MAX(last_seen_at, ?1)
                         WHERE id = ?2",
                        params![event.event_time, id],
                    )?;
                    outcome.refreshed += 1;
                }
                None => {
                    conn.execute(
                        "INSERT INTO position_states
                             (platform, lead_id, symbol, direction, status, entry_price, amount,
                              first_seen_at, last_seen_at, estimated_open_time, open_event_id)
                         VALUES (?1, ?2, ?3, ?4, 'ACTIVE', ?5, ?6, ?7, ?7, ?7, ?8)",
                        params![
                            platform,
                            lead_id,
                            event.symbol,
                            side.as_str(),
                            event.price,
                            event.amount,
                            event.event_time,
                            event.event_key,
                        ],
                    )?;
                    outcome.opened += 1;
                }
            }
        } else {
            // Close the most recent ACTIVE arc for this key.
            let target: Option<i64> = conn
                .query_row(
                    "SELECT id FROM position_states
                     WHERE lead_id = ?1 AND symbol = ?2 AND direction = ?3 AND status = 'ACTIVE'
                     ORDER BY first_seen_at DESC LIMIT 1",
                    params![lead_id, event.symbol, side.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            match target {
                Some(id) => {
                    conn.execute(
                        "UPDATE position_states SET
                             status = 'CLOSED',
                             disappeared_at = ?1,
                             estimated_close_time = ?1,
                             close_event_id = ?2
                         WHERE id = ?3",
                        params![event.event_time, event.event_key, id],
                    )?;
                    outcome.closed += 1;
                }
                None => {
                    outcome.orphan_closes += 1;
                }
            }
        }
    }

    debug!(
        lead_id,
        opened = outcome.opened,
        refreshed = outcome.refreshed,
        closed = outcome.closed,
        orphans = outcome.orphan_closes,
        "hidden tracker replay applied"
    );

    Ok(outcome)
}
