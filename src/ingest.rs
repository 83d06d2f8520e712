// =============================================================================
// Ingest pipeline — one trader, one cycle, one transaction
// =============================================================================
//
// Order inside the transaction:
//   upsert trader -> insert snapshots -> track visible -> insert events ->
//   track hidden -> insert raw payload -> rebuild aggregates -> rescore
//
// The visible tracker runs only for VISIBLE traders (snapshot diffing a
// hidden trader's always-empty set would tear down event-derived arcs); the
// hidden tracker runs for everyone else. A failure anywhere rolls back every
// write of this trader's cycle.
// =============================================================================

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument};

use crate::aggregate;
use crate::error::IngestError;
use crate::normalize;
use crate::score;
use crate::store::{self, Store};
use crate::tracker::{hidden, visible};
use crate::types::TraderSegment;
use crate::venue::models::LeadPayload;

/// What one trader's ingest did, for logging and the scheduler report.
#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub lead_id: String,
    pub fetched_at: i64,
    pub segment_visible: bool,
    pub snapshots_inserted: usize,
    pub events_inserted: usize,
    pub events_duplicate: usize,
    pub arcs_opened: usize,
    pub arcs_closed: usize,
    pub orphan_closes: usize,
    pub aggregated_symbols: usize,
    pub trader_weight: f64,
}

/// Normalise `payload` and commit it as one per-trader transaction.
#[instrument(skip(db, payload), fields(lead_id = %payload.lead_id))]
pub fn ingest_payload(db: &Store, platform: &str, payload: &LeadPayload) -> Result<IngestReport> {
    let normalized = normalize::normalize_payload(platform, payload)?;
    let position_show = payload.position_show();
    let nickname = payload.nickname();
    let fetched_at = payload.fetched_at;

    let transaction = db.with_tx(|tx| {
        store::upsert_lead_trader(
            tx,
            platform,
            &payload.lead_id,
            nickname.as_deref(),
            position_show,
            fetched_at,
        )?;

        // The flag just written decides which tracker owns this trader's
        // lifecycle for the cycle.
        let segment = store::get_lead_trader(tx, platform, &payload.lead_id)?
            .map(|t| t.segment())
            .unwrap_or(TraderSegment::Unknown);
        let is_visible = segment == TraderSegment::Visible;

        let snapshots_inserted = store::insert_snapshots(
            tx,
            platform,
            &payload.lead_id,
            fetched_at,
            &normalized.positions,
        )?;

        let visible_outcome = if is_visible {
            Some(visible::track_visible(
                tx,
                platform,
                &payload.lead_id,
                &normalized.positions,
                fetched_at,
            )?)
        } else {
            None
        };

        let event_outcome =
            store::insert_events(tx, platform, &payload.lead_id, &normalized.events)?;

        let hidden_outcome = if is_visible {
            None
        } else {
            Some(hidden::track_hidden(
                tx,
                platform,
                &payload.lead_id,
                &event_outcome.fresh,
            )?)
        };

        store::insert_raw_ingest(tx, platform, payload)?;

        let aggregated_symbols = aggregate::recompute(tx, platform, fetched_at)?;
        let score_row = score::recompute(tx, platform, &payload.lead_id, fetched_at)?;

        Ok(IngestReport {
            lead_id: payload.lead_id.clone(),
            fetched_at,
            segment_visible: is_visible,
            snapshots_inserted,
            events_inserted: event_outcome.fresh.len(),
            events_duplicate: event_outcome.duplicates,
            arcs_opened: visible_outcome.as_ref().map(|v| v.opened).unwrap_or(0)
                + hidden_outcome.as_ref().map(|h| h.opened).unwrap_or(0),
            arcs_closed: visible_outcome.as_ref().map(|v| v.closed).unwrap_or(0)
                + hidden_outcome.as_ref().map(|h| h.closed).unwrap_or(0),
            orphan_closes: hidden_outcome.map(|h| h.orphan_closes).unwrap_or(0),
            aggregated_symbols,
            trader_weight: score_row.trader_weight,
        })
    });

    // Database faults keep their type on the way out so the scheduler can
    // tell a store-level fault (abort the cycle) apart from a per-trader
    // payload problem (skip the trader).
    let report = transaction.map_err(|e| match e.downcast::<rusqlite::Error>() {
        Ok(sql_err) => anyhow::Error::from(IngestError::Store(sql_err)),
        Err(other) => other,
    })?;

    info!(
        lead_id = %report.lead_id,
        visible = report.segment_visible,
        snapshots = report.snapshots_inserted,
        new_events = report.events_inserted,
        dup_events = report.events_duplicate,
        opened = report.arcs_opened,
        closed = report.arcs_closed,
        weight = report.trader_weight,
        "trader ingest committed"
    );
    Ok(report)
}
