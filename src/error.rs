// =============================================================================
// Error kinds for the scrape → normalise → ingest pipeline
// =============================================================================
//
// Recovery policy:
//   - A single failed endpoint degrades to a null subfield (TransientFetch).
//   - A trader whose payload is unusable is skipped for the cycle.
//   - Duplicate events are dropped silently (idempotent by design).
//   - Only store-level faults abort the cycle; the process stays alive and
//     retries at the next tick.
// =============================================================================

use thiserror::Error;

/// Failure of the scraper client for one lead trader.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Every one of the per-trader endpoints failed; there is nothing to
    /// normalise. Individual endpoint failures are not errors — they yield
    /// null subfields in the payload.
    #[error("all endpoints failed for lead {lead_id}: {detail}")]
    AllEndpointsFailed { lead_id: String, detail: String },
}

/// Failure while turning a raw payload into stored state.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The payload violated a structural expectation (e.g. a position entry
    /// without a symbol). The trader is skipped for this cycle.
    #[error("payload validation failed for lead {lead_id}: {detail}")]
    Validation { lead_id: String, detail: String },

    /// A store-level fault outside the scope of a single trader. Propagated
    /// so the scheduler aborts the cycle.
    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),
}
