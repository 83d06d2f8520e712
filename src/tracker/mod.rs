// =============================================================================
// Position lifecycle tracking
// =============================================================================
//
// Two reconciliation paths feed the same `position_states` table:
//   - `visible`: diffs successive snapshot sets for traders whose positions
//     the venue reveals.
//   - `hidden`: derives arcs from deduplicated open/close order events for
//     traders that expose only an order log.
//
// Both uphold the same invariant: at most one ACTIVE row per
// (trader, symbol, direction), enforced by a partial unique index.
// =============================================================================

pub mod hidden;
pub mod visible;
