// =============================================================================
// Thin JSON API over the computed state
// =============================================================================

pub mod rest;
