// =============================================================================
// Venue access — public copy-trade endpoints of the exchange
// =============================================================================

pub mod client;
pub mod models;

pub use client::VenueClient;
pub use models::{LeadPayload, OrderHistory};
