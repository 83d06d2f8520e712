// =============================================================================
// Venue REST client — seven public copy-trade endpoints per lead trader
// =============================================================================
//
// All endpoints are public HTTPS; no signing is involved. Per request the
// client applies the configured deadline, and a failed request degrades to a
// null subfield in the assembled payload — the scrape as a whole fails only
// when every endpoint failed.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::ScrapeError;
use crate::types::now_ms;
use crate::venue::models::{parse_order_history, unwrap_envelope, LeadPayload, OrderHistory};

/// ROI window requested from the venue on every cycle.
const ROI_TIME_RANGE: &str = "30D";

/// Public copy-trade REST client.
#[derive(Clone)]
pub struct VenueClient {
    base_url: String,
    order_page_size: u32,
    client: reqwest::Client,
}

impl VenueClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `VenueClient`.
    ///
    /// # Arguments
    /// * `base_url`        — venue API root, e.g. `https://www.binance.com/bapi/futures`.
    /// * `timeout_ms`      — per-request deadline.
    /// * `order_page_size` — max orders fetched per trader per cycle.
    pub fn new(base_url: impl Into<String>, timeout_ms: u64, order_page_size: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, timeout_ms, "VenueClient initialised");

        Self {
            base_url,
            order_page_size,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Per-lead scrape
    // -------------------------------------------------------------------------

    /// Fetch all seven endpoints for one lead trader concurrently and
    /// assemble the raw payload.
    ///
    /// Individual endpoint failures are logged and become null subfields.
    /// Returns `ScrapeError::AllEndpointsFailed` only when nothing at all
    /// could be fetched.
    #[instrument(skip(self), name = "venue::fetch_lead")]
    pub async fn fetch_lead(&self, lead_id: &str) -> Result<LeadPayload, ScrapeError> {
        let end_time = now_ms();
        let start_time = end_time - 30 * 24 * 3_600_000;

        let (detail, common, positions, roi_series, asset_prefs, roi_chart, orders) = tokio::join!(
            self.portfolio_detail(lead_id),
            self.lead_common(lead_id),
            self.active_positions(lead_id),
            self.roi_series(lead_id),
            self.asset_preferences(lead_id),
            self.roi_chart(lead_id),
            self.order_history(lead_id),
        );

        let mut failures: Vec<String> = Vec::new();
        let mut note = |name: &str, err: &anyhow::Error| {
            warn!(lead_id, endpoint = name, error = %err, "endpoint fetch failed");
            failures.push(format!("{name}: {err:#}"));
        };

        let portfolio_detail = match detail {
            Ok(v) => Some(v),
            Err(e) => {
                note("detail", &e);
                None
            }
        };
        let lead_common = match common {
            Ok(v) => Some(v),
            Err(e) => {
                note("common", &e);
                None
            }
        };
        let active_positions = match positions {
            Ok(v) => v,
            Err(e) => {
                note("positions", &e);
                Vec::new()
            }
        };
        let roi_series = match roi_series {
            Ok(v) => v,
            Err(e) => {
                note("roi-series", &e);
                Vec::new()
            }
        };
        let asset_preferences = match asset_prefs {
            Ok(v) => Some(v),
            Err(e) => {
                note("asset-preferences", &e);
                None
            }
        };
        // The ROI chart is merged into the detail blob; it has no slot of its
        // own in the payload but still counts toward total failure.
        let roi_chart = match roi_chart {
            Ok(v) => Some(v),
            Err(e) => {
                note("roi-chart", &e);
                None
            }
        };
        let order_history = match orders {
            Ok(v) => v,
            Err(e) => {
                note("order-history", &e);
                OrderHistory::default()
            }
        };

        if failures.len() == 7 {
            return Err(ScrapeError::AllEndpointsFailed {
                lead_id: lead_id.to_string(),
                detail: failures.join("; "),
            });
        }

        let portfolio_detail = match (portfolio_detail, roi_chart) {
            (Some(mut d), Some(chart)) => {
                if let Some(obj) = d.as_object_mut() {
                    obj.insert("roiChart".to_string(), chart);
                }
                Some(d)
            }
            (Some(d), None) => Some(d),
            (None, Some(chart)) => Some(serde_json::json!({ "roiChart": chart })),
            (None, None) => None,
        };

        let payload = LeadPayload {
            lead_id: lead_id.to_string(),
            fetched_at: now_ms(),
            time_range: ROI_TIME_RANGE.to_string(),
            start_time: Some(start_time),
            end_time: Some(end_time),
            lead_common,
            portfolio_detail,
            roi_series,
            asset_preferences,
            active_positions,
            order_history,
        };

        debug!(
            lead_id,
            positions = payload.active_positions.len(),
            orders = payload.order_history.all_orders.len(),
            failed_endpoints = failures.len(),
            "lead payload assembled"
        );

        Ok(payload)
    }

    // -------------------------------------------------------------------------
    // Individual endpoints
    // -------------------------------------------------------------------------

    async fn portfolio_detail(&self, lead_id: &str) -> Result<Value> {
        self.get_data(&format!(
            "{}/v1/friendly/future/copy-trade/lead-portfolio/detail?portfolioId={lead_id}",
            self.base_url
        ))
        .await
    }

    async fn lead_common(&self, lead_id: &str) -> Result<Value> {
        self.get_data(&format!(
            "{}/v1/friendly/future/copy-trade/lead-data/common?portfolioId={lead_id}",
            self.base_url
        ))
        .await
    }

    async fn active_positions(&self, lead_id: &str) -> Result<Vec<Value>> {
        let data = self
            .get_data(&format!(
                "{}/v1/friendly/future/copy-trade/lead-data/positions?portfolioId={lead_id}",
                self.base_url
            ))
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    async fn roi_series(&self, lead_id: &str) -> Result<Vec<Value>> {
        let data = self
            .get_data(&format!(
                "{}/v2/friendly/future/copy-trade/lead-portfolio/performance?portfolioId={lead_id}&timeRange={ROI_TIME_RANGE}",
                self.base_url
            ))
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    async fn asset_preferences(&self, lead_id: &str) -> Result<Value> {
        self.get_data(&format!(
            "{}/v1/friendly/future/copy-trade/lead-data/asset-preference?portfolioId={lead_id}",
            self.base_url
        ))
        .await
    }

    async fn roi_chart(&self, lead_id: &str) -> Result<Value> {
        self.get_data(&format!(
            "{}/v1/friendly/future/copy-trade/lead-portfolio/chart-data?portfolioId={lead_id}&timeRange={ROI_TIME_RANGE}&dataType=ROI",
            self.base_url
        ))
        .await
    }

    async fn order_history(&self, lead_id: &str) -> Result<OrderHistory> {
        let url = format!(
            "{}/v1/friendly/future/copy-trade/lead-portfolio/order-history",
            self.base_url
        );
        let body = serde_json::json!({
            "portfolioId": lead_id,
            "pageNumber": 1,
            "pageSize": self.order_page_size,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} request failed"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))?;

        if !status.is_success() {
            anyhow::bail!("venue POST {url} returned {status}: {body}");
        }

        let data = unwrap_envelope(body)?;
        Ok(parse_order_history(&data))
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// GET `url`, check HTTP status, and unwrap the `{success, data}`
    /// envelope.
    async fn get_data(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} request failed"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))?;

        if !status.is_success() {
            anyhow::bail!("venue GET {url} returned {status}: {body}");
        }

        unwrap_envelope(body)
    }
}

impl std::fmt::Debug for VenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueClient")
            .field("base_url", &self.base_url)
            .field("order_page_size", &self.order_page_size)
            .finish()
    }
}
