// =============================================================================
// Trader Weight & Score — per-trader quality in [0,100], weight in [0,1]
// =============================================================================
//
// score30d maps realised PnL (positive legs of CLOSE_* events over 30 days)
// onto [0,100] with log10(1+pnl) * 25, clipped.
//
// traderWeight = clip01(baseWeight * confidenceFactor * winAdj * availability)
//   baseWeight   — qualityScore / 100 (monotone non-decreasing)
//   confidence   — high 1.0 / medium 0.75 / low 0.5, bucketed by sample size
//   winAdj       — 1 + 2*(winRate - 0.5), clipped to [0.3, 1.3]
//   availability — 1.0 within 1h of last ingest, 0.75 within 24h, else 0
//
// A trader with no closing events in the window, or whose last ingest is
// older than 24h, carries zero weight.
// =============================================================================

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::store::TraderScoreRow;
use crate::types::ScoreConfidence;

/// Realised-PnL lookback for scoring.
const SCORE_WINDOW_MS: i64 = 30 * 24 * 3_600_000;

/// Sample sizes at which confidence buckets switch.
const HIGH_CONFIDENCE_SAMPLES: i64 = 20;
const MEDIUM_CONFIDENCE_SAMPLES: i64 = 5;

/// Availability cliff: ingests older than this carry zero weight.
const STALE_CUTOFF_MS: i64 = 24 * 3_600_000;
/// Full availability within this horizon.
const FRESH_CUTOFF_MS: i64 = 3_600_000;

// ---------------------------------------------------------------------------
// Pure scoring functions
// ---------------------------------------------------------------------------

fn clip(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

/// Map cumulative realised PnL onto [0,100].
pub fn score_from_pnl(pnl: f64) -> f64 {
    clip((1.0 + pnl.max(0.0)).log10() * 25.0, 0.0, 100.0)
}

/// Confidence bucket from the closing-event sample size.
pub fn confidence_from_sample(sample_size: i64) -> ScoreConfidence {
    if sample_size >= HIGH_CONFIDENCE_SAMPLES {
        ScoreConfidence::High
    } else if sample_size >= MEDIUM_CONFIDENCE_SAMPLES {
        ScoreConfidence::Medium
    } else {
        ScoreConfidence::Low
    }
}

/// Availability penalty from the trader's last ingest instant.
pub fn availability_penalty(last_ingest_at: i64, now: i64) -> f64 {
    let age = now - last_ingest_at;
    if age <= FRESH_CUTOFF_MS {
        1.0
    } else if age <= STALE_CUTOFF_MS {
        0.75
    } else {
        0.0
    }
}

/// Combine the factors into the consensus weight.
pub fn compute_weight(
    quality_score: f64,
    confidence: ScoreConfidence,
    win_rate: f64,
    sample_size: i64,
    availability: f64,
) -> f64 {
    if sample_size == 0 || availability == 0.0 {
        return 0.0;
    }
    let base_weight = clip(quality_score / 100.0, 0.0, 1.0);
    let win_adj = clip(1.0 + 2.0 * (win_rate - 0.5), 0.3, 1.3);
    clip(base_weight * confidence.factor() * win_adj * availability, 0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Recompute for one trader
// ---------------------------------------------------------------------------

/// Recompute and persist the score row for one trader. Runs at the end of the
/// per-trader ingest transaction.
pub fn recompute(conn: &Connection, platform: &str, lead_id: &str, now: i64) -> Result<TraderScoreRow> {
    let since = now - SCORE_WINDOW_MS;

    // Closing events in the window: realised PnL is stored only when
    // positive, so a non-null value marks a win.
    let (sample_size, wins, pnl_sum): (i64, i64, f64) = conn.query_row(
        "SELECT COUNT(*),
                COUNT(realized_pnl),
                COALESCE(SUM(realized_pnl), 0.0)
         FROM events
         WHERE lead_id = ?1
           AND event_type IN ('CLOSE_LONG', 'CLOSE_SHORT')
           AND event_time >= ?2",
        params![lead_id, since],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let last_ingest_at: Option<i64> = conn
        .query_row(
            "SELECT last_ingest_at FROM lead_traders WHERE platform = ?1 AND lead_id = ?2",
            params![platform, lead_id],
            |row| row.get(0),
        )
        .optional()?;

    let score_30d = score_from_pnl(pnl_sum);
    let win_rate = if sample_size > 0 {
        wins as f64 / sample_size as f64
    } else {
        0.0
    };
    let confidence = confidence_from_sample(sample_size);
    let quality_score = clip(0.7 * score_30d + 30.0 * win_rate, 0.0, 100.0);
    let availability = last_ingest_at
        .map(|t| availability_penalty(t, now))
        .unwrap_or(0.0);
    let trader_weight = compute_weight(quality_score, confidence, win_rate, sample_size, availability);

    conn.execute(
        "INSERT INTO trader_scores
             (platform, lead_id, score_30d, quality_score, confidence, win_rate,
              sample_size, trader_weight, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (platform, lead_id) DO UPDATE SET
             score_30d = excluded.score_30d,
             quality_score = excluded.quality_score,
             confidence = excluded.confidence,
             win_rate = excluded.win_rate,
             sample_size = excluded.sample_size,
             trader_weight = excluded.trader_weight,
             updated_at = excluded.updated_at",
        params![
            platform,
            lead_id,
            score_30d,
            quality_score,
            confidence.as_str(),
            win_rate,
            sample_size,
            trader_weight,
            now,
        ],
    )?;

    debug!(
        lead_id,
        score_30d,
        quality_score,
        win_rate,
        sample_size,
        trader_weight,
        "trader score recomputed"
    );

    Ok(TraderScoreRow {
        platform: platform.to_string(),
        lead_id: lead_id.to_string(),
        score_30d,
        quality_score,
        confidence: confidence.as_str().to_string(),
        win_rate,
        sample_size,
        trader_weight,
        updated_at: now,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NormalizedEvent;
    use crate::store::{self, Store};
    use crate::types::EventType;

    fn close_event(key: &str, t: i64, pnl: Option<f64>) -> NormalizedEvent {
        NormalizedEvent {
            event_key: key.to_string(),
            event_type: EventType::CloseLong,
            symbol: "BTCUSDT".into(),
            price: Some(60_000.0),
            amount: Some(0.1),
            amount_asset: None,
            realized_pnl: pnl,
            event_time_text: "01-01, 00:00:00".into(),
            event_time: t,
            fetched_at: t,
        }
    }

    #[test]
    fn pnl_log_mapping() {
        assert_eq!(score_from_pnl(0.0), 0.0);
        assert!((score_from_pnl(9.0) - 25.0).abs() < 1e-9);
        assert!((score_from_pnl(99.0) - 50.0).abs() < 1e-9);
        assert!((score_from_pnl(9_999.0) - 100.0).abs() < 1e-9);
        // Clipped above 10^4 - 1.
        assert_eq!(score_from_pnl(1_000_000.0), 100.0);
        // Negative sums never go below zero.
        assert_eq!(score_from_pnl(-50.0), 0.0);
    }

    #[test]
    fn confidence_buckets() {
        assert_eq!(confidence_from_sample(0), ScoreConfidence::Low);
        assert_eq!(confidence_from_sample(4), ScoreConfidence::Low);
        assert_eq!(confidence_from_sample(5), ScoreConfidence::Medium);
        assert_eq!(confidence_from_sample(19), ScoreConfidence::Medium);
        assert_eq!(confidence_from_sample(20), ScoreConfidence::High);
    }

    #[test]
    fn availability_tiers() {
        let now = 100 * 3_600_000;
        assert_eq!(availability_penalty(now - 60_000, now), 1.0);
        assert_eq!(availability_penalty(now - 2 * 3_600_000, now), 0.75);
        assert_eq!(availability_penalty(now - 25 * 3_600_000, now), 0.0);
    }

    #[test]
    fn weight_stays_in_unit_interval() {
        for quality in [0.0, 25.0, 80.0, 100.0] {
            for wr in [0.0, 0.4, 0.5, 0.9, 1.0] {
                for avail in [0.0, 0.75, 1.0] {
                    let w = compute_weight(quality, ScoreConfidence::High, wr, 10, avail);
                    assert!((0.0..=1.0).contains(&w), "weight {w} out of range");
                }
            }
        }
    }

    #[test]
    fn zero_weight_without_samples_or_freshness() {
        assert_eq!(compute_weight(90.0, ScoreConfidence::High, 0.8, 0, 1.0), 0.0);
        assert_eq!(compute_weight(90.0, ScoreConfidence::High, 0.8, 50, 0.0), 0.0);
    }

    #[test]
    fn win_adjustment_is_clipped() {
        // winRate 1.0 -> raw adj 2.0, clipped to 1.3.
        let w_hot = compute_weight(100.0, ScoreConfidence::High, 1.0, 30, 1.0);
        assert!((w_hot - 1.0).abs() < 1e-9); // 1.0 * 1.0 * 1.3 clipped to 1.0
        // winRate 0.0 -> raw adj 0.0, clipped to 0.3.
        let w_cold = compute_weight(100.0, ScoreConfidence::High, 0.0, 30, 1.0);
        assert!((w_cold - 0.3).abs() < 1e-9);
    }

    #[test]
    fn recompute_persists_and_reflects_events() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();
        let now = 100 * 24 * 3_600_000_i64;

        store::upsert_lead_trader(&conn, "binance", "T1", None, Some(false), now - 1_000).unwrap();
        store::insert_events(
            &conn,
            "binance",
            "T1",
            &[
                close_event("c1", now - 1_000_000, Some(98.0)),
                close_event("c2", now - 2_000_000, None),
                close_event("c3", now - 3_000_000, Some(1.0)),
                // Outside the 30d window: ignored.
                close_event("c4", now - 31 * 24 * 3_600_000, Some(500.0)),
            ],
        )
        .unwrap();

        let row = recompute(&conn, "binance", "T1", now).unwrap();
        assert_eq!(row.sample_size, 3);
        assert!((row.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((row.score_30d - 50.0).abs() < 1e-9); // pnl 99 -> log10(100)*25 = 50
        assert!(row.trader_weight > 0.0 && row.trader_weight <= 1.0);

        let stored = store::get_trader_score(&conn, "binance", "T1").unwrap().unwrap();
        assert_eq!(stored.sample_size, 3);
        assert_eq!(stored.confidence, "low");
    }

    #[test]
    fn stale_trader_has_zero_weight() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();
        let now = 100 * 24 * 3_600_000_i64;

        store::upsert_lead_trader(&conn, "binance", "T1", None, None, now - 25 * 3_600_000)
            .unwrap();
        store::insert_events(&conn, "binance", "T1", &[close_event("c1", now - 1_000, Some(10.0))])
            .unwrap();

        let row = recompute(&conn, "binance", "T1", now).unwrap();
        assert_eq!(row.trader_weight, 0.0);
        assert!(row.sample_size > 0);
    }
}
