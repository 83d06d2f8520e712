// =============================================================================
// Consensus Engine — weighted cross-trader sentiment per symbol
// =============================================================================
//
// Eligible traders (segment filter + last ingest within the window) each
// contribute their current position set: the latest snapshot set for VISIBLE
// traders, the ACTIVE lifecycle rows otherwise. Per symbol the long/short
// weight masses produce a sentiment score in [-1, +1], a direction, and a
// confidence that grows with the number of contributing traders.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;

use crate::store;
use crate::types::{
    ConsensusDirection, DataSource, SegmentFilter, Side, TimeRange, TraderSegment,
};

/// Sentiment magnitude below which the direction is NEUTRAL.
pub const SENTIMENT_EPSILON: f64 = 0.05;

/// Consensus parameters.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusQuery {
    pub time_range: TimeRange,
    pub segment: SegmentFilter,
}

/// One trader's contribution to a symbol.
#[derive(Debug, Clone, Serialize)]
pub struct Contribution {
    pub lead_id: String,
    pub side: Side,
    pub weight: f64,
    pub leverage: Option<f64>,
    pub visible: bool,
}

/// Weighted consensus for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolConsensus {
    pub symbol: String,
    pub long_weight: f64,
    pub short_weight: f64,
    pub sum_weights: f64,
    /// (longWeight - shortWeight) / sumWeights, 0 when no weight mass.
    pub sentiment_score: f64,
    pub consensus_direction: ConsensusDirection,
    /// round(100 * |sentiment| * (1 - 1/(1+N))).
    pub confidence_score: u32,
    pub weighted_avg_leverage: Option<f64>,
    pub total_traders: usize,
    pub long_count: usize,
    pub short_count: usize,
    pub data_source: DataSource,
    pub contributions: Vec<Contribution>,
}

#[derive(Default)]
struct SymbolAccumulator {
    long_weight: f64,
    short_weight: f64,
    long_count: usize,
    short_count: usize,
    lev_weighted_sum: f64,
    lev_weight_mass: f64,
    any_visible: bool,
    any_hidden: bool,
    contributions: Vec<Contribution>,
}

/// Compute the consensus across all eligible traders.
///
/// Results are sorted by confidence (descending), then symbol, which is the
/// order the auto-trigger simulator consumes candidates in.
pub fn compute(
    conn: &Connection,
    platform: &str,
    query: &ConsensusQuery,
    now: i64,
) -> Result<Vec<SymbolConsensus>> {
    let cutoff = now - query.time_range.as_millis();

    let weights: HashMap<String, f64> = store::trader_scores(conn, platform)?
        .into_iter()
        .map(|s| (s.lead_id, s.trader_weight))
        .collect();

    let mut acc: BTreeMap<String, SymbolAccumulator> = BTreeMap::new();

    for trader in store::list_traders(conn, platform)? {
        let segment = trader.segment();
        if !query.segment.matches(segment) || trader.last_ingest_at < cutoff {
            continue;
        }
        let weight = weights.get(&trader.lead_id).copied().unwrap_or(0.0);

        // Current holdings: snapshots for VISIBLE traders, ACTIVE lifecycle
        // rows for everyone else.
        let holdings: Vec<(String, Side, Option<f64>, bool)> =
            if segment == TraderSegment::Visible {
                match store::latest_fetched_at(conn, &trader.lead_id)? {
                    Some(at) => store::snapshots_at(conn, &trader.lead_id, at)?
                        .into_iter()
                        .map(|s| (s.symbol, s.side, s.leverage, true))
                        .collect(),
                    None => Vec::new(),
                }
            } else {
                store::active_states(conn, &trader.lead_id)?
                    .into_iter()
                    .map(|s| (s.symbol, s.direction, s.leverage, false))
                    .collect()
            };

        for (symbol, side, leverage, visible) in holdings {
            let slot = acc.entry(symbol).or_default();
            match side {
                Side::Long => {
                    slot.long_weight += weight;
                    slot.long_count += 1;
                }
                Side::Short => {
                    slot.short_weight += weight;
                    slot.short_count += 1;
                }
            }
            if let Some(lev) = leverage {
                slot.lev_weighted_sum += weight * lev;
                slot.lev_weight_mass += weight;
            }
            if visible {
                slot.any_visible = true;
            } else {
                slot.any_hidden = true;
            }
            slot.contributions.push(Contribution {
                lead_id: trader.lead_id.clone(),
                side,
                weight,
                leverage,
                visible,
            });
        }
    }

    let mut out: Vec<SymbolConsensus> = acc
        .into_iter()
        .map(|(symbol, slot)| finalize(symbol, slot))
        .collect();

    out.sort_by(|a, b| {
        b.confidence_score
            .cmp(&a.confidence_score)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    Ok(out)
}

fn finalize(symbol: String, slot: SymbolAccumulator) -> SymbolConsensus {
    let sum_weights = slot.long_weight + slot.short_weight;
    let total_traders = slot.long_count + slot.short_count;

    let sentiment_score = if sum_weights > 0.0 {
        (slot.long_weight - slot.short_weight) / sum_weights
    } else {
        0.0
    };

    let consensus_direction = if sentiment_score > SENTIMENT_EPSILON {
        ConsensusDirection::Long
    } else if sentiment_score < -SENTIMENT_EPSILON {
        ConsensusDirection::Short
    } else {
        ConsensusDirection::Neutral
    };

    let agreement_factor = 1.0 - 1.0 / (1.0 + total_traders as f64);
    let confidence_score = if sum_weights > 0.0 {
        (100.0 * sentiment_score.abs() * agreement_factor).round() as u32
    } else {
        0
    };

    let weighted_avg_leverage = if slot.lev_weight_mass > 0.0 {
        Some(slot.lev_weighted_sum / slot.lev_weight_mass)
    } else {
        None
    };

    let data_source = match (slot.any_visible, slot.any_hidden) {
        (true, true) => DataSource::Mixed,
        (true, false) => DataSource::Visible,
        _ => DataSource::HiddenDerived,
    };

    SymbolConsensus {
        symbol,
        long_weight: slot.long_weight,
        short_weight: slot.short_weight,
        sum_weights,
        sentiment_score,
        consensus_direction,
        confidence_score,
        weighted_avg_leverage,
        total_traders,
        long_count: slot.long_count,
        short_count: slot.short_count,
        data_source,
        contributions: slot.contributions,
    }
}
