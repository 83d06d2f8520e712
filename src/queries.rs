// =============================================================================
// Query views — heatmap, symbol detail, and the activity feed
// =============================================================================
//
// Thin read models over the stored state. The API layer serialises these
// as-is; no wire-format decisions live here.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::consensus::{self, ConsensusQuery, SymbolConsensus};
use crate::store::{self, EventRow, PositionStateRow, SymbolAggregationRow};
use crate::types::{
    ConsensusDirection, DataSource, LifecycleStatus, SegmentFilter, Side, TimeRange, TraderSegment,
};

// ---------------------------------------------------------------------------
// Heatmap
// ---------------------------------------------------------------------------

/// Leverage bucket filter for the heatmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeverageBand {
    Low,
    Mid,
    High,
}

impl LeverageBand {
    /// Band edges in x-leverage.
    pub fn contains(&self, leverage: f64) -> bool {
        match self {
            Self::Low => leverage < 10.0,
            Self::Mid => (10.0..25.0).contains(&leverage),
            Self::High => leverage >= 25.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "mid" => Some(Self::Mid),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeatmapQuery {
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub min_traders: usize,
    #[serde(default)]
    pub leverage_band: Option<LeverageBand>,
    #[serde(default)]
    pub segment: SegmentFilter,
}

/// One heatmap cell: consensus plus open-interest counts.
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapItem {
    pub symbol: String,
    pub open_long_count: i64,
    pub open_short_count: i64,
    pub total_open: i64,
    pub sentiment_score: f64,
    pub consensus_direction: ConsensusDirection,
    pub confidence_score: u32,
    pub weighted_avg_leverage: Option<f64>,
    pub total_traders: usize,
    pub data_source: DataSource,
    pub latest_event_at: Option<i64>,
}

pub fn heatmap(
    conn: &Connection,
    platform: &str,
    query: &HeatmapQuery,
    now: i64,
) -> Result<Vec<HeatmapItem>> {
    let aggregations: HashMap<String, SymbolAggregationRow> =
        store::symbol_aggregations(conn, platform)?
            .into_iter()
            .map(|a| (a.symbol.clone(), a))
            .collect();

    let entries = consensus::compute(
        conn,
        platform,
        &ConsensusQuery {
            time_range: query.time_range,
            segment: query.segment,
        },
        now,
    )?;

    let mut items = Vec::new();
    for entry in entries {
        if entry.total_traders < query.min_traders {
            continue;
        }
        if let Some(side) = query.side {
            if entry.consensus_direction.as_side() != Some(side) {
                continue;
            }
        }
        if let Some(band) = query.leverage_band {
            match entry.weighted_avg_leverage {
                Some(lev) if band.contains(lev) => {}
                _ => continue,
            }
        }

        let agg = aggregations.get(&entry.symbol);
        items.push(HeatmapItem {
            symbol: entry.symbol.clone(),
            open_long_count: agg.map(|a| a.open_long_count).unwrap_or(0),
            open_short_count: agg.map(|a| a.open_short_count).unwrap_or(0),
            total_open: agg.map(|a| a.total_open).unwrap_or(0),
            sentiment_score: entry.sentiment_score,
            consensus_direction: entry.consensus_direction,
            confidence_score: entry.confidence_score,
            weighted_avg_leverage: entry.weighted_avg_leverage,
            total_traders: entry.total_traders,
            data_source: entry.data_source,
            latest_event_at: agg.and_then(|a| a.latest_event_at),
        });
    }
    Ok(items)
}

// ---------------------------------------------------------------------------
// Symbol detail
// ---------------------------------------------------------------------------

/// Everything known about one symbol in the window.
#[derive(Debug, Serialize)]
pub struct SymbolDetail {
    pub symbol: String,
    pub consensus: Option<SymbolConsensus>,
    pub aggregation: Option<SymbolAggregationRow>,
    pub recent_events: Vec<EventRow>,
    pub lifecycle: Vec<LifecycleView>,
}

/// A lifecycle row shaped for presentation: the surfaced open time honours
/// the `positioning.use_estimated_open_time` option.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleView {
    pub lead_id: String,
    pub symbol: String,
    pub direction: Side,
    pub status: LifecycleStatus,
    pub entry_price: Option<f64>,
    pub amount: Option<f64>,
    pub leverage: Option<f64>,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

fn lifecycle_view(row: PositionStateRow, use_estimated_open_time: bool) -> LifecycleView {
    LifecycleView {
        lead_id: row.lead_id,
        symbol: row.symbol,
        direction: row.direction,
        status: row.status,
        entry_price: row.entry_price,
        amount: row.amount,
        leverage: row.leverage,
        opened_at: if use_estimated_open_time {
            row.estimated_open_time
        } else {
            row.first_seen_at
        },
        closed_at: row.estimated_close_time,
    }
}

pub fn symbol_detail(
    conn: &Connection,
    platform: &str,
    symbol: &str,
    time_range: TimeRange,
    segment: SegmentFilter,
    use_estimated_open_time: bool,
    now: i64,
) -> Result<SymbolDetail> {
    let since = now - time_range.as_millis();

    let consensus_entry = consensus::compute(
        conn,
        platform,
        &ConsensusQuery {
            time_range,
            segment,
        },
        now,
    )?
    .into_iter()
    .find(|c| c.symbol == symbol);

    let aggregation = store::symbol_aggregations(conn, platform)?
        .into_iter()
        .find(|a| a.symbol == symbol);

    let recent_events = store::events_since(conn, platform, Some(symbol), since, 100)?;
    let lifecycle = store::recent_states(conn, platform, Some(symbol), since, 100)?
        .into_iter()
        .map(|r| lifecycle_view(r, use_estimated_open_time))
        .collect();

    Ok(SymbolDetail {
        symbol: symbol.to_string(),
        consensus: consensus_entry,
        aggregation,
        recent_events,
        lifecycle,
    })
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

/// Which stream the feed reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    Events,
    Lifecycle,
}

impl Default for FeedSource {
    fn default() -> Self {
        Self::Events
    }
}

/// One entry in the activity feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    pub at: i64,
    pub lead_id: String,
    pub nickname: Option<String>,
    pub segment: TraderSegment,
    pub symbol: String,
    pub kind: String,
    pub side: Option<Side>,
    pub price: Option<f64>,
    pub amount: Option<f64>,
}

#[allow(clippy::too_many_arguments)]
pub fn feed(
    conn: &Connection,
    platform: &str,
    source: FeedSource,
    limit: usize,
    symbol: Option<&str>,
    time_range: TimeRange,
    segment: SegmentFilter,
    use_estimated_open_time: bool,
    now: i64,
) -> Result<Vec<FeedItem>> {
    let since = now - time_range.as_millis();

    let traders: HashMap<String, (Option<String>, TraderSegment)> =
        store::list_traders(conn, platform)?
            .into_iter()
            .map(|t| {
                let seg = t.segment();
                (t.lead_id, (t.nickname, seg))
            })
            .collect();

    let lookup = |lead_id: &str| -> (Option<String>, TraderSegment) {
        traders
            .get(lead_id)
            .cloned()
            .unwrap_or((None, TraderSegment::Unknown))
    };

    let mut items = Vec::new();
    match source {
        FeedSource::Events => {
            for e in store::events_since(conn, platform, symbol, since, limit * 2)? {
                let (nickname, trader_segment) = lookup(&e.lead_id);
                if !segment.matches(trader_segment) {
                    continue;
                }
                items.push(FeedItem {
                    at: e.event_time,
                    lead_id: e.lead_id,
                    nickname,
                    segment: trader_segment,
                    symbol: e.symbol,
                    kind: e.event_type.as_str().to_string(),
                    side: e.event_type.side(),
                    price: e.price,
                    amount: e.amount,
                });
                if items.len() >= limit {
                    break;
                }
            }
        }
        FeedSource::Lifecycle => {
            for s in store::recent_states(conn, platform, symbol, since, limit * 2)? {
                let (nickname, trader_segment) = lookup(&s.lead_id);
                if !segment.matches(trader_segment) {
                    continue;
                }
                let (kind, at) = match s.status {
                    LifecycleStatus::Active => (
                        "POSITION_OPENED",
                        if use_estimated_open_time {
                            s.estimated_open_time
                        } else {
                            s.first_seen_at
                        },
                    ),
                    LifecycleStatus::Closed => (
                        "POSITION_CLOSED",
                        s.estimated_close_time.unwrap_or(s.last_seen_at),
                    ),
                };
                items.push(FeedItem {
                    at,
                    lead_id: s.lead_id,
                    nickname,
                    segment: trader_segment,
                    symbol: s.symbol,
                    kind: kind.to_string(),
                    side: Some(s.direction),
                    price: s.entry_price,
                    amount: s.amount,
                });
                if items.len() >= limit {
                    break;
                }
            }
        }
    }

    Ok(items)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{NormalizedEvent, NormalizedPosition};
    use crate::store::Store;
    use crate::types::{EventType, MarginType};
    use serde_json::json;

    fn seed_holder(db: &Store, lead: &str, symbol: &str, side: Side, leverage: f64, now: i64) {
        let conn = db.conn();
        store::upsert_lead_trader(&conn, "binance", lead, Some(lead), Some(true), now).unwrap();
        store::insert_snapshots(
            &conn,
            "binance",
            lead,
            now,
            &[NormalizedPosition {
                symbol: symbol.to_string(),
                side,
                contract_type: None,
                leverage: Some(leverage),
                size: Some(1.0),
                entry_price: Some(100.0),
                mark_price: Some(100.0),
                margin_usdt: None,
                margin_type: MarginType::Cross,
                pnl_usdt: None,
                roe_pct: None,
                raw: json!({}),
            }],
        )
        .unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO trader_scores
                 (platform, lead_id, score_30d, quality_score, confidence, win_rate,
                  sample_size, trader_weight, updated_at)
             VALUES ('binance', ?1, 50.0, 50.0, 'high', 0.6, 25, 0.5, ?2)",
            rusqlite::params![lead, now],
        )
        .unwrap();
        crate::aggregate::recompute(&conn, "binance", now).unwrap();
    }

    fn seed_event(db: &Store, lead: &str, key: &str, et: EventType, symbol: &str, t: i64) {
        let conn = db.conn();
        store::insert_events(
            &conn,
            "binance",
            lead,
            &[NormalizedEvent {
                event_key: key.to_string(),
                event_type: et,
                symbol: symbol.to_string(),
                price: Some(100.0),
                amount: Some(1.0),
                amount_asset: None,
                realized_pnl: None,
                event_time_text: format!("t{t}"),
                event_time: t,
                fetched_at: t,
            }],
        )
        .unwrap();
    }

    #[test]
    fn heatmap_reflects_counts_and_filters() {
        let db = Store::open_in_memory().unwrap();
        let now = 1_000_000_000;
        seed_holder(&db, "A", "BTCUSDT", Side::Long, 12.0, now);
        seed_holder(&db, "B", "BTCUSDT", Side::Long, 12.0, now);
        seed_holder(&db, "C", "ETHUSDT", Side::Short, 40.0, now);

        let conn = db.conn();
        let all = heatmap(&conn, "binance", &HeatmapQuery::default(), now).unwrap();
        assert_eq!(all.len(), 2);
        let btc = all.iter().find(|i| i.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.open_long_count, 2);
        assert_eq!(btc.total_open, 2);
        assert_eq!(btc.consensus_direction, ConsensusDirection::Long);

        // Side filter.
        let longs = heatmap(
            &conn,
            "binance",
            &HeatmapQuery {
                side: Some(Side::Long),
                ..HeatmapQuery::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(longs.len(), 1);
        assert_eq!(longs[0].symbol, "BTCUSDT");

        // Leverage band filter.
        let high = heatmap(
            &conn,
            "binance",
            &HeatmapQuery {
                leverage_band: Some(LeverageBand::High),
                ..HeatmapQuery::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].symbol, "ETHUSDT");

        // Min traders filter.
        let crowded = heatmap(
            &conn,
            "binance",
            &HeatmapQuery {
                min_traders: 2,
                ..HeatmapQuery::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(crowded.len(), 1);
        assert_eq!(crowded[0].symbol, "BTCUSDT");
    }

    #[test]
    fn symbol_detail_bundles_consensus_events_and_lifecycle() {
        let db = Store::open_in_memory().unwrap();
        let now = 1_000_000_000;
        seed_holder(&db, "A", "BTCUSDT", Side::Long, 10.0, now);
        seed_event(&db, "A", "k1", EventType::OpenLong, "BTCUSDT", now - 1_000);

        {
            let conn = db.conn();
            crate::tracker::visible::track_visible(
                &conn,
                "binance",
                "A",
                &[NormalizedPosition {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    contract_type: None,
                    leverage: Some(10.0),
                    size: Some(1.0),
                    entry_price: Some(100.0),
                    mark_price: Some(100.0),
                    margin_usdt: None,
                    margin_type: MarginType::Cross,
                    pnl_usdt: None,
                    roe_pct: None,
                    raw: json!({}),
                }],
                now,
            )
            .unwrap();
        }

        let conn = db.conn();
        let detail = symbol_detail(
            &conn,
            "binance",
            "BTCUSDT",
            TimeRange::D1,
            SegmentFilter::Both,
            true,
            now,
        )
        .unwrap();

        assert!(detail.consensus.is_some());
        assert!(detail.aggregation.is_some());
        assert_eq!(detail.recent_events.len(), 1);
        assert_eq!(detail.lifecycle.len(), 1);
        // Matching OPEN event within 5 minutes refined the open time.
        assert_eq!(detail.lifecycle[0].opened_at, now - 1_000);
    }

    #[test]
    fn feed_filters_by_segment() {
        let db = Store::open_in_memory().unwrap();
        let now = 1_000_000_000;
        {
            let conn = db.conn();
            store::upsert_lead_trader(&conn, "binance", "VIS", None, Some(true), now).unwrap();
            store::upsert_lead_trader(&conn, "binance", "HID", None, Some(false), now).unwrap();
        }
        seed_event(&db, "VIS", "k1", EventType::OpenLong, "BTCUSDT", now - 5_000);
        seed_event(&db, "HID", "k2", EventType::OpenShort, "BTCUSDT", now - 4_000);

        let conn = db.conn();
        let all = feed(
            &conn,
            "binance",
            FeedSource::Events,
            50,
            None,
            TimeRange::D1,
            SegmentFilter::Both,
            true,
            now,
        )
        .unwrap();
        assert_eq!(all.len(), 2);

        let hidden_only = feed(
            &conn,
            "binance",
            FeedSource::Events,
            50,
            None,
            TimeRange::D1,
            SegmentFilter::Hidden,
            true,
            now,
        )
        .unwrap();
        assert_eq!(hidden_only.len(), 1);
        assert_eq!(hidden_only[0].lead_id, "HID");
        assert_eq!(hidden_only[0].kind, "OPEN_SHORT");
    }

    #[test]
    fn lifecycle_feed_honours_presentation_option() {
        let db = Store::open_in_memory().unwrap();
        let now = 1_000_000_000;
        {
            let conn = db.conn();
            store::upsert_lead_trader(&conn, "binance", "T1", None, Some(true), now).unwrap();
            conn.execute(
                "INSERT INTO position_states
                     (platform, lead_id, symbol, direction, status, first_seen_at, last_seen_at,
                      estimated_open_time)
                 VALUES ('binance', 'T1', 'BTCUSDT', 'LONG', 'ACTIVE', ?1, ?1, ?2)",
                rusqlite::params![now - 1_000, now - 50_000],
            )
            .unwrap();
        }

        let conn = db.conn();
        let estimated = feed(
            &conn,
            "binance",
            FeedSource::Lifecycle,
            10,
            None,
            TimeRange::D1,
            SegmentFilter::Both,
            true,
            now,
        )
        .unwrap();
        assert_eq!(estimated[0].at, now - 50_000);

        let observed = feed(
            &conn,
            "binance",
            FeedSource::Lifecycle,
            10,
            None,
            TimeRange::D1,
            SegmentFilter::Both,
            false,
            now,
        )
        .unwrap();
        assert_eq!(observed[0].at, now - 1_000);
    }
}
