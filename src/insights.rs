// =============================================================================
// Insights Engine — anomalies, stability, leaderboard, and a risk band
// =============================================================================
//
// A preset (conservative / balanced / aggressive) supplies the thresholds:
// what counts as crowded, over-levered, unstable, or under-confident. The
// stability series is derived from the stored event stream (hourly direction
// buckets), so it is replayable without persisting consensus history.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::consensus::{self, ConsensusQuery};
use crate::store;
use crate::types::{DataSource, SegmentFilter, Side, TimeRange};

/// Width of one direction bucket in the stability series.
const STABILITY_BUCKET_MS: i64 = 3_600_000;

/// Stability lost per unit of flip rate.
const STABILITY_K: f64 = 100.0;

// ---------------------------------------------------------------------------
// Modes & presets
// ---------------------------------------------------------------------------

/// Threshold preset selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightsMode {
    Conservative,
    Balanced,
    Aggressive,
}

impl Default for InsightsMode {
    fn default() -> Self {
        Self::Balanced
    }
}

impl InsightsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conservative" => Some(Self::Conservative),
            "balanced" => Some(Self::Balanced),
            "aggressive" => Some(Self::Aggressive),
            _ => None,
        }
    }
}

impl std::fmt::Display for InsightsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Concrete thresholds selected by a mode.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InsightsPreset {
    /// Contributing traders at or above which a symbol counts as crowded.
    pub crowding_min_traders: usize,
    /// Weighted average leverage at or above which a symbol is over-levered.
    pub high_leverage: f64,
    /// Stability score below which a symbol is unstable.
    pub min_stability: f64,
    /// Consensus confidence below which a symbol is low-confidence.
    pub min_confidence: u32,
    /// Leaderboard score multiplier.
    pub score_multiplier: f64,
}

impl InsightsPreset {
    pub fn for_mode(mode: InsightsMode) -> Self {
        match mode {
            InsightsMode::Conservative => Self {
                crowding_min_traders: 3,
                high_leverage: 15.0,
                min_stability: 60.0,
                min_confidence: 50,
                score_multiplier: 0.8,
            },
            InsightsMode::Balanced => Self {
                crowding_min_traders: 4,
                high_leverage: 20.0,
                min_stability: 50.0,
                min_confidence: 40,
                score_multiplier: 1.0,
            },
            InsightsMode::Aggressive => Self {
                crowding_min_traders: 6,
                high_leverage: 30.0,
                min_stability: 35.0,
                min_confidence: 25,
                score_multiplier: 1.2,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted rule (singleton per platform)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsRule {
    #[serde(default)]
    pub mode: InsightsMode,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default = "default_top")]
    pub top: i64,
}

fn default_top() -> i64 {
    10
}

impl Default for InsightsRule {
    fn default() -> Self {
        Self {
            mode: InsightsMode::Balanced,
            time_range: TimeRange::D1,
            top: default_top(),
        }
    }
}

pub fn get_rule(conn: &Connection, platform: &str) -> Result<InsightsRule> {
    let rule = conn
        .query_row(
            "SELECT mode, time_range, top FROM insights_rules WHERE platform = ?1",
            params![platform],
            |row| {
                Ok(InsightsRule {
                    mode: InsightsMode::parse(&row.get::<_, String>(0)?).unwrap_or_default(),
                    time_range: TimeRange::parse(&row.get::<_, String>(1)?).unwrap_or_default(),
                    top: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(rule.unwrap_or_default())
}

pub fn save_rule(conn: &Connection, platform: &str, rule: &InsightsRule, now: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO insights_rules (platform, mode, time_range, top, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            platform,
            rule.mode.as_str(),
            rule.time_range.as_str(),
            rule.top,
            now
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    LeverageSpike,
    CrowdFormation,
    ConfidenceDrop,
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub symbol: String,
    pub detail: String,
}

/// Direction-flip summary for one symbol over the window.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolStability {
    pub symbol: String,
    /// Direction changes between consecutive decided buckets.
    pub flips: usize,
    /// Buckets with any directional signal.
    pub decided_buckets: usize,
    pub stability_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub lead_id: String,
    pub nickname: Option<String>,
    pub score: f64,
    pub trader_weight: f64,
    pub quality_score: f64,
    pub activity_events: i64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

/// Per-preset symbol counts feeding the overall risk score.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RiskCounts {
    pub crowded: usize,
    pub high_leverage: usize,
    pub unstable: usize,
    pub low_confidence: usize,
}

#[derive(Debug, Serialize)]
pub struct InsightsResponse {
    pub mode: InsightsMode,
    pub time_range: TimeRange,
    pub generated_at: i64,
    pub anomalies: Vec<Anomaly>,
    pub stability: Vec<SymbolStability>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub counts: RiskCounts,
    pub risk_score: f64,
    pub risk_band: RiskBand,
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

/// Build the full insights snapshot for the window.
pub fn compute(
    conn: &Connection,
    platform: &str,
    time_range: TimeRange,
    segment: SegmentFilter,
    top: usize,
    mode: InsightsMode,
    now: i64,
) -> Result<InsightsResponse> {
    let preset = InsightsPreset::for_mode(mode);
    let entries = consensus::compute(
        conn,
        platform,
        &ConsensusQuery {
            time_range,
            segment,
        },
        now,
    )?;

    let stability = stability_series(conn, platform, time_range, now)?;
    let stability_by_symbol: BTreeMap<&str, f64> = stability
        .iter()
        .map(|s| (s.symbol.as_str(), s.stability_score))
        .collect();

    // Anomalies + risk counts from the consensus snapshot.
    let mut anomalies = Vec::new();
    let mut counts = RiskCounts::default();

    for entry in &entries {
        if entry.total_traders >= preset.crowding_min_traders {
            counts.crowded += 1;
            anomalies.push(Anomaly {
                kind: AnomalyKind::CrowdFormation,
                symbol: entry.symbol.clone(),
                detail: format!("{} traders piled into one symbol", entry.total_traders),
            });
        }
        if let Some(lev) = entry.weighted_avg_leverage {
            if lev >= preset.high_leverage {
                counts.high_leverage += 1;
                anomalies.push(Anomaly {
                    kind: AnomalyKind::LeverageSpike,
                    symbol: entry.symbol.clone(),
                    detail: format!("weighted average leverage {lev:.1}x"),
                });
            }
        }
        if entry.data_source == DataSource::HiddenDerived
            && entry.confidence_score < preset.min_confidence
        {
            counts.low_confidence += 1;
            anomalies.push(Anomaly {
                kind: AnomalyKind::ConfidenceDrop,
                symbol: entry.symbol.clone(),
                detail: format!(
                    "order-log-derived consensus at confidence {}",
                    entry.confidence_score
                ),
            });
        }
        if let Some(score) = stability_by_symbol.get(entry.symbol.as_str()) {
            if *score < preset.min_stability {
                counts.unstable += 1;
            }
        }
    }

    let leaderboard = leaderboard(conn, platform, time_range, top, preset.score_multiplier, now)?;

    let symbols = entries.len().max(1);
    let risk_score = 100.0
        * (counts.crowded + counts.high_leverage + counts.unstable + counts.low_confidence) as f64
        / (4.0 * symbols as f64);
    let risk_band = if risk_score < 30.0 {
        RiskBand::Low
    } else if risk_score < 65.0 {
        RiskBand::Medium
    } else {
        RiskBand::High
    };

    Ok(InsightsResponse {
        mode,
        time_range,
        generated_at: now,
        anomalies,
        stability,
        leaderboard,
        counts,
        risk_score,
        risk_band,
    })
}

/// Per-symbol direction series over the window, bucketed hourly from the
/// event stream: a bucket's direction is the sign of (distinct long openers -
/// distinct short openers).
fn stability_series(
    conn: &Connection,
    platform: &str,
    time_range: TimeRange,
    now: i64,
) -> Result<Vec<SymbolStability>> {
    let since = now - time_range.as_millis();
    let mut events = store::events_since(conn, platform, None, since, 100_000)?;
    events.reverse(); // chronological

    use std::collections::HashSet;
    #[derive(Default)]
    struct Bucket {
        longs: HashSet<String>,
        shorts: HashSet<String>,
    }
    let mut buckets: BTreeMap<(String, i64), Bucket> = BTreeMap::new();

    for e in &events {
        if !e.event_type.is_open() {
            continue;
        }
        let bi = (e.event_time - since) / STABILITY_BUCKET_MS;
        let slot = buckets.entry((e.symbol.clone(), bi)).or_default();
        match e.event_type.side() {
            Some(Side::Long) => {
                slot.longs.insert(e.lead_id.clone());
            }
            Some(Side::Short) => {
                slot.shorts.insert(e.lead_id.clone());
            }
            None => {}
        }
    }

    // Decided directions per symbol, in bucket order (BTreeMap keeps it).
    let mut series: BTreeMap<String, Vec<i8>> = BTreeMap::new();
    for ((symbol, _bi), bucket) in buckets {
        let dir = (bucket.longs.len() as i64 - bucket.shorts.len() as i64).signum() as i8;
        if dir != 0 {
            series.entry(symbol).or_default().push(dir);
        }
    }

    Ok(series
        .into_iter()
        .map(|(symbol, dirs)| {
            let flips = dirs.windows(2).filter(|w| w[0] != w[1]).count();
            let flip_rate = if dirs.len() > 1 {
                flips as f64 / (dirs.len() - 1) as f64
            } else {
                0.0
            };
            SymbolStability {
                symbol,
                flips,
                decided_buckets: dirs.len(),
                stability_score: (100.0 - flip_rate * STABILITY_K).clamp(0.0, 100.0),
            }
        })
        .collect())
}

/// Rank traders by score, weight, window activity, and realised PnL.
fn leaderboard(
    conn: &Connection,
    platform: &str,
    time_range: TimeRange,
    top: usize,
    multiplier: f64,
    now: i64,
) -> Result<Vec<LeaderboardEntry>> {
    let since = now - time_range.as_millis();
    let mut entries = Vec::new();

    for trader in store::list_traders(conn, platform)? {
        let score_row = store::get_trader_score(conn, platform, &trader.lead_id)?;
        let (trader_weight, quality_score) = score_row
            .map(|s| (s.trader_weight, s.quality_score))
            .unwrap_or((0.0, 0.0));

        let (activity_events, realized_pnl): (i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(realized_pnl), 0.0)
             FROM events WHERE lead_id = ?1 AND event_time >= ?2",
            params![trader.lead_id, since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let base = 0.6 * quality_score + 40.0 * trader_weight;
        let activity_bonus = (activity_events.min(50) as f64) * 0.4;
        let pnl_bonus = (1.0 + realized_pnl.max(0.0)).log10() * 5.0;
        let score = (base + activity_bonus + pnl_bonus) * multiplier;

        entries.push(LeaderboardEntry {
            lead_id: trader.lead_id,
            nickname: trader.nickname,
            score,
            trader_weight,
            quality_score,
            activity_events,
            realized_pnl,
        });
    }

    entries.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    entries.truncate(top);
    Ok(entries)
}
