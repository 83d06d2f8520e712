// =============================================================================
// Simulation Engine — manual, rule-driven, and backtest paper trading
// =============================================================================
//
// Reference price resolution is a two-stage lookup: the average of the most
// recent snapshot mark prices for the symbol, then the latest event price.
// Entry slippage is 1.5x exit slippage and always worsens the fill; the full
// round-trip cost model lives in `risk_math::execution_cost`.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::consensus::{self, ConsensusQuery};
use crate::risk_math;
use crate::runtime_config::SimulationConfig;
use crate::sim::{self, portfolio, SimulatedPosition, DEFAULT_PORTFOLIO_ID};
use crate::store;
use crate::types::{CloseReason, SegmentFilter, Side, SimSource, SimStatus, TimeRange};

/// How many recent snapshot rows feed the first stage of the reference-price
/// lookup.
pub const REFERENCE_PRICE_SNAPSHOT_DEPTH: usize = 60;

/// PnL is persisted at this precision.
fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

// ---------------------------------------------------------------------------
// Reference price
// ---------------------------------------------------------------------------

/// Resolve the price used to value a simulation when none is given:
/// (1) average of the last [`REFERENCE_PRICE_SNAPSHOT_DEPTH`] snapshot mark
/// prices for the symbol; (2) the latest event price.
pub fn reference_price(conn: &Connection, platform: &str, symbol: &str) -> Result<Option<f64>> {
    let prices =
        store::recent_snapshot_prices(conn, platform, symbol, REFERENCE_PRICE_SNAPSHOT_DEPTH)?;
    if !prices.is_empty() {
        return Ok(Some(prices.iter().sum::<f64>() / prices.len() as f64));
    }
    store::latest_event_price(conn, platform, symbol)
}

// ---------------------------------------------------------------------------
// Manual open / close / reconcile
// ---------------------------------------------------------------------------

/// Parameters of a manual (or rule-driven) open.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenRequest {
    pub symbol: String,
    pub direction: Side,
    pub leverage: f64,
    pub margin_notional: f64,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
    #[serde(default)]
    pub take_profit_price: Option<f64>,
    #[serde(default)]
    pub trailing_stop_pct: Option<f64>,
    #[serde(default)]
    pub slippage_bps: Option<f64>,
    #[serde(default)]
    pub commission_bps: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Open a simulated position, resolving the reference price when the request
/// does not pin one.
pub fn open_position(
    conn: &Connection,
    platform: &str,
    req: &OpenRequest,
    cfg: &SimulationConfig,
    source: SimSource,
    now: i64,
) -> Result<SimulatedPosition> {
    anyhow::ensure!(req.leverage > 0.0, "leverage must be positive");
    anyhow::ensure!(req.margin_notional > 0.0, "margin must be positive");

    let open_count = sim::open_positions(conn, platform)?.len();
    anyhow::ensure!(
        open_count < cfg.max_open_simulations as usize,
        "open simulation cap ({}) reached",
        cfg.max_open_simulations
    );

    let entry_price = match req.entry_price {
        Some(p) => p,
        None => reference_price(conn, platform, &req.symbol)?
            .with_context(|| format!("no reference price available for {}", req.symbol))?,
    };
    anyhow::ensure!(entry_price > 0.0, "entry price must be positive");

    let slippage_bps = req.slippage_bps.unwrap_or(cfg.slippage_bps);
    let commission_bps = req.commission_bps.unwrap_or(cfg.commission_bps);

    let entry_slip = slippage_bps * 1.5 / 10_000.0;
    let effective_entry_price = match req.direction {
        Side::Long => entry_price * (1.0 + entry_slip),
        Side::Short => entry_price * (1.0 - entry_slip),
    };

    let position = SimulatedPosition {
        id: Uuid::new_v4().to_string(),
        portfolio_id: Some(DEFAULT_PORTFOLIO_ID.to_string()),
        platform: platform.to_string(),
        symbol: req.symbol.clone(),
        direction: req.direction,
        status: SimStatus::Open,
        leverage: req.leverage,
        margin_notional: req.margin_notional,
        position_notional: req.margin_notional * req.leverage,
        entry_price,
        exit_price: None,
        effective_entry_price: Some(effective_entry_price),
        effective_exit_price: None,
        stop_loss_price: req.stop_loss_price,
        take_profit_price: req.take_profit_price,
        trailing_stop_pct: req.trailing_stop_pct,
        trailing_stop_trigger: None,
        slippage_bps,
        commission_bps,
        total_commission_usdt: None,
        pnl_usdt: None,
        roi_pct: None,
        unrealized_pnl: None,
        last_price: None,
        close_reason: None,
        close_trigger_lead_id: None,
        source,
        notes: req.notes.clone(),
        opened_at: now,
        closed_at: None,
    };

    portfolio::ensure_default(conn, platform, cfg, now)?;
    sim::insert_position(conn, &position)?;
    portfolio::adjust_balance(conn, DEFAULT_PORTFOLIO_ID, -position.margin_notional, now)?;

    info!(
        id = %position.id,
        symbol = %position.symbol,
        direction = %position.direction,
        entry_price,
        margin = position.margin_notional,
        leverage = position.leverage,
        source = %source,
        "simulated position opened"
    );
    Ok(position)
}

/// Close a simulated position at `price_override` or the current reference
/// price, applying the execution-cost model.
pub fn close_position(
    conn: &Connection,
    platform: &str,
    id: &str,
    reason: CloseReason,
    price_override: Option<f64>,
    close_trigger_lead_id: Option<&str>,
    now: i64,
) -> Result<SimulatedPosition> {
    let mut position = sim::get_position(conn, id)?
        .with_context(|| format!("simulated position {id} not found"))?;
    anyhow::ensure!(
        position.status == SimStatus::Open,
        "simulated position {id} is already closed"
    );

    let exit_price = match price_override {
        Some(p) => p,
        None => reference_price(conn, platform, &position.symbol)?
            .with_context(|| format!("no reference price available for {}", position.symbol))?,
    };

    let cost = risk_math::execution_cost(
        position.direction,
        position.entry_price,
        exit_price,
        position.margin_notional,
        position.leverage,
        position.slippage_bps,
        position.commission_bps,
    );

    position.status = SimStatus::Closed;
    position.exit_price = Some(exit_price);
    position.effective_exit_price = Some(cost.effective_exit_price);
    position.total_commission_usdt = Some(round4(cost.total_commission));
    position.pnl_usdt = Some(round4(cost.net_pnl));
    position.roi_pct = Some(round4(cost.roi_pct));
    position.close_reason = Some(reason.as_str().to_string());
    position.close_trigger_lead_id = close_trigger_lead_id.map(str::to_string);
    position.closed_at = Some(now);

    sim::update_closed(conn, &position)?;
    if position.portfolio_id.as_deref() == Some(DEFAULT_PORTFOLIO_ID) {
        portfolio::adjust_balance(
            conn,
            DEFAULT_PORTFOLIO_ID,
            position.margin_notional + cost.net_pnl,
            now,
        )?;
    }

    info!(
        id,
        reason = %reason,
        exit_price,
        net_pnl = cost.net_pnl,
        roi_pct = cost.roi_pct,
        "simulated position closed"
    );
    Ok(position)
}

/// Recompute unrealised PnL for every OPEN simulation against the latest
/// reference price. No state transitions.
pub fn reconcile(conn: &Connection, platform: &str) -> Result<usize> {
    let mut updated = 0usize;
    for position in sim::open_positions(conn, platform)? {
        let Some(price) = reference_price(conn, platform, &position.symbol)? else {
            continue;
        };
        let raw_move = position.direction.sign() * (price - position.entry_price)
            / position.entry_price;
        let unrealized = position.position_notional * raw_move;
        sim::update_reconcile(conn, &position.id, round4(unrealized), price)?;
        updated += 1;
    }
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Auto-trigger rule
// ---------------------------------------------------------------------------

/// Persisted singleton-per-platform configuration of the auto simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTriggerRule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub segment: SegmentFilter,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default = "default_min_traders")]
    pub min_traders: i64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_sentiment_abs")]
    pub min_sentiment_abs: f64,
    #[serde(default = "default_rule_leverage")]
    pub leverage: f64,
    #[serde(default = "default_rule_margin")]
    pub margin_notional: f64,
    #[serde(default = "default_rule_max_open")]
    pub max_open: i64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_rule_slippage")]
    pub slippage_bps: f64,
    #[serde(default = "default_rule_commission")]
    pub commission_bps: f64,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub trailing_stop_pct: Option<f64>,
    #[serde(default, skip_deserializing)]
    pub last_run_at: Option<i64>,
}

fn default_min_traders() -> i64 {
    2
}
fn default_min_confidence() -> f64 {
    40.0
}
fn default_min_sentiment_abs() -> f64 {
    20.0
}
fn default_rule_leverage() -> f64 {
    10.0
}
fn default_rule_margin() -> f64 {
    100.0
}
fn default_rule_max_open() -> i64 {
    5
}
fn default_cooldown_minutes() -> i64 {
    30
}
fn default_rule_slippage() -> f64 {
    10.0
}
fn default_rule_commission() -> f64 {
    4.0
}

impl Default for AutoTriggerRule {
    fn default() -> Self {
        Self {
            enabled: false,
            segment: SegmentFilter::Both,
            time_range: TimeRange::D1,
            min_traders: default_min_traders(),
            min_confidence: default_min_confidence(),
            min_sentiment_abs: default_min_sentiment_abs(),
            leverage: default_rule_leverage(),
            margin_notional: default_rule_margin(),
            max_open: default_rule_max_open(),
            cooldown_minutes: default_cooldown_minutes(),
            slippage_bps: default_rule_slippage(),
            commission_bps: default_rule_commission(),
            stop_loss_pct: None,
            take_profit_pct: None,
            trailing_stop_pct: None,
            last_run_at: None,
        }
    }
}

/// Load the rule, falling back to defaults when none was saved yet.
pub fn get_auto_rule(conn: &Connection, platform: &str) -> Result<AutoTriggerRule> {
    let rule = conn
        .query_row(
            "SELECT enabled, segment, time_range, min_traders, min_confidence,
                    min_sentiment_abs, leverage, margin_notional, max_open, cooldown_minutes,
                    slippage_bps, commission_bps, stop_loss_pct, take_profit_pct,
                    trailing_stop_pct, last_run_at
             FROM auto_trigger_rules WHERE platform = ?1",
            params![platform],
            |row| {
                Ok(AutoTriggerRule {
                    enabled: row.get(0)?,
                    segment: SegmentFilter::parse(&row.get::<_, String>(1)?)
                        .unwrap_or(SegmentFilter::Both),
                    time_range: TimeRange::parse(&row.get::<_, String>(2)?)
                        .unwrap_or_default(),
                    min_traders: row.get(3)?,
                    min_confidence: row.get(4)?,
                    min_sentiment_abs: row.get(5)?,
                    leverage: row.get(6)?,
                    margin_notional: row.get(7)?,
                    max_open: row.get(8)?,
                    cooldown_minutes: row.get(9)?,
                    slippage_bps: row.get(10)?,
                    commission_bps: row.get(11)?,
                    stop_loss_pct: row.get(12)?,
                    take_profit_pct: row.get(13)?,
                    trailing_stop_pct: row.get(14)?,
                    last_run_at: row.get(15)?,
                })
            },
        )
        .optional()?;
    Ok(rule.unwrap_or_default())
}

/// Persist the rule (full replace; `last_run_at` is preserved).
pub fn save_auto_rule(conn: &Connection, platform: &str, rule: &AutoTriggerRule, now: i64) -> Result<()> {
    let last_run_at: Option<i64> = conn
        .query_row(
            "SELECT last_run_at FROM auto_trigger_rules WHERE platform = ?1",
            params![platform],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    conn.execute(
        "INSERT OR REPLACE INTO auto_trigger_rules
             (platform, enabled, segment, time_range, min_traders, min_confidence,
              min_sentiment_abs, leverage, margin_notional, max_open, cooldown_minutes,
              slippage_bps, commission_bps, stop_loss_pct, take_profit_pct,
              trailing_stop_pct, last_run_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            platform,
            rule.enabled,
            rule.segment.as_str(),
            rule.time_range.as_str(),
            rule.min_traders,
            rule.min_confidence,
            rule.min_sentiment_abs,
            rule.leverage,
            rule.margin_notional,
            rule.max_open,
            rule.cooldown_minutes,
            rule.slippage_bps,
            rule.commission_bps,
            rule.stop_loss_pct,
            rule.take_profit_pct,
            rule.trailing_stop_pct,
            last_run_at,
            now,
        ],
    )?;
    Ok(())
}

fn touch_last_run(conn: &Connection, platform: &str, rule: &AutoTriggerRule, now: i64) -> Result<()> {
    // The rule row may not exist yet when running straight off defaults.
    save_auto_rule(conn, platform, rule, now)?;
    conn.execute(
        "UPDATE auto_trigger_rules SET last_run_at = ?2 WHERE platform = ?1",
        params![platform, now],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Auto-run
// ---------------------------------------------------------------------------

/// Why the auto-run did or did not act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRunStatus {
    Ok,
    Disabled,
    Cooldown,
}

/// A candidate the run decided not to act on.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedCandidate {
    pub symbol: String,
    pub reason: String,
}

/// Everything one auto-run did (or, when dry, would have done).
#[derive(Debug, Serialize)]
pub struct AutoRunOutcome {
    pub status: AutoRunStatus,
    pub dry_run: bool,
    pub opened: Vec<SimulatedPosition>,
    pub closed: Vec<SimulatedPosition>,
    pub skipped: Vec<SkippedCandidate>,
}

/// Evaluate the persisted rule against the current consensus.
///
/// Candidates (enough traders, confidence, and sentiment) are processed in
/// decreasing confidence order: an open simulation in the opposite direction
/// is closed with reason REVERSAL, and a missing same-direction simulation is
/// opened with the rule's sizing. With `dry_run` the outcome is reported but
/// nothing is persisted and the cooldown clock does not move.
pub fn auto_run(
    conn: &Connection,
    platform: &str,
    dry_run: bool,
    cfg: &SimulationConfig,
    now: i64,
) -> Result<AutoRunOutcome> {
    let rule = get_auto_rule(conn, platform)?;

    let mut outcome = AutoRunOutcome {
        status: AutoRunStatus::Ok,
        dry_run,
        opened: Vec::new(),
        closed: Vec::new(),
        skipped: Vec::new(),
    };

    if !rule.enabled {
        outcome.status = AutoRunStatus::Disabled;
        return Ok(outcome);
    }
    if let Some(last) = rule.last_run_at {
        if now < last + rule.cooldown_minutes * 60_000 {
            outcome.status = AutoRunStatus::Cooldown;
            return Ok(outcome);
        }
    }

    let entries = consensus::compute(
        conn,
        platform,
        &ConsensusQuery {
            time_range: rule.time_range,
            segment: rule.segment,
        },
        now,
    )?;

    // Open-slot accounting is kept locally rather than re-queried per
    // candidate: a dry run persists nothing, so the store cannot reflect
    // virtual reversals and opens. Every reversal frees a slot and every
    // open takes one, real or planned, keeping dry and live plans identical.
    let mut open_count = sim::open_positions(conn, platform)?.len() as i64;

    // Already sorted by confidence descending.
    for entry in entries {
        let Some(direction) = entry.consensus_direction.as_side() else {
            continue;
        };
        if (entry.total_traders as i64) < rule.min_traders
            || (entry.confidence_score as f64) < rule.min_confidence
            || entry.sentiment_score.abs() * 100.0 < rule.min_sentiment_abs
        {
            continue;
        }

        let open = sim::open_positions(conn, platform)?;

        // Reversals first: close any open simulation on the wrong side.
        for sim_pos in open.iter().filter(|p| {
            p.symbol == entry.symbol && p.direction == direction.opposite()
        }) {
            if dry_run {
                outcome.closed.push(sim_pos.clone());
            } else {
                let closed = close_position(
                    conn,
                    platform,
                    &sim_pos.id,
                    CloseReason::Reversal,
                    None,
                    None,
                    now,
                )?;
                outcome.closed.push(closed);
            }
            open_count -= 1;
        }

        let already_open = open
            .iter()
            .any(|p| p.symbol == entry.symbol && p.direction == direction);
        if already_open {
            outcome.skipped.push(SkippedCandidate {
                symbol: entry.symbol.clone(),
                reason: "already open".to_string(),
            });
            continue;
        }

        if open_count >= rule.max_open {
            outcome.skipped.push(SkippedCandidate {
                symbol: entry.symbol.clone(),
                reason: "max open reached".to_string(),
            });
            continue;
        }

        let request = OpenRequest {
            symbol: entry.symbol.clone(),
            direction,
            leverage: rule.leverage,
            margin_notional: rule.margin_notional,
            entry_price: None,
            // SL/TP distances resolve once the entry price is known.
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_pct: rule.trailing_stop_pct,
            slippage_bps: Some(rule.slippage_bps),
            commission_bps: Some(rule.commission_bps),
            notes: Some(format!(
                "auto: sentiment {:.2}, confidence {}",
                entry.sentiment_score, entry.confidence_score
            )),
        };

        if dry_run {
            let Some(entry_price) = reference_price(conn, platform, &entry.symbol)? else {
                outcome.skipped.push(SkippedCandidate {
                    symbol: entry.symbol.clone(),
                    reason: "no reference price".to_string(),
                });
                continue;
            };
            let mut plan = build_planned_position(platform, &request, entry_price, now);
            apply_rule_exits(&mut plan, &rule);
            outcome.opened.push(plan);
            open_count += 1;
        } else {
            match open_position(conn, platform, &request, cfg, SimSource::Auto, now) {
                Ok(mut opened) => {
                    apply_rule_exits(&mut opened, &rule);
                    conn.execute(
                        "UPDATE simulated_positions
                         SET stop_loss_price = ?2, take_profit_price = ?3
                         WHERE id = ?1",
                        params![opened.id, opened.stop_loss_price, opened.take_profit_price],
                    )?;
                    outcome.opened.push(opened);
                    open_count += 1;
                }
                Err(e) => {
                    warn!(symbol = %entry.symbol, error = %e, "auto-run open failed");
                    outcome.skipped.push(SkippedCandidate {
                        symbol: entry.symbol.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    if !dry_run {
        touch_last_run(conn, platform, &rule, now)?;
    }

    info!(
        dry_run,
        opened = outcome.opened.len(),
        closed = outcome.closed.len(),
        skipped = outcome.skipped.len(),
        "auto-run complete"
    );
    Ok(outcome)
}

/// Derive SL/TP prices from the rule's percent distances.
fn apply_rule_exits(position: &mut SimulatedPosition, rule: &AutoTriggerRule) {
    if let Some(pct) = rule.stop_loss_pct {
        position.stop_loss_price = Some(risk_math::stop_loss_from_pct(
            position.entry_price,
            position.direction,
            pct,
        ));
    }
    if let Some(pct) = rule.take_profit_pct {
        position.take_profit_price = Some(
            position.entry_price * (1.0 + position.direction.sign() * pct / 100.0),
        );
    }
}

/// A dry-run plan: the position exactly as it would be persisted.
fn build_planned_position(
    platform: &str,
    req: &OpenRequest,
    entry_price: f64,
    now: i64,
) -> SimulatedPosition {
    let slippage_bps = req.slippage_bps.unwrap_or(0.0);
    let entry_slip = slippage_bps * 1.5 / 10_000.0;
    let effective_entry_price = match req.direction {
        Side::Long => entry_price * (1.0 + entry_slip),
        Side::Short => entry_price * (1.0 - entry_slip),
    };
    SimulatedPosition {
        id: format!("plan-{}", req.symbol.to_lowercase()),
        portfolio_id: Some(DEFAULT_PORTFOLIO_ID.to_string()),
        platform: platform.to_string(),
        symbol: req.symbol.clone(),
        direction: req.direction,
        status: SimStatus::Open,
        leverage: req.leverage,
        margin_notional: req.margin_notional,
        position_notional: req.margin_notional * req.leverage,
        entry_price,
        exit_price: None,
        effective_entry_price: Some(effective_entry_price),
        effective_exit_price: None,
        stop_loss_price: req.stop_loss_price,
        take_profit_price: req.take_profit_price,
        trailing_stop_pct: req.trailing_stop_pct,
        trailing_stop_trigger: None,
        slippage_bps,
        commission_bps: req.commission_bps.unwrap_or(0.0),
        total_commission_usdt: None,
        pnl_usdt: None,
        roi_pct: None,
        unrealized_pnl: None,
        last_price: None,
        close_reason: None,
        close_trigger_lead_id: None,
        source: SimSource::Auto,
        notes: req.notes.clone(),
        opened_at: now,
        closed_at: None,
    }
}

// ---------------------------------------------------------------------------
// Backtest-lite
// ---------------------------------------------------------------------------

/// Parameters for the event-replay backtest.
#[derive(Debug, Clone, Deserialize)]
pub struct BacktestParams {
    #[serde(default = "default_backtest_range")]
    pub time_range: TimeRange,
    #[serde(default = "default_min_traders")]
    pub min_traders: i64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_sentiment_abs")]
    pub min_sentiment_abs: f64,
    #[serde(default = "default_rule_leverage")]
    pub leverage: f64,
    #[serde(default = "default_rule_margin")]
    pub margin_notional: f64,
    #[serde(default = "default_rule_slippage")]
    pub slippage_bps: f64,
    #[serde(default = "default_rule_commission")]
    pub commission_bps: f64,
    /// Consensus window width; defaults to one hour.
    #[serde(default)]
    pub window_ms: Option<i64>,
}

fn default_backtest_range() -> TimeRange {
    TimeRange::D7
}

const DEFAULT_BACKTEST_WINDOW_MS: i64 = 3_600_000;
const BACKTEST_EVENT_CAP: usize = 100_000;

/// One hypothetical trade in the replay.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestTrade {
    pub symbol: String,
    pub direction: Side,
    pub entry_time: i64,
    pub entry_price: f64,
    pub exit_time: i64,
    pub exit_price: f64,
    pub net_pnl: f64,
}

/// Per-symbol replay summary.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolBacktest {
    pub symbol: String,
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub total_pnl: f64,
}

#[derive(Debug, Serialize)]
pub struct BacktestLiteResponse {
    pub windows: usize,
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub total_pnl: f64,
    pub per_symbol: Vec<SymbolBacktest>,
    pub trade_log: Vec<BacktestTrade>,
}

/// Replay the stored event stream: per consensus window, a symbol clearing
/// the thresholds opens a hypothetical position at the window's first OPEN
/// price in that direction, and closes at the first subsequent CLOSE event
/// for the same (symbol, direction), or at the last known price by window
/// end.
pub fn backtest_lite(
    conn: &Connection,
    platform: &str,
    params: &BacktestParams,
    now: i64,
) -> Result<BacktestLiteResponse> {
    let start = now - params.time_range.as_millis();
    let window_ms = params.window_ms.unwrap_or(DEFAULT_BACKTEST_WINDOW_MS).max(60_000);

    let mut events = store::events_since(conn, platform, None, start, BACKTEST_EVENT_CAP)?;
    events.reverse(); // chronological

    let window_count = ((now - start) / window_ms).max(0) as usize + 1;
    let mut trade_log: Vec<BacktestTrade> = Vec::new();

    use std::collections::{BTreeMap, HashSet};
    // (window, symbol) -> (long traders, short traders, first open event per side)
    #[derive(Default)]
    struct Bucket {
        longs: HashSet<String>,
        shorts: HashSet<String>,
        first_open_long: Option<(i64, f64)>,
        first_open_short: Option<(i64, f64)>,
    }
    let mut buckets: BTreeMap<(i64, String), Bucket> = BTreeMap::new();

    for e in &events {
        if !e.event_type.is_open() {
            continue;
        }
        let wi = (e.event_time - start) / window_ms;
        let bucket = buckets.entry((wi, e.symbol.clone())).or_default();
        match e.event_type.side() {
            Some(Side::Long) => {
                bucket.longs.insert(e.lead_id.clone());
                if bucket.first_open_long.is_none() {
                    if let Some(price) = e.price {
                        bucket.first_open_long = Some((e.event_time, price));
                    }
                }
            }
            Some(Side::Short) => {
                bucket.shorts.insert(e.lead_id.clone());
                if bucket.first_open_short.is_none() {
                    if let Some(price) = e.price {
                        bucket.first_open_short = Some((e.event_time, price));
                    }
                }
            }
            None => {}
        }
    }

    for ((_wi, symbol), bucket) in &buckets {
        let longs = bucket.longs.len() as f64;
        let shorts = bucket.shorts.len() as f64;
        let total = longs + shorts;
        if total == 0.0 {
            continue;
        }
        let sentiment = (longs - shorts) / total;
        let agreement = 1.0 - 1.0 / (1.0 + total);
        let confidence = (100.0 * sentiment.abs() * agreement).round();

        if (total as i64) < params.min_traders
            || confidence < params.min_confidence
            || sentiment.abs() * 100.0 < params.min_sentiment_abs
        {
            continue;
        }

        let direction = if sentiment > consensus::SENTIMENT_EPSILON {
            Side::Long
        } else if sentiment < -consensus::SENTIMENT_EPSILON {
            Side::Short
        } else {
            continue;
        };

        let Some((entry_time, entry_price)) = (match direction {
            Side::Long => bucket.first_open_long,
            Side::Short => bucket.first_open_short,
        }) else {
            continue;
        };

        // First subsequent CLOSE for the same (symbol, direction)...
        let close_type = crate::types::EventType::close_for(direction);
        let exit = events
            .iter()
            .find(|e| {
                e.symbol == *symbol
                    && e.event_type == close_type
                    && e.event_time > entry_time
                    && e.price.is_some()
            })
            .map(|e| (e.event_time, e.price.unwrap_or(entry_price)))
            // ...or the last priced observation of the symbol (window end).
            .or_else(|| {
                events
                    .iter()
                    .rev()
                    .find(|e| e.symbol == *symbol && e.event_time > entry_time && e.price.is_some())
                    .map(|e| (e.event_time, e.price.unwrap_or(entry_price)))
            });

        let Some((exit_time, exit_price)) = exit else {
            continue;
        };

        let cost = risk_math::execution_cost(
            direction,
            entry_price,
            exit_price,
            params.margin_notional,
            params.leverage,
            params.slippage_bps,
            params.commission_bps,
        );

        trade_log.push(BacktestTrade {
            symbol: symbol.clone(),
            direction,
            entry_time,
            entry_price,
            exit_time,
            exit_price,
            net_pnl: round4(cost.net_pnl),
        });
    }

    // Aggregate.
    let mut per_symbol_map: BTreeMap<String, (usize, usize, f64)> = BTreeMap::new();
    for t in &trade_log {
        let slot = per_symbol_map.entry(t.symbol.clone()).or_insert((0, 0, 0.0));
        slot.0 += 1;
        if t.net_pnl > 0.0 {
            slot.1 += 1;
        }
        slot.2 += t.net_pnl;
    }
    let per_symbol: Vec<SymbolBacktest> = per_symbol_map
        .into_iter()
        .map(|(symbol, (trades, wins, total_pnl))| SymbolBacktest {
            symbol,
            trades,
            wins,
            win_rate: if trades > 0 { wins as f64 / trades as f64 } else { 0.0 },
            avg_pnl: if trades > 0 { total_pnl / trades as f64 } else { 0.0 },
            total_pnl,
        })
        .collect();

    let trades = trade_log.len();
    let wins = trade_log.iter().filter(|t| t.net_pnl > 0.0).count();
    let total_pnl: f64 = trade_log.iter().map(|t| t.net_pnl).sum();

    Ok(BacktestLiteResponse {
        windows: window_count,
        trades,
        wins,
        win_rate: if trades > 0 { wins as f64 / trades as f64 } else { 0.0 },
        avg_pnl: if trades > 0 { total_pnl / trades as f64 } else { 0.0 },
        total_pnl,
        per_symbol,
        trade_log,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{NormalizedEvent, NormalizedPosition};
    use crate::store::{self, Store};
    use crate::types::{EventType, MarginType};
    use serde_json::json;

    fn cfg() -> SimulationConfig {
        SimulationConfig::default()
    }

    fn snapshot_pos(symbol: &str, side: Side, mark: f64) -> NormalizedPosition {
        NormalizedPosition {
            symbol: symbol.to_string(),
            side,
            contract_type: None,
            leverage: Some(10.0),
            size: Some(1.0),
            entry_price: Some(mark),
            mark_price: Some(mark),
            margin_usdt: None,
            margin_type: MarginType::Cross,
            pnl_usdt: None,
            roe_pct: None,
            raw: json!({}),
        }
    }

    fn event(key: &str, et: EventType, symbol: &str, price: f64, t: i64) -> NormalizedEvent {
        NormalizedEvent {
            event_key: key.to_string(),
            event_type: et,
            symbol: symbol.to_string(),
            price: Some(price),
            amount: Some(0.1),
            amount_asset: None,
            realized_pnl: None,
            event_time_text: format!("t{t}"),
            event_time: t,
            fetched_at: t,
        }
    }

    fn seed_reference_price(db: &Store, symbol: &str, price: f64) {
        let conn = db.conn();
        store::insert_snapshots(
            &conn,
            "binance",
            "REF",
            1_000,
            &[snapshot_pos(symbol, Side::Long, price)],
        )
        .unwrap();
    }

    #[test]
    fn reference_price_prefers_snapshots_then_events() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();

        // No data at all.
        assert_eq!(reference_price(&conn, "binance", "BTCUSDT").unwrap(), None);

        // Event-only fallback.
        store::insert_events(
            &conn,
            "binance",
            "T1",
            &[event("e1", EventType::OpenLong, "BTCUSDT", 59_000.0, 1_000)],
        )
        .unwrap();
        assert_eq!(
            reference_price(&conn, "binance", "BTCUSDT").unwrap(),
            Some(59_000.0)
        );

        // Snapshots win once present.
        store::insert_snapshots(
            &conn,
            "binance",
            "T1",
            2_000,
            &[snapshot_pos("BTCUSDT", Side::Long, 61_000.0)],
        )
        .unwrap();
        store::insert_snapshots(
            &conn,
            "binance",
            "T2",
            2_000,
            &[snapshot_pos("BTCUSDT", Side::Long, 63_000.0)],
        )
        .unwrap();
        assert_eq!(
            reference_price(&conn, "binance", "BTCUSDT").unwrap(),
            Some(62_000.0)
        );
    }

    #[test]
    fn winning_long_round_trip_matches_cost_model() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();

        let req = OpenRequest {
            symbol: "BTCUSDT".into(),
            direction: Side::Long,
            leverage: 10.0,
            margin_notional: 100.0,
            entry_price: Some(60_000.0),
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_pct: None,
            slippage_bps: Some(10.0),
            commission_bps: Some(4.0),
            notes: None,
        };
        let opened = open_position(&conn, "binance", &req, &cfg(), SimSource::Manual, 1_000).unwrap();
        assert_eq!(opened.position_notional, 1_000.0);
        assert!((opened.effective_entry_price.unwrap() - 60_090.0).abs() < 1e-6);

        // Margin reserved.
        let p = portfolio::get(&conn, DEFAULT_PORTFOLIO_ID).unwrap().unwrap();
        assert!((p.balance - 9_900.0).abs() < 1e-9);

        let closed = close_position(
            &conn,
            "binance",
            &opened.id,
            CloseReason::Manual,
            Some(61_200.0),
            None,
            2_000,
        )
        .unwrap();
        assert_eq!(closed.status, SimStatus::Closed);
        assert!((closed.pnl_usdt.unwrap() - 16.7).abs() < 1e-4);
        assert!((closed.roi_pct.unwrap() - 16.7).abs() < 1e-4);
        assert!((closed.effective_exit_price.unwrap() - 61_138.8).abs() < 1e-6);

        // Margin plus net PnL returned.
        let p = portfolio::get(&conn, DEFAULT_PORTFOLIO_ID).unwrap().unwrap();
        assert!((p.balance - 10_016.7).abs() < 1e-4);

        // Double close is rejected.
        assert!(close_position(
            &conn,
            "binance",
            &opened.id,
            CloseReason::Manual,
            Some(61_200.0),
            None,
            3_000,
        )
        .is_err());
    }

    #[test]
    fn reconcile_updates_unrealized_only() {
        let db = Store::open_in_memory().unwrap();
        seed_reference_price(&db, "BTCUSDT", 61_200.0);
        let conn = db.conn();

        let req = OpenRequest {
            symbol: "BTCUSDT".into(),
            direction: Side::Long,
            leverage: 10.0,
            margin_notional: 100.0,
            entry_price: Some(60_000.0),
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_pct: None,
            slippage_bps: None,
            commission_bps: None,
            notes: None,
        };
        let opened = open_position(&conn, "binance", &req, &cfg(), SimSource::Manual, 1_000).unwrap();

        let updated = reconcile(&conn, "binance").unwrap();
        assert_eq!(updated, 1);

        let refreshed = sim::get_position(&conn, &opened.id).unwrap().unwrap();
        assert_eq!(refreshed.status, SimStatus::Open);
        // 1000 notional * 2% move = 20.
        assert!((refreshed.unrealized_pnl.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(refreshed.last_price, Some(61_200.0));
    }

    fn seed_consensus(db: &Store, symbol: &str, side: Side, now: i64) {
        let conn = db.conn();
        for (lead, weight) in [("A", 0.5), ("B", 0.3)] {
            store::upsert_lead_trader(&conn, "binance", lead, None, Some(true), now).unwrap();
            store::insert_snapshots(
                &conn,
                "binance",
                lead,
                now,
                &[snapshot_pos(symbol, side, 60_000.0)],
            )
            .unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO trader_scores
                     (platform, lead_id, score_30d, quality_score, confidence, win_rate,
                      sample_size, trader_weight, updated_at)
                 VALUES ('binance', ?1, 50.0, 50.0, 'high', 0.6, 25, ?2, ?3)",
                params![lead, weight, now],
            )
            .unwrap();
        }
    }

    #[test]
    fn auto_run_opens_respects_cooldown_then_reverses() {
        let db = Store::open_in_memory().unwrap();
        let t0 = 10 * 24 * 3_600_000_i64;
        seed_consensus(&db, "BTCUSDT", Side::Long, t0);

        let conn = db.conn();
        let rule = AutoTriggerRule {
            enabled: true,
            ..AutoTriggerRule::default()
        };
        save_auto_rule(&conn, "binance", &rule, t0).unwrap();

        // Run A: opens one LONG.
        let a = auto_run(&conn, "binance", false, &cfg(), t0).unwrap();
        assert_eq!(a.status, AutoRunStatus::Ok);
        assert_eq!(a.opened.len(), 1);
        assert_eq!(a.opened[0].direction, Side::Long);
        assert_eq!(a.opened[0].source, SimSource::Auto);

        // Run B: one minute later, inside the 30m cooldown.
        let b = auto_run(&conn, "binance", false, &cfg(), t0 + 60_000).unwrap();
        assert_eq!(b.status, AutoRunStatus::Cooldown);
        assert!(b.opened.is_empty());
        assert_eq!(sim::open_positions(&conn, "binance").unwrap().len(), 1);

        // Consensus flips to SHORT.
        drop(conn);
        let t1 = t0 + 31 * 60_000;
        seed_consensus(&db, "BTCUSDT", Side::Short, t1);
        let conn = db.conn();

        // Run C: past cooldown, closes the LONG as REVERSAL and opens a SHORT.
        let c = auto_run(&conn, "binance", false, &cfg(), t1).unwrap();
        assert_eq!(c.status, AutoRunStatus::Ok);
        assert_eq!(c.closed.len(), 1);
        assert_eq!(c.closed[0].close_reason.as_deref(), Some("REVERSAL"));
        assert_eq!(c.opened.len(), 1);
        assert_eq!(c.opened[0].direction, Side::Short);

        let stored = get_auto_rule(&conn, "binance").unwrap();
        assert_eq!(stored.last_run_at, Some(t1));
    }

    #[test]
    fn auto_run_dry_run_persists_nothing() {
        let db = Store::open_in_memory().unwrap();
        let t0 = 10 * 24 * 3_600_000_i64;
        seed_consensus(&db, "ETHUSDT", Side::Long, t0);

        let conn = db.conn();
        let rule = AutoTriggerRule {
            enabled: true,
            ..AutoTriggerRule::default()
        };
        save_auto_rule(&conn, "binance", &rule, t0).unwrap();

        let out = auto_run(&conn, "binance", true, &cfg(), t0).unwrap();
        assert_eq!(out.opened.len(), 1);
        assert!(out.dry_run);
        assert!(sim::open_positions(&conn, "binance").unwrap().is_empty());
        // Cooldown clock untouched by a dry run.
        assert_eq!(get_auto_rule(&conn, "binance").unwrap().last_run_at, None);
    }

    #[test]
    fn auto_run_dry_run_plans_reversal_like_a_live_run() {
        let db = Store::open_in_memory().unwrap();
        let t0 = 10 * 24 * 3_600_000_i64;
        seed_consensus(&db, "BTCUSDT", Side::Short, t0);

        let conn = db.conn();
        // One open LONG fills the single slot; a live run would close it as
        // a reversal and open the SHORT. The dry plan must say the same.
        let req = OpenRequest {
            symbol: "BTCUSDT".into(),
            direction: Side::Long,
            leverage: 10.0,
            margin_notional: 100.0,
            entry_price: Some(60_000.0),
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_pct: None,
            slippage_bps: None,
            commission_bps: None,
            notes: None,
        };
        let existing = open_position(&conn, "binance", &req, &cfg(), SimSource::Auto, t0).unwrap();

        let rule = AutoTriggerRule {
            enabled: true,
            max_open: 1,
            ..AutoTriggerRule::default()
        };
        save_auto_rule(&conn, "binance", &rule, t0).unwrap();

        let out = auto_run(&conn, "binance", true, &cfg(), t0).unwrap();
        assert_eq!(out.status, AutoRunStatus::Ok);
        assert_eq!(out.closed.len(), 1);
        assert_eq!(out.closed[0].id, existing.id);
        assert_eq!(out.opened.len(), 1);
        assert_eq!(out.opened[0].direction, Side::Short);
        assert!(out.skipped.is_empty());

        // Nothing persisted: the LONG is still the only position.
        let open = sim::open_positions(&conn, "binance").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, existing.id);
        assert_eq!(open[0].direction, Side::Long);
    }

    #[test]
    fn auto_run_disabled_rule_does_nothing() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();
        let out = auto_run(&conn, "binance", false, &cfg(), 1_000).unwrap();
        assert_eq!(out.status, AutoRunStatus::Disabled);
    }

    #[test]
    fn backtest_lite_replays_open_close_pairs() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();
        let now = 10 * 24 * 3_600_000_i64;
        let start = now - TimeRange::D1.as_millis();

        // Three traders open long within one window; a close follows.
        store::insert_events(
            &conn,
            "binance",
            "A",
            &[event("e1", EventType::OpenLong, "BTCUSDT", 60_000.0, start + 100_000)],
        )
        .unwrap();
        store::insert_events(
            &conn,
            "binance",
            "B",
            &[event("e2", EventType::OpenLong, "BTCUSDT", 60_100.0, start + 200_000)],
        )
        .unwrap();
        store::insert_events(
            &conn,
            "binance",
            "C",
            &[event("e3", EventType::OpenLong, "BTCUSDT", 60_200.0, start + 300_000)],
        )
        .unwrap();
        store::insert_events(
            &conn,
            "binance",
            "A",
            &[event("e4", EventType::CloseLong, "BTCUSDT", 61_000.0, start + 500_000)],
        )
        .unwrap();

        let params = BacktestParams {
            time_range: TimeRange::D1,
            min_traders: 2,
            min_confidence: 40.0,
            min_sentiment_abs: 20.0,
            leverage: 10.0,
            margin_notional: 100.0,
            slippage_bps: 0.0,
            commission_bps: 0.0,
            window_ms: None,
        };
        let result = backtest_lite(&conn, "binance", &params, now).unwrap();

        assert_eq!(result.trades, 1);
        assert_eq!(result.wins, 1);
        let trade = &result.trade_log[0];
        assert_eq!(trade.entry_price, 60_000.0);
        assert_eq!(trade.exit_price, 61_000.0);
        // 1000 notional * (1000/60000) move.
        assert!((trade.net_pnl - 1_000.0 * (1_000.0 / 60_000.0)).abs() < 1e-3);
        assert_eq!(result.per_symbol.len(), 1);
        assert_eq!(result.per_symbol[0].symbol, "BTCUSDT");
    }

    #[test]
    fn backtest_lite_without_enough_traders_yields_no_trades() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();
        let now = 10 * 24 * 3_600_000_i64;
        let start = now - TimeRange::D1.as_millis();

        store::insert_events(
            &conn,
            "binance",
            "A",
            &[event("e1", EventType::OpenLong, "BTCUSDT", 60_000.0, start + 100_000)],
        )
        .unwrap();

        let params = BacktestParams {
            time_range: TimeRange::D1,
            min_traders: 2,
            min_confidence: 0.0,
            min_sentiment_abs: 0.0,
            leverage: 10.0,
            margin_notional: 100.0,
            slippage_bps: 0.0,
            commission_bps: 0.0,
            window_ms: None,
        };
        let result = backtest_lite(&conn, "binance", &params, now).unwrap();
        assert_eq!(result.trades, 0);
    }
}
