// =============================================================================
// Risk Math — pure sizing, cost, and robustness functions
// =============================================================================
//
// Nothing in this module touches the store or the clock. Every function is a
// deterministic map from inputs to outputs (Monte Carlo takes its randomness
// from the supplied RNG), which keeps the simulator and backtest replayable.
// =============================================================================

use rand::Rng;
use serde::Serialize;

use crate::types::Side;

// ---------------------------------------------------------------------------
// Execution cost model
// ---------------------------------------------------------------------------

/// Full cost breakdown of a round-trip simulated trade.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionCost {
    pub effective_entry_price: f64,
    pub effective_exit_price: f64,
    /// Signed relative move from entry to exit, positive when favourable.
    pub raw_move: f64,
    pub gross_pnl: f64,
    pub total_slippage: f64,
    pub total_commission: f64,
    pub net_pnl: f64,
    pub roi_pct: f64,
}

/// Model slippage and commission for a round trip.
///
/// Entry slippage is 1.5x the exit slippage; both worsen the trade for the
/// given direction. Commission is charged per side on the position notional.
pub fn execution_cost(
    direction: Side,
    entry_price: f64,
    exit_price: f64,
    margin_notional: f64,
    leverage: f64,
    slippage_bps: f64,
    commission_bps: f64,
) -> ExecutionCost {
    let position_notional = margin_notional * leverage;
    let entry_slip = slippage_bps * 1.5 / 10_000.0;
    let exit_slip = slippage_bps / 10_000.0;

    let (effective_entry_price, effective_exit_price) = match direction {
        Side::Long => (
            entry_price * (1.0 + entry_slip),
            exit_price * (1.0 - exit_slip),
        ),
        Side::Short => (
            entry_price * (1.0 - entry_slip),
            exit_price * (1.0 + exit_slip),
        ),
    };

    let raw_move = if entry_price > 0.0 {
        direction.sign() * (exit_price - entry_price) / entry_price
    } else {
        0.0
    };

    let gross_pnl = position_notional * raw_move;
    let total_slippage = position_notional * (entry_slip + exit_slip);
    let total_commission = 2.0 * position_notional * commission_bps / 10_000.0;
    let net_pnl = gross_pnl - total_slippage - total_commission;
    let roi_pct = if margin_notional > 0.0 {
        100.0 * net_pnl / margin_notional
    } else {
        0.0
    };

    ExecutionCost {
        effective_entry_price,
        effective_exit_price,
        raw_move,
        gross_pnl,
        total_slippage,
        total_commission,
        net_pnl,
        roi_pct,
    }
}

// ---------------------------------------------------------------------------
// Position sizing
// ---------------------------------------------------------------------------

/// Kelly-fraction position size in account currency.
///
/// `f* = (b*p - q)/b` with `b = avg_risk_reward`, `p = win_rate`. Returns 0
/// for unreliable inputs (`p < 0.3`) or a non-positive edge; otherwise the
/// fractional Kelly capped at 25% of balance.
pub fn kelly_position_size(
    balance: f64,
    win_rate: f64,
    avg_risk_reward: f64,
    kelly_fraction: f64,
) -> f64 {
    if win_rate < 0.3 || avg_risk_reward <= 0.0 || balance <= 0.0 {
        return 0.0;
    }
    let p = win_rate;
    let q = 1.0 - p;
    let b = avg_risk_reward;
    let f_star = (b * p - q) / b;
    if f_star <= 0.0 {
        return 0.0;
    }
    (f_star * kelly_fraction).min(0.25) * balance
}

/// Notional and margin for a fixed-risk position.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RiskSizing {
    pub position_notional: f64,
    pub margin_notional: f64,
}

/// Size a position so that hitting the stop loses `risk_pct` percent of
/// balance.
pub fn risk_based_size(
    balance: f64,
    risk_pct: f64,
    entry_price: f64,
    stop_price: f64,
    leverage: f64,
) -> RiskSizing {
    let stop_distance = if entry_price > 0.0 {
        (entry_price - stop_price).abs() / entry_price
    } else {
        0.0
    };
    if stop_distance <= 0.0 || leverage <= 0.0 {
        return RiskSizing {
            position_notional: 0.0,
            margin_notional: 0.0,
        };
    }
    let position_notional = (balance * risk_pct / 100.0) / stop_distance;
    RiskSizing {
        position_notional,
        margin_notional: position_notional / leverage,
    }
}

/// Stop-loss price at a fixed percent distance from entry.
pub fn stop_loss_from_pct(entry_price: f64, direction: Side, pct: f64) -> f64 {
    entry_price * (1.0 - direction.sign() * pct / 100.0)
}

/// Stop-loss price that loses `risk_usdt` on the given notional.
pub fn stop_loss_from_risk(
    entry_price: f64,
    direction: Side,
    risk_usdt: f64,
    position_notional: f64,
) -> f64 {
    if position_notional <= 0.0 {
        return entry_price;
    }
    let move_frac = risk_usdt / position_notional;
    entry_price * (1.0 - direction.sign() * move_frac)
}

/// Take-profit price at `risk_reward` times the stop distance.
pub fn take_profit_from_rr(
    entry_price: f64,
    stop_price: f64,
    direction: Side,
    risk_reward: f64,
) -> f64 {
    let distance = (entry_price - stop_price).abs();
    entry_price + direction.sign() * distance * risk_reward
}

// ---------------------------------------------------------------------------
// Monte Carlo bootstrap
// ---------------------------------------------------------------------------

/// Distribution summary of bootstrapped equity outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct MonteCarloResult {
    pub simulations: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub confidence95_low: f64,
    pub confidence95_high: f64,
    pub worst: f64,
    pub best: f64,
    /// Share of runs finishing below the initial balance.
    pub probability_of_ruin: f64,
}

/// Bootstrap `simulations` runs of `trade_pnls.len()` trades sampled with
/// replacement. A run whose equity reaches zero is halted at zero.
pub fn monte_carlo(
    trade_pnls: &[f64],
    initial_balance: f64,
    simulations: usize,
    rng: &mut impl Rng,
) -> MonteCarloResult {
    if trade_pnls.is_empty() || simulations == 0 {
        return MonteCarloResult {
            simulations,
            mean: initial_balance,
            median: initial_balance,
            std_dev: 0.0,
            confidence95_low: initial_balance,
            confidence95_high: initial_balance,
            worst: initial_balance,
            best: initial_balance,
            probability_of_ruin: 0.0,
        };
    }

    let mut finals = Vec::with_capacity(simulations);
    for _ in 0..simulations {
        let mut equity = initial_balance;
        for _ in 0..trade_pnls.len() {
            equity += trade_pnls[rng.gen_range(0..trade_pnls.len())];
            if equity <= 0.0 {
                equity = 0.0;
                break;
            }
        }
        finals.push(equity);
    }
    finals.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let n = finals.len() as f64;
    let mean = finals.iter().sum::<f64>() / n;
    let variance = finals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let below_initial = finals.iter().filter(|v| **v < initial_balance).count();

    MonteCarloResult {
        simulations,
        mean,
        median: percentile(&finals, 50.0),
        std_dev: variance.sqrt(),
        confidence95_low: percentile(&finals, 2.5),
        confidence95_high: percentile(&finals, 97.5),
        worst: finals[0],
        best: finals[finals.len() - 1],
        probability_of_ruin: below_initial as f64 / n,
    }
}

/// Linear-interpolated percentile of a sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

// ---------------------------------------------------------------------------
// Walk-forward analysis
// ---------------------------------------------------------------------------

/// In/out-of-sample win rates of one walk-forward window.
#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardWindow {
    pub in_sample_win_rate: f64,
    pub out_sample_win_rate: f64,
}

/// Walk-forward robustness summary.
#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardResult {
    pub windows: Vec<WalkForwardWindow>,
    /// Pearson correlation of per-window in/out win rates.
    pub correlation: f64,
    /// Mean of (out - in) win-rate deltas; negative means degradation.
    pub avg_degradation: f64,
    /// clip(-100 * avg_degradation, 0, 100).
    pub overfit_score: f64,
}

/// Split time-ordered trade PnLs into `window_count` windows, the first
/// `in_sample_ratio` of each being in-sample.
pub fn walk_forward(trade_pnls: &[f64], window_count: usize, in_sample_ratio: f64) -> WalkForwardResult {
    let mut windows = Vec::new();

    if window_count > 0 && !trade_pnls.is_empty() {
        let per_window = (trade_pnls.len() / window_count).max(1);
        for chunk in trade_pnls.chunks(per_window).take(window_count) {
            let split = ((chunk.len() as f64 * in_sample_ratio).round() as usize)
                .clamp(1, chunk.len().saturating_sub(1).max(1));
            let (in_sample, out_sample) = chunk.split_at(split.min(chunk.len()));
            windows.push(WalkForwardWindow {
                in_sample_win_rate: win_rate(in_sample),
                out_sample_win_rate: win_rate(out_sample),
            });
        }
    }

    let ins: Vec<f64> = windows.iter().map(|w| w.in_sample_win_rate).collect();
    let outs: Vec<f64> = windows.iter().map(|w| w.out_sample_win_rate).collect();
    let avg_degradation = if windows.is_empty() {
        0.0
    } else {
        windows
            .iter()
            .map(|w| w.out_sample_win_rate - w.in_sample_win_rate)
            .sum::<f64>()
            / windows.len() as f64
    };

    WalkForwardResult {
        correlation: pearson(&ins, &outs),
        avg_degradation,
        overfit_score: (-100.0 * avg_degradation).clamp(0.0, 100.0),
        windows,
    }
}

fn win_rate(pnls: &[f64]) -> f64 {
    if pnls.is_empty() {
        return 0.0;
    }
    pnls.iter().filter(|p| **p > 0.0).count() as f64 / pnls.len() as f64
}

/// Pearson correlation; 0 for degenerate inputs.
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() != ys.len() || xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

// ---------------------------------------------------------------------------
// Equity curve & drawdowns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub at: i64,
    pub equity: f64,
}

/// One peak → trough → recovery arc.
#[derive(Debug, Clone, Serialize)]
pub struct DrawdownPeriod {
    pub peak_at: i64,
    pub trough_at: i64,
    pub recovered_at: Option<i64>,
    pub depth_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EquityCurve {
    pub points: Vec<EquityPoint>,
    pub max_drawdown_pct: f64,
    pub drawdown_periods: Vec<DrawdownPeriod>,
}

/// Walk `(closed_at, pnl)` pairs in time order, tracking peak equity and
/// emitting drawdown periods.
pub fn equity_curve(trades: &[(i64, f64)], initial_balance: f64) -> EquityCurve {
    let mut sorted: Vec<(i64, f64)> = trades.to_vec();
    sorted.sort_by_key(|(at, _)| *at);

    let mut points = Vec::with_capacity(sorted.len());
    let mut periods: Vec<DrawdownPeriod> = Vec::new();
    let mut equity = initial_balance;
    let mut peak = initial_balance;
    let mut peak_at = sorted.first().map(|(at, _)| *at).unwrap_or(0);
    let mut max_drawdown_pct = 0.0_f64;
    let mut open_period: Option<DrawdownPeriod> = None;

    for (at, pnl) in sorted {
        equity += pnl;
        points.push(EquityPoint { at, equity });

        if equity >= peak {
            if let Some(mut period) = open_period.take() {
                period.recovered_at = Some(at);
                periods.push(period);
            }
            peak = equity;
            peak_at = at;
            continue;
        }

        let depth_pct = if peak > 0.0 {
            100.0 * (peak - equity) / peak
        } else {
            0.0
        };
        max_drawdown_pct = max_drawdown_pct.max(depth_pct);

        match open_period.as_mut() {
            Some(period) => {
                if depth_pct > period.depth_pct {
                    period.depth_pct = depth_pct;
                    period.trough_at = at;
                }
            }
            None => {
                open_period = Some(DrawdownPeriod {
                    peak_at,
                    trough_at: at,
                    recovered_at: None,
                    depth_pct,
                });
            }
        }
    }

    if let Some(period) = open_period {
        periods.push(period);
    }

    EquityCurve {
        points,
        max_drawdown_pct,
        drawdown_periods: periods,
    }
}
