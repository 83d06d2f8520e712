// =============================================================================
// Portfolio Manager — simulated balance, equity snapshots, trade metrics
// =============================================================================
//
// Opening a simulation reserves its margin from the portfolio balance; a
// close returns the margin plus the net PnL. Snapshots are taken at the end
// of each scheduler cycle, and the metrics are recomputed from the full set
// of CLOSED positions ordered by close time.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::risk_math;
use crate::runtime_config::SimulationConfig;
use crate::sim::{self, DEFAULT_PORTFOLIO_ID};

/// Simulated account holding margin for open paper trades.
#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub id: String,
    pub platform: String,
    pub name: String,
    pub initial_balance: f64,
    pub balance: f64,
    pub max_open_positions: i64,
    pub max_margin_per_trade: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// End-of-cycle equity snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub portfolio_id: String,
    pub at: i64,
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub open_positions: i64,
    pub total_value: f64,
}

/// Aggregate statistics over all closed simulations.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub avg_slippage_bps: f64,
    pub total_commission: f64,
    pub max_drawdown_pct: f64,
    pub total_pnl: f64,
}

/// Fetch the default portfolio, creating it from config on first use.
pub fn ensure_default(conn: &Connection, platform: &str, cfg: &SimulationConfig, now: i64) -> Result<Portfolio> {
    if let Some(p) = get(conn, DEFAULT_PORTFOLIO_ID)? {
        return Ok(p);
    }
    conn.execute(
        "INSERT INTO portfolios
             (id, platform, name, initial_balance, balance, max_open_positions,
              max_margin_per_trade, created_at, updated_at)
         VALUES (?1, ?2, 'Default', ?3, ?3, ?4, ?5, ?6, ?6)",
        params![
            DEFAULT_PORTFOLIO_ID,
            platform,
            cfg.initial_balance,
            cfg.max_open_simulations as i64,
            cfg.initial_balance / 4.0,
            now,
        ],
    )?;
    info!(
        platform,
        initial_balance = cfg.initial_balance,
        "default portfolio created"
    );
    get(conn, DEFAULT_PORTFOLIO_ID)?.context("default portfolio vanished after insert")
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Portfolio>> {
    let row = conn
        .query_row(
            "SELECT id, platform, name, initial_balance, balance, max_open_positions,
                    max_margin_per_trade, created_at, updated_at
             FROM portfolios WHERE id = ?1",
            params![id],
            |row| {
                Ok(Portfolio {
                    id: row.get(0)?,
                    platform: row.get(1)?,
                    name: row.get(2)?,
                    initial_balance: row.get(3)?,
                    balance: row.get(4)?,
                    max_open_positions: row.get(5)?,
                    max_margin_per_trade: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Move the balance by `delta` (negative reserves margin on open; on close
/// the delta is `margin_notional + net_pnl`).
pub fn adjust_balance(conn: &Connection, id: &str, delta: f64, now: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE portfolios SET balance = balance + ?2, updated_at = ?3 WHERE id = ?1",
        params![id, delta, now],
    )?;
    anyhow::ensure!(changed == 1, "portfolio {id} not found");
    Ok(())
}

/// Take the end-of-cycle snapshot for the default portfolio.
pub fn snapshot(conn: &Connection, platform: &str, now: i64) -> Result<Option<PortfolioSnapshot>> {
    let Some(portfolio) = get(conn, DEFAULT_PORTFOLIO_ID)? else {
        return Ok(None);
    };

    let open = sim::open_positions(conn, platform)?;
    let open_margin: f64 = open.iter().map(|p| p.margin_notional).sum();
    let unrealized_pnl: f64 = open.iter().filter_map(|p| p.unrealized_pnl).sum();
    let realized_pnl: f64 = conn.query_row(
        "SELECT COALESCE(SUM(pnl_usdt), 0.0) FROM simulated_positions
         WHERE platform = ?1 AND status = 'CLOSED'",
        params![platform],
        |row| row.get(0),
    )?;

    let snap = PortfolioSnapshot {
        portfolio_id: portfolio.id.clone(),
        at: now,
        balance: portfolio.balance,
        unrealized_pnl,
        realized_pnl,
        open_positions: open.len() as i64,
        total_value: portfolio.balance + open_margin + unrealized_pnl,
    };

    conn.execute(
        "INSERT INTO portfolio_snapshots
             (portfolio_id, at, balance, unrealized_pnl, realized_pnl, open_positions, total_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            snap.portfolio_id,
            snap.at,
            snap.balance,
            snap.unrealized_pnl,
            snap.realized_pnl,
            snap.open_positions,
            snap.total_value,
        ],
    )?;
    Ok(Some(snap))
}

/// Recompute trade metrics from the CLOSED set ordered by `closed_at`.
pub fn metrics(conn: &Connection, platform: &str) -> Result<PortfolioMetrics> {
    let closed = sim::closed_positions(conn, platform)?;
    let initial_balance = get(conn, DEFAULT_PORTFOLIO_ID)?
        .map(|p| p.initial_balance)
        .unwrap_or(0.0);

    let mut wins = 0usize;
    let mut losses = 0usize;
    let mut win_sum = 0.0;
    let mut loss_sum = 0.0;
    let mut consec_wins = 0usize;
    let mut consec_losses = 0usize;
    let mut max_consec_wins = 0usize;
    let mut max_consec_losses = 0usize;
    let mut total_commission = 0.0;
    let mut slippage_sum = 0.0;
    let mut total_pnl = 0.0;
    let mut curve_input = Vec::with_capacity(closed.len());

    for p in &closed {
        let pnl = p.pnl_usdt.unwrap_or(0.0);
        total_pnl += pnl;
        total_commission += p.total_commission_usdt.unwrap_or(0.0);
        slippage_sum += p.slippage_bps;
        curve_input.push((p.closed_at.unwrap_or(p.opened_at), pnl));

        if pnl > 0.0 {
            wins += 1;
            win_sum += pnl;
            consec_wins += 1;
            consec_losses = 0;
        } else {
            losses += 1;
            loss_sum += pnl.abs();
            consec_losses += 1;
            consec_wins = 0;
        }
        max_consec_wins = max_consec_wins.max(consec_wins);
        max_consec_losses = max_consec_losses.max(consec_losses);
    }

    let total = closed.len();
    let curve = risk_math::equity_curve(&curve_input, initial_balance);

    Ok(PortfolioMetrics {
        total_trades: total,
        wins,
        losses,
        win_rate: if total > 0 { wins as f64 / total as f64 } else { 0.0 },
        avg_win: if wins > 0 { win_sum / wins as f64 } else { 0.0 },
        avg_loss: if losses > 0 { loss_sum / losses as f64 } else { 0.0 },
        profit_factor: if loss_sum > 0.0 {
            win_sum / loss_sum
        } else if win_sum > 0.0 {
            f64::INFINITY
        } else {
            0.0
        },
        max_consecutive_wins: max_consec_wins,
        max_consecutive_losses: max_consec_losses,
        avg_slippage_bps: if total > 0 { slippage_sum / total as f64 } else { 0.0 },
        total_commission,
        max_drawdown_pct: curve.max_drawdown_pct,
        total_pnl,
    })
}

/// Robustness analysis of the closed-trade history.
#[derive(Debug, Serialize)]
pub struct PortfolioAnalysis {
    pub monte_carlo: risk_math::MonteCarloResult,
    pub walk_forward: risk_math::WalkForwardResult,
    pub equity: risk_math::EquityCurve,
}

/// Monte Carlo runs used by the report endpoint.
const REPORT_MC_SIMULATIONS: usize = 1_000;

/// Bootstrap/walk-forward/equity analysis over the CLOSED set.
pub fn analysis(conn: &Connection, platform: &str) -> Result<PortfolioAnalysis> {
    let closed = sim::closed_positions(conn, platform)?;
    let initial_balance = get(conn, DEFAULT_PORTFOLIO_ID)?
        .map(|p| p.initial_balance)
        .unwrap_or(0.0);

    let pnls: Vec<f64> = closed.iter().filter_map(|p| p.pnl_usdt).collect();
    let timed: Vec<(i64, f64)> = closed
        .iter()
        .map(|p| (p.closed_at.unwrap_or(p.opened_at), p.pnl_usdt.unwrap_or(0.0)))
        .collect();

    Ok(PortfolioAnalysis {
        monte_carlo: risk_math::monte_carlo(
            &pnls,
            initial_balance,
            REPORT_MC_SIMULATIONS,
            &mut rand::thread_rng(),
        ),
        walk_forward: risk_math::walk_forward(&pnls, 4, 0.7),
        equity: risk_math::equity_curve(&timed, initial_balance),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::{Side, SimSource, SimStatus};

    fn cfg() -> SimulationConfig {
        SimulationConfig::default()
    }

    fn closed_sim(id: &str, pnl: f64, commission: f64, closed_at: i64) -> sim::SimulatedPosition {
        sim::SimulatedPosition {
            id: id.to_string(),
            portfolio_id: Some(DEFAULT_PORTFOLIO_ID.to_string()),
            platform: "binance".into(),
            symbol: "BTCUSDT".into(),
            direction: Side::Long,
            status: SimStatus::Closed,
            leverage: 10.0,
            margin_notional: 100.0,
            position_notional: 1_000.0,
            entry_price: 100.0,
            exit_price: Some(101.0),
            effective_entry_price: None,
            effective_exit_price: None,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_pct: None,
            trailing_stop_trigger: None,
            slippage_bps: 10.0,
            commission_bps: 4.0,
            total_commission_usdt: Some(commission),
            pnl_usdt: Some(pnl),
            roi_pct: Some(pnl),
            unrealized_pnl: None,
            last_price: None,
            close_reason: Some("MANUAL".into()),
            close_trigger_lead_id: None,
            source: SimSource::Manual,
            notes: None,
            opened_at: closed_at - 1_000,
            closed_at: Some(closed_at),
        }
    }

    #[test]
    fn default_portfolio_is_created_once() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();

        let first = ensure_default(&conn, "binance", &cfg(), 1_000).unwrap();
        let second = ensure_default(&conn, "binance", &cfg(), 2_000).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.balance, 10_000.0);
    }

    #[test]
    fn balance_round_trip_on_open_and_close() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();
        ensure_default(&conn, "binance", &cfg(), 1_000).unwrap();

        // Open: reserve 100 margin. Close: margin back plus 16.7 net.
        adjust_balance(&conn, DEFAULT_PORTFOLIO_ID, -100.0, 1_100).unwrap();
        adjust_balance(&conn, DEFAULT_PORTFOLIO_ID, 100.0 + 16.7, 1_200).unwrap();

        let p = get(&conn, DEFAULT_PORTFOLIO_ID).unwrap().unwrap();
        assert!((p.balance - 10_016.7).abs() < 1e-9);
    }

    #[test]
    fn metrics_from_closed_positions() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();
        ensure_default(&conn, "binance", &cfg(), 0).unwrap();

        for (i, pnl) in [50.0, 30.0, -40.0, -10.0, 20.0].iter().enumerate() {
            sim::insert_position(&conn, &closed_sim(&format!("s{i}"), *pnl, 1.0, 1_000 + i as i64))
                .unwrap();
        }

        let m = metrics(&conn, "binance").unwrap();
        assert_eq!(m.total_trades, 5);
        assert_eq!(m.wins, 3);
        assert_eq!(m.losses, 2);
        assert!((m.win_rate - 0.6).abs() < 1e-9);
        assert!((m.avg_win - 100.0 / 3.0).abs() < 1e-9);
        assert!((m.avg_loss - 25.0).abs() < 1e-9);
        assert!((m.profit_factor - 2.0).abs() < 1e-9);
        assert_eq!(m.max_consecutive_wins, 2);
        assert_eq!(m.max_consecutive_losses, 2);
        assert!((m.total_commission - 5.0).abs() < 1e-9);
        assert!((m.total_pnl - 50.0).abs() < 1e-9);
        assert!(m.max_drawdown_pct > 0.0);
    }

    #[test]
    fn snapshot_reflects_open_margin_and_unrealized() {
        let db = Store::open_in_memory().unwrap();
        let conn = db.conn();
        ensure_default(&conn, "binance", &cfg(), 0).unwrap();

        let mut open = closed_sim("o1", 0.0, 0.0, 0);
        open.status = SimStatus::Open;
        open.closed_at = None;
        open.pnl_usdt = None;
        open.unrealized_pnl = Some(12.0);
        sim::insert_position(&conn, &open).unwrap();
        adjust_balance(&conn, DEFAULT_PORTFOLIO_ID, -100.0, 10).unwrap();

        let snap = snapshot(&conn, "binance", 500).unwrap().unwrap();
        assert_eq!(snap.open_positions, 1);
        assert!((snap.balance - 9_900.0).abs() < 1e-9);
        assert!((snap.unrealized_pnl - 12.0).abs() < 1e-9);
        assert!((snap.total_value - (9_900.0 + 100.0 + 12.0)).abs() < 1e-9);
    }
}
