// =============================================================================
// Simulation layer — paper positions driven by consensus and reference prices
// =============================================================================
//
// `engine` owns open/close/reconcile, the auto-trigger rule, and the
// backtest; `monitor` evaluates stop-loss / take-profit / trailing stops each
// cycle; `portfolio` tracks the simulated balance and trade metrics.
// =============================================================================

pub mod engine;
pub mod monitor;
pub mod portfolio;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::types::{Side, SimSource, SimStatus};

/// Portfolio every simulation belongs to unless told otherwise.
pub const DEFAULT_PORTFOLIO_ID: &str = "default";

/// A simulated (paper) position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedPosition {
    pub id: String,
    pub portfolio_id: Option<String>,
    pub platform: String,
    pub symbol: String,
    pub direction: Side,
    pub status: SimStatus,
    pub leverage: f64,
    pub margin_notional: f64,
    /// margin_notional * leverage.
    pub position_notional: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub effective_entry_price: Option<f64>,
    pub effective_exit_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    /// Trailing distance in percent of the peak/trough.
    pub trailing_stop_pct: Option<f64>,
    /// Current trailing trigger price; moves monotonically in the trade's
    /// favour.
    pub trailing_stop_trigger: Option<f64>,
    pub slippage_bps: f64,
    pub commission_bps: f64,
    pub total_commission_usdt: Option<f64>,
    pub pnl_usdt: Option<f64>,
    pub roi_pct: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub last_price: Option<f64>,
    pub close_reason: Option<String>,
    pub close_trigger_lead_id: Option<String>,
    pub source: SimSource,
    pub notes: Option<String>,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

const SIM_COLS: &str = "id, portfolio_id, platform, symbol, direction, status, leverage, \
                        margin_notional, position_notional, entry_price, exit_price, \
                        effective_entry_price, effective_exit_price, stop_loss_price, \
                        take_profit_price, trailing_stop_pct, trailing_stop_trigger, \
                        slippage_bps, commission_bps, total_commission_usdt, pnl_usdt, roi_pct, \
                        unrealized_pnl, last_price, close_reason, close_trigger_lead_id, source, \
                        notes, opened_at, closed_at";

pub fn insert_position(conn: &Connection, p: &SimulatedPosition) -> Result<()> {
    conn.execute(
        "INSERT INTO simulated_positions
             (id, portfolio_id, platform, symbol, direction, status, leverage, margin_notional,
              position_notional, entry_price, exit_price, effective_entry_price,
              effective_exit_price, stop_loss_price, take_profit_price, trailing_stop_pct,
              trailing_stop_trigger, slippage_bps, commission_bps, total_commission_usdt,
              pnl_usdt, roi_pct, unrealized_pnl, last_price, close_reason,
              close_trigger_lead_id, source, notes, opened_at, closed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
        params![
            p.id,
            p.portfolio_id,
            p.platform,
            p.symbol,
            p.direction.as_str(),
            p.status.as_str(),
            p.leverage,
            p.margin_notional,
            p.position_notional,
            p.entry_price,
            p.exit_price,
            p.effective_entry_price,
            p.effective_exit_price,
            p.stop_loss_price,
            p.take_profit_price,
            p.trailing_stop_pct,
            p.trailing_stop_trigger,
            p.slippage_bps,
            p.commission_bps,
            p.total_commission_usdt,
            p.pnl_usdt,
            p.roi_pct,
            p.unrealized_pnl,
            p.last_price,
            p.close_reason,
            p.close_trigger_lead_id,
            p.source.as_str(),
            p.notes,
            p.opened_at,
            p.closed_at,
        ],
    )?;
    Ok(())
}

pub fn get_position(conn: &Connection, id: &str) -> Result<Option<SimulatedPosition>> {
    let row = conn
        .query_row(
            &format!("SELECT {SIM_COLS} FROM simulated_positions WHERE id = ?1"),
            params![id],
            map_sim,
        )
        .optional()?;
    Ok(row)
}

/// All OPEN simulations, newest first.
pub fn open_positions(conn: &Connection, platform: &str) -> Result<Vec<SimulatedPosition>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SIM_COLS} FROM simulated_positions
         WHERE platform = ?1 AND status = 'OPEN'
         ORDER BY opened_at DESC"
    ))?;
    let rows = stmt
        .query_map(params![platform], map_sim)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// All CLOSED simulations ordered by close time (metrics are computed in this
/// order).
pub fn closed_positions(conn: &Connection, platform: &str) -> Result<Vec<SimulatedPosition>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SIM_COLS} FROM simulated_positions
         WHERE platform = ?1 AND status = 'CLOSED'
         ORDER BY closed_at ASC"
    ))?;
    let rows = stmt
        .query_map(params![platform], map_sim)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_positions(
    conn: &Connection,
    platform: &str,
    limit: usize,
) -> Result<Vec<SimulatedPosition>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SIM_COLS} FROM simulated_positions
         WHERE platform = ?1
         ORDER BY opened_at DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![platform, limit as i64], map_sim)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Persist the fields a close mutates.
pub fn update_closed(conn: &Connection, p: &SimulatedPosition) -> Result<()> {
    conn.execute(
        "UPDATE simulated_positions SET
             status = ?2, exit_price = ?3, effective_exit_price = ?4,
             total_commission_usdt = ?5, pnl_usdt = ?6, roi_pct = ?7,
             unrealized_pnl = NULL, close_reason = ?8, close_trigger_lead_id = ?9,
             closed_at = ?10
         WHERE id = ?1",
        params![
            p.id,
            p.status.as_str(),
            p.exit_price,
            p.effective_exit_price,
            p.total_commission_usdt,
            p.pnl_usdt,
            p.roi_pct,
            p.close_reason,
            p.close_trigger_lead_id,
            p.closed_at,
        ],
    )?;
    Ok(())
}

/// Refresh mark-to-market fields without any state transition.
pub fn update_reconcile(
    conn: &Connection,
    id: &str,
    unrealized_pnl: f64,
    last_price: f64,
) -> Result<()> {
    conn.execute(
        "UPDATE simulated_positions SET unrealized_pnl = ?2, last_price = ?3 WHERE id = ?1",
        params![id, unrealized_pnl, last_price],
    )?;
    Ok(())
}

/// Move the trailing trigger (monotone; the caller guarantees direction).
pub fn update_trailing_trigger(conn: &Connection, id: &str, trigger: f64) -> Result<()> {
    conn.execute(
        "UPDATE simulated_positions SET trailing_stop_trigger = ?2 WHERE id = ?1",
        params![id, trigger],
    )?;
    Ok(())
}

fn map_sim(row: &Row<'_>) -> rusqlite::Result<SimulatedPosition> {
    let direction: String = row.get(4)?;
    let status: String = row.get(5)?;
    let source: String = row.get(26)?;
    let bad = |s: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unrecognised stored value: {s}").into(),
        )
    };
    Ok(SimulatedPosition {
        id: row.get(0)?,
        portfolio_id: row.get(1)?,
        platform: row.get(2)?,
        symbol: row.get(3)?,
        direction: Side::parse(&direction).ok_or_else(|| bad(&direction))?,
        status: SimStatus::parse(&status).ok_or_else(|| bad(&status))?,
        leverage: row.get(6)?,
        margin_notional: row.get(7)?,
        position_notional: row.get(8)?,
        entry_price: row.get(9)?,
        exit_price: row.get(10)?,
        effective_entry_price: row.get(11)?,
        effective_exit_price: row.get(12)?,
        stop_loss_price: row.get(13)?,
        take_profit_price: row.get(14)?,
        trailing_stop_pct: row.get(15)?,
        trailing_stop_trigger: row.get(16)?,
        slippage_bps: row.get(17)?,
        commission_bps: row.get(18)?,
        total_commission_usdt: row.get(19)?,
        pnl_usdt: row.get(20)?,
        roi_pct: row.get(21)?,
        unrealized_pnl: row.get(22)?,
        last_price: row.get(23)?,
        close_reason: row.get(24)?,
        close_trigger_lead_id: row.get(25)?,
        source: SimSource::parse(&source).ok_or_else(|| bad(&source))?,
        notes: row.get(27)?,
        opened_at: row.get(28)?,
        closed_at: row.get(29)?,
    })
}
