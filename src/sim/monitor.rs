// =============================================================================
// Position Monitor — SL / TP / trailing-stop evaluation per cycle
// =============================================================================
//
// Runs once at the end of every scheduler cycle over every OPEN simulation
// that carries an exit rule. Evaluation order when several triggers hold in
// the same tick: stop-loss, then take-profit, then trailing stop. A trigger
// closes at the trigger price, not the observed price, with the execution
// cost model applied.
//
// The trailing stop is stateless across restarts: the trigger price persists
// on the position row and only ever moves in the trade's favour.
// =============================================================================

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::sim::{self, engine};
use crate::types::{CloseReason, Side};

/// What one monitor pass did.
#[derive(Debug, Default, Serialize)]
pub struct MonitorOutcome {
    pub evaluated: usize,
    /// (position id, close reason) pairs.
    pub closed: Vec<(String, String)>,
}

/// Evaluate every OPEN simulation with an exit rule against the current
/// reference price.
pub fn run_once(conn: &Connection, platform: &str, now: i64) -> Result<MonitorOutcome> {
    let mut outcome = MonitorOutcome::default();

    for position in sim::open_positions(conn, platform)? {
        let has_exit_rule = position.stop_loss_price.is_some()
            || position.take_profit_price.is_some()
            || position.trailing_stop_pct.is_some();
        if !has_exit_rule {
            continue;
        }

        let Some(price) = engine::reference_price(conn, platform, &position.symbol)? else {
            debug!(
                id = %position.id,
                symbol = %position.symbol,
                "no reference price, skipping exit evaluation"
            );
            continue;
        };
        outcome.evaluated += 1;

        let is_long = position.direction == Side::Long;

        // 1. Stop-loss.
        if let Some(sl) = position.stop_loss_price {
            let hit = if is_long { price <= sl } else { price >= sl };
            if hit {
                close(conn, platform, &position.id, CloseReason::StopLoss, sl, now, &mut outcome)?;
                continue;
            }
        }

        // 2. Take-profit.
        if let Some(tp) = position.take_profit_price {
            let hit = if is_long { price >= tp } else { price <= tp };
            if hit {
                close(conn, platform, &position.id, CloseReason::TakeProfit, tp, now, &mut outcome)?;
                continue;
            }
        }

        // 3. Trailing stop: ratchet the trigger toward the peak (long) or
        //    trough (short), then test it.
        if let Some(pct) = position.trailing_stop_pct {
            let candidate = if is_long {
                price * (1.0 - pct / 100.0)
            } else {
                price * (1.0 + pct / 100.0)
            };

            let trigger = match position.trailing_stop_trigger {
                Some(current) => {
                    let improved = if is_long {
                        candidate > current
                    } else {
                        candidate < current
                    };
                    if improved {
                        sim::update_trailing_trigger(conn, &position.id, candidate)?;
                        candidate
                    } else {
                        current
                    }
                }
                None => {
                    sim::update_trailing_trigger(conn, &position.id, candidate)?;
                    candidate
                }
            };

            let hit = if is_long { price <= trigger } else { price >= trigger };
            // A freshly-ratcheted trigger sits strictly on the losing side of
            // the price, so a hit here always comes from an earlier trigger.
            if hit {
                close(
                    conn,
                    platform,
                    &position.id,
                    CloseReason::TrailingStop,
                    trigger,
                    now,
                    &mut outcome,
                )?;
            }
        }
    }

    if !outcome.closed.is_empty() {
        info!(closed = outcome.closed.len(), "position monitor closed simulations");
    }
    Ok(outcome)
}

fn close(
    conn: &Connection,
    platform: &str,
    id: &str,
    reason: CloseReason,
    trigger_price: f64,
    now: i64,
    outcome: &mut MonitorOutcome,
) -> Result<()> {
    engine::close_position(conn, platform, id, reason, Some(trigger_price), None, now)?;
    outcome.closed.push((id.to_string(), reason.as_str().to_string()));
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NormalizedPosition;
    use crate::runtime_config::SimulationConfig;
    use crate::sim::engine::OpenRequest;
    use crate::store::{self, Store};
    use crate::types::{MarginType, SimSource, SimStatus};
    use serde_json::json;

    fn set_reference_price(db: &Store, symbol: &str, price: f64, fetched_at: i64) {
        let conn = db.conn();
        // A fresh snapshot shifts the rolling average; use a dedicated lead
        // with a replaceable single row to pin the price exactly.
        conn.execute(
            "DELETE FROM position_snapshots WHERE lead_id = 'PRICE'",
            [],
        )
        .unwrap();
        store::insert_snapshots(
            &conn,
            "binance",
            "PRICE",
            fetched_at,
            &[NormalizedPosition {
                symbol: symbol.to_string(),
                side: crate::types::Side::Long,
                contract_type: None,
                leverage: Some(1.0),
                size: Some(1.0),
                entry_price: Some(price),
                mark_price: Some(price),
                margin_usdt: None,
                margin_type: MarginType::Cross,
                pnl_usdt: None,
                roe_pct: None,
                raw: json!({}),
            }],
        )
        .unwrap();
    }

    fn open_sim(
        db: &Store,
        direction: crate::types::Side,
        sl: Option<f64>,
        tp: Option<f64>,
        trail_pct: Option<f64>,
    ) -> String {
        let conn = db.conn();
        let req = OpenRequest {
            symbol: "BTCUSDT".into(),
            direction,
            leverage: 10.0,
            margin_notional: 100.0,
            entry_price: Some(100.0),
            stop_loss_price: sl,
            take_profit_price: tp,
            trailing_stop_pct: trail_pct,
            slippage_bps: Some(0.0),
            commission_bps: Some(0.0),
            notes: None,
        };
        engine::open_position(
            &conn,
            "binance",
            &req,
            &SimulationConfig::default(),
            SimSource::Manual,
            1_000,
        )
        .unwrap()
        .id
    }

    #[test]
    fn stop_loss_closes_long_at_the_stop_price() {
        let db = Store::open_in_memory().unwrap();
        let id = open_sim(&db, crate::types::Side::Long, Some(95.0), None, None);

        set_reference_price(&db, "BTCUSDT", 94.0, 2_000);
        let conn = db.conn();
        let out = run_once(&conn, "binance", 3_000).unwrap();
        assert_eq!(out.closed, vec![(id.clone(), "STOP_LOSS".to_string())]);

        let closed = sim::get_position(&conn, &id).unwrap().unwrap();
        assert_eq!(closed.status, SimStatus::Closed);
        // Closed at the trigger price, not the observed price.
        assert_eq!(closed.exit_price, Some(95.0));
    }

    #[test]
    fn take_profit_closes_short_when_price_falls() {
        let db = Store::open_in_memory().unwrap();
        let id = open_sim(&db, crate::types::Side::Short, None, Some(90.0), None);

        set_reference_price(&db, "BTCUSDT", 89.0, 2_000);
        let conn = db.conn();
        let out = run_once(&conn, "binance", 3_000).unwrap();
        assert_eq!(out.closed, vec![(id.clone(), "TAKE_PROFIT".to_string())]);
        let closed = sim::get_position(&conn, &id).unwrap().unwrap();
        assert_eq!(closed.exit_price, Some(90.0));
        assert!(closed.pnl_usdt.unwrap() > 0.0);
    }

    #[test]
    fn stop_loss_takes_precedence_over_take_profit() {
        let db = Store::open_in_memory().unwrap();
        // Degenerate configuration where both could fire at price 94:
        // SL at 95 (long, price below), TP at 94.
        let id = open_sim(&db, crate::types::Side::Long, Some(95.0), Some(94.0), None);

        set_reference_price(&db, "BTCUSDT", 94.0, 2_000);
        let conn = db.conn();
        let out = run_once(&conn, "binance", 3_000).unwrap();
        assert_eq!(out.closed[0].1, "STOP_LOSS");
        let _ = id;
    }

    #[test]
    fn trailing_stop_ratchets_and_fires() {
        let db = Store::open_in_memory().unwrap();
        let id = open_sim(&db, crate::types::Side::Long, None, None, Some(2.0));

        // Price rises to 110: trigger set at 107.8, no exit.
        set_reference_price(&db, "BTCUSDT", 110.0, 2_000);
        {
            let conn = db.conn();
            let out = run_once(&conn, "binance", 3_000).unwrap();
            assert!(out.closed.is_empty());
            let p = sim::get_position(&conn, &id).unwrap().unwrap();
            assert!((p.trailing_stop_trigger.unwrap() - 107.8).abs() < 1e-9);
        }

        // Price slips to 109: trigger must not loosen.
        set_reference_price(&db, "BTCUSDT", 109.0, 4_000);
        {
            let conn = db.conn();
            run_once(&conn, "binance", 5_000).unwrap();
            let p = sim::get_position(&conn, &id).unwrap().unwrap();
            assert!((p.trailing_stop_trigger.unwrap() - 107.8).abs() < 1e-9);
        }

        // Price crosses the trigger: closed at the trigger price.
        set_reference_price(&db, "BTCUSDT", 107.0, 6_000);
        {
            let conn = db.conn();
            let out = run_once(&conn, "binance", 7_000).unwrap();
            assert_eq!(out.closed, vec![(id.clone(), "TRAILING_STOP".to_string())]);
            let p = sim::get_position(&conn, &id).unwrap().unwrap();
            assert_eq!(p.status, SimStatus::Closed);
            assert!((p.exit_price.unwrap() - 107.8).abs() < 1e-9);
        }
    }

    #[test]
    fn positions_without_exit_rules_are_ignored() {
        let db = Store::open_in_memory().unwrap();
        open_sim(&db, crate::types::Side::Long, None, None, None);

        set_reference_price(&db, "BTCUSDT", 50.0, 2_000);
        let conn = db.conn();
        let out = run_once(&conn, "binance", 3_000).unwrap();
        assert_eq!(out.evaluated, 0);
        assert!(out.closed.is_empty());
    }
}
