// =============================================================================
// Store — durable persistence for every entity in the pipeline
// =============================================================================
//
// SQLite via rusqlite, one connection behind a Mutex. The store is the only
// shared mutable resource in the process: components read current state and
// write successor state, and a per-trader ingest runs inside one transaction
// via `with_tx` so that cancellation or failure rolls back all of that
// trader's writes.
//
// Entity helpers take `&Connection` so they compose both inside a transaction
// (rusqlite's `Transaction` derefs to `Connection`) and against the plain
// handle for read paths.
// =============================================================================

use anyhow::Result;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::normalize::{NormalizedEvent, NormalizedPosition};
use crate::types::{EventType, LifecycleStatus, Side, TraderSegment};
use crate::venue::models::LeadPayload;

// =============================================================================
// Schema
// =============================================================================

const SCHEMA: &str = "
BEGIN;

CREATE TABLE IF NOT EXISTS lead_traders (
    platform            TEXT NOT NULL,
    lead_id             TEXT NOT NULL,
    nickname            TEXT,
    position_show       INTEGER,
    pos_show_updated_at INTEGER,
    first_seen_at       INTEGER NOT NULL,
    last_ingest_at      INTEGER NOT NULL,
    PRIMARY KEY (platform, lead_id)
);

CREATE TABLE IF NOT EXISTS raw_ingests (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    platform        TEXT NOT NULL,
    lead_id         TEXT NOT NULL,
    fetched_at      INTEGER NOT NULL,
    payload         TEXT NOT NULL,
    positions_count INTEGER NOT NULL,
    orders_count    INTEGER NOT NULL,
    time_range      TEXT
);
CREATE INDEX IF NOT EXISTS idx_raw_lead_time
    ON raw_ingests (lead_id, fetched_at DESC);

CREATE TABLE IF NOT EXISTS position_snapshots (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    platform      TEXT NOT NULL,
    lead_id       TEXT NOT NULL,
    fetched_at    INTEGER NOT NULL,
    symbol        TEXT NOT NULL,
    side          TEXT NOT NULL,
    contract_type TEXT,
    leverage      REAL,
    size          REAL,
    entry_price   REAL,
    mark_price    REAL,
    margin_usdt   REAL,
    margin_type   TEXT NOT NULL,
    pnl_usdt      REAL,
    roe_pct       REAL,
    raw           TEXT,
    UNIQUE (lead_id, symbol, side, fetched_at)
);
CREATE INDEX IF NOT EXISTS idx_snap_lead_time
    ON position_snapshots (lead_id, fetched_at DESC);
CREATE INDEX IF NOT EXISTS idx_snap_symbol
    ON position_snapshots (platform, symbol, fetched_at DESC);

CREATE TABLE IF NOT EXISTS events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event_key       TEXT NOT NULL UNIQUE,
    platform        TEXT NOT NULL,
    lead_id         TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    symbol          TEXT NOT NULL,
    price           REAL,
    amount          REAL,
    amount_asset    TEXT,
    realized_pnl    REAL,
    event_time_text TEXT NOT NULL,
    event_time      INTEGER NOT NULL,
    fetched_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_lead_time
    ON events (lead_id, event_time DESC);
CREATE INDEX IF NOT EXISTS idx_events_symbol_time
    ON events (platform, symbol, event_time DESC);

CREATE TABLE IF NOT EXISTS position_states (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    platform             TEXT NOT NULL,
    lead_id              TEXT NOT NULL,
    symbol               TEXT NOT NULL,
    direction            TEXT NOT NULL,
    status               TEXT NOT NULL,
    entry_price          REAL,
    amount               REAL,
    leverage             REAL,
    first_seen_at        INTEGER NOT NULL,
    last_seen_at         INTEGER NOT NULL,
    disappeared_at       INTEGER,
    estimated_open_time  INTEGER NOT NULL,
    estimated_close_time INTEGER,
    open_event_id        TEXT,
    close_event_id       TEXT
);
CREATE INDEX IF NOT EXISTS idx_states_lead
    ON position_states (lead_id, status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_states_one_active
    ON position_states (lead_id, symbol, direction) WHERE status = 'ACTIVE';

CREATE TABLE IF NOT EXISTS symbol_aggregations (
    platform         TEXT NOT NULL,
    symbol           TEXT NOT NULL,
    open_long_count  INTEGER NOT NULL,
    open_short_count INTEGER NOT NULL,
    total_open       INTEGER NOT NULL,
    latest_event_at  INTEGER,
    updated_at       INTEGER NOT NULL,
    PRIMARY KEY (platform, symbol)
);

CREATE TABLE IF NOT EXISTS trader_scores (
    platform      TEXT NOT NULL,
    lead_id       TEXT NOT NULL,
    score_30d     REAL NOT NULL,
    quality_score REAL NOT NULL,
    confidence    TEXT NOT NULL,
    win_rate      REAL NOT NULL,
    sample_size   INTEGER NOT NULL,
    trader_weight REAL NOT NULL,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (platform, lead_id)
);

CREATE TABLE IF NOT EXISTS simulated_positions (
    id                    TEXT PRIMARY KEY,
    portfolio_id          TEXT,
    platform              TEXT NOT NULL,
    symbol                TEXT NOT NULL,
    direction             TEXT NOT NULL,
    status                TEXT NOT NULL,
    leverage              REAL NOT NULL,
    margin_notional       REAL NOT NULL,
    position_notional     REAL NOT NULL,
    entry_price           REAL NOT NULL,
    exit_price            REAL,
    effective_entry_price REAL,
    effective_exit_price  REAL,
    stop_loss_price       REAL,
    take_profit_price     REAL,
    trailing_stop_pct     REAL,
    trailing_stop_trigger REAL,
    slippage_bps          REAL NOT NULL,
    commission_bps        REAL NOT NULL,
    total_commission_usdt REAL,
    pnl_usdt              REAL,
    roi_pct               REAL,
    unrealized_pnl        REAL,
    last_price            REAL,
    close_reason          TEXT,
    close_trigger_lead_id TEXT,
    source                TEXT NOT NULL,
    notes                 TEXT,
    opened_at             INTEGER NOT NULL,
    closed_at             INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sim_status
    ON simulated_positions (platform, status, opened_at DESC);

CREATE TABLE IF NOT EXISTS portfolios (
    id                   TEXT PRIMARY KEY,
    platform             TEXT NOT NULL,
    name                 TEXT NOT NULL,
    initial_balance      REAL NOT NULL,
    balance              REAL NOT NULL,
    max_open_positions   INTEGER NOT NULL,
    max_margin_per_trade REAL NOT NULL,
    created_at           INTEGER NOT NULL,
    updated_at           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS portfolio_snapshots (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    portfolio_id   TEXT NOT NULL,
    at             INTEGER NOT NULL,
    balance        REAL NOT NULL,
    unrealized_pnl REAL NOT NULL,
    realized_pnl   REAL NOT NULL,
    open_positions INTEGER NOT NULL,
    total_value    REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_portfolio_snap
    ON portfolio_snapshots (portfolio_id, at DESC);

CREATE TABLE IF NOT EXISTS auto_trigger_rules (
    platform          TEXT PRIMARY KEY,
    enabled           INTEGER NOT NULL,
    segment           TEXT NOT NULL,
    time_range        TEXT NOT NULL,
    min_traders       INTEGER NOT NULL,
    min_confidence    REAL NOT NULL,
    min_sentiment_abs REAL NOT NULL,
    leverage          REAL NOT NULL,
    margin_notional   REAL NOT NULL,
    max_open          INTEGER NOT NULL,
    cooldown_minutes  INTEGER NOT NULL,
    slippage_bps      REAL NOT NULL,
    commission_bps    REAL NOT NULL,
    stop_loss_pct     REAL,
    take_profit_pct   REAL,
    trailing_stop_pct REAL,
    last_run_at       INTEGER,
    updated_at        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS insights_rules (
    platform   TEXT PRIMARY KEY,
    mode       TEXT NOT NULL,
    time_range TEXT NOT NULL,
    top        INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

COMMIT;
";

// =============================================================================
// Row types
// =============================================================================

/// Identity row for a polled lead trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadTraderRow {
    pub platform: String,
    pub lead_id: String,
    pub nickname: Option<String>,
    pub position_show: Option<bool>,
    pub pos_show_updated_at: Option<i64>,
    pub first_seen_at: i64,
    pub last_ingest_at: i64,
}

impl LeadTraderRow {
    pub fn segment(&self) -> TraderSegment {
        TraderSegment::from_position_show(self.position_show)
    }
}

/// One stored snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub lead_id: String,
    pub fetched_at: i64,
    pub symbol: String,
    pub side: Side,
    pub leverage: Option<f64>,
    pub size: Option<f64>,
    pub entry_price: Option<f64>,
    pub mark_price: Option<f64>,
    pub margin_usdt: Option<f64>,
    pub pnl_usdt: Option<f64>,
}

/// One stored, deduplicated event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub event_key: String,
    pub lead_id: String,
    pub event_type: EventType,
    pub symbol: String,
    pub price: Option<f64>,
    pub amount: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub event_time_text: String,
    pub event_time: i64,
    pub fetched_at: i64,
}

/// One lifecycle record (open/close arc) for a (trader, symbol, direction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionStateRow {
    pub id: i64,
    pub platform: String,
    pub lead_id: String,
    pub symbol: String,
    pub direction: Side,
    pub status: LifecycleStatus,
    pub entry_price: Option<f64>,
    pub amount: Option<f64>,
    pub leverage: Option<f64>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub disappeared_at: Option<i64>,
    pub estimated_open_time: i64,
    pub estimated_close_time: Option<i64>,
    pub open_event_id: Option<String>,
    pub close_event_id: Option<String>,
}

/// Per-symbol open-interest counts across all traders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolAggregationRow {
    pub platform: String,
    pub symbol: String,
    pub open_long_count: i64,
    pub open_short_count: i64,
    pub total_open: i64,
    pub latest_event_at: Option<i64>,
    pub updated_at: i64,
}

/// Quality score and consensus weight for one trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderScoreRow {
    pub platform: String,
    pub lead_id: String,
    pub score_30d: f64,
    pub quality_score: f64,
    pub confidence: String,
    pub win_rate: f64,
    pub sample_size: i64,
    pub trader_weight: f64,
    pub updated_at: i64,
}

// =============================================================================
// Store handle
// =============================================================================

/// Shared handle to the SQLite database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Borrow the connection for a read or a standalone write.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// This is the unit of atomicity for a per-trader ingest: every write in
    /// the closure either lands together or not at all.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

// =============================================================================
// Lead traders
// =============================================================================

/// Create or refresh the identity row for a trader. `pos_show_updated_at`
/// moves only when the flag actually changes.
pub fn upsert_lead_trader(
    conn: &Connection,
    platform: &str,
    lead_id: &str,
    nickname: Option<&str>,
    position_show: Option<bool>,
    now: i64,
) -> Result<()> {
    let existing: Option<Option<bool>> = conn
        .query_row(
            "SELECT position_show FROM lead_traders WHERE platform = ?1 AND lead_id = ?2",
            params![platform, lead_id],
            |row| row.get::<_, Option<bool>>(0),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO lead_traders
                     (platform, lead_id, nickname, position_show, pos_show_updated_at,
                      first_seen_at, last_ingest_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![platform, lead_id, nickname, position_show, position_show.map(|_| now), now],
            )?;
        }
        Some(prev_show) => {
            let show_changed = position_show.is_some() && position_show != prev_show;
            conn.execute(
                "UPDATE lead_traders SET
                     nickname = COALESCE(?3, nickname),
                     position_show = COALESCE(?4, position_show),
                     pos_show_updated_at = CASE WHEN ?5 THEN ?6 ELSE pos_show_updated_at END,
                     last_ingest_at = ?6
                 WHERE platform = ?1 AND lead_id = ?2",
                params![platform, lead_id, nickname, position_show, show_changed, now],
            )?;
        }
    }
    Ok(())
}

pub fn get_lead_trader(
    conn: &Connection,
    platform: &str,
    lead_id: &str,
) -> Result<Option<LeadTraderRow>> {
    let row = conn
        .query_row(
            "SELECT platform, lead_id, nickname, position_show, pos_show_updated_at,
                    first_seen_at, last_ingest_at
             FROM lead_traders WHERE platform = ?1 AND lead_id = ?2",
            params![platform, lead_id],
            map_trader,
        )
        .optional()?;
    Ok(row)
}

pub fn list_traders(conn: &Connection, platform: &str) -> Result<Vec<LeadTraderRow>> {
    let mut stmt = conn.prepare(
        "SELECT platform, lead_id, nickname, position_show, pos_show_updated_at,
                first_seen_at, last_ingest_at
         FROM lead_traders WHERE platform = ?1 ORDER BY lead_id",
    )?;
    let rows = stmt
        .query_map(params![platform], map_trader)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn map_trader(row: &Row<'_>) -> rusqlite::Result<LeadTraderRow> {
    Ok(LeadTraderRow {
        platform: row.get(0)?,
        lead_id: row.get(1)?,
        nickname: row.get(2)?,
        position_show: row.get(3)?,
        pos_show_updated_at: row.get(4)?,
        first_seen_at: row.get(5)?,
        last_ingest_at: row.get(6)?,
    })
}

// =============================================================================
// Raw ingests
// =============================================================================

pub fn insert_raw_ingest(conn: &Connection, platform: &str, payload: &LeadPayload) -> Result<()> {
    let blob = serde_json::to_string(payload)?;
    conn.execute(
        "INSERT INTO raw_ingests
             (platform, lead_id, fetched_at, payload, positions_count, orders_count, time_range)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            platform,
            payload.lead_id,
            payload.fetched_at,
            blob,
            payload.active_positions.len() as i64,
            payload.order_history.all_orders.len() as i64,
            payload.time_range,
        ],
    )?;
    Ok(())
}

// =============================================================================
// Position snapshots
// =============================================================================

/// Insert this cycle's snapshot rows. Duplicates at the same `fetched_at` are
/// discarded by the unique index.
pub fn insert_snapshots(
    conn: &Connection,
    platform: &str,
    lead_id: &str,
    fetched_at: i64,
    positions: &[NormalizedPosition],
) -> Result<usize> {
    let mut inserted = 0usize;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO position_snapshots
             (platform, lead_id, fetched_at, symbol, side, contract_type, leverage, size,
              entry_price, mark_price, margin_usdt, margin_type, pnl_usdt, roe_pct, raw)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )?;
    for p in positions {
        inserted += stmt.execute(params![
            platform,
            lead_id,
            fetched_at,
            p.symbol,
            p.side.as_str(),
            p.contract_type,
            p.leverage,
            p.size,
            p.entry_price,
            p.mark_price,
            p.margin_usdt,
            p.margin_type.as_str(),
            p.pnl_usdt,
            p.roe_pct,
            serde_json::to_string(&p.raw)?,
        ])?;
    }
    Ok(inserted)
}

/// Most recent `fetched_at` that has snapshot rows for this trader.
pub fn latest_fetched_at(conn: &Connection, lead_id: &str) -> Result<Option<i64>> {
    let v = conn
        .query_row(
            "SELECT MAX(fetched_at) FROM position_snapshots WHERE lead_id = ?1",
            params![lead_id],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten();
    Ok(v)
}

/// The snapshot set of one trader at exactly `fetched_at`.
pub fn snapshots_at(conn: &Connection, lead_id: &str, fetched_at: i64) -> Result<Vec<SnapshotRow>> {
    let mut stmt = conn.prepare(
        "SELECT lead_id, fetched_at, symbol, side, leverage, size, entry_price, mark_price,
                margin_usdt, pnl_usdt
         FROM position_snapshots
         WHERE lead_id = ?1 AND fetched_at = ?2
         ORDER BY symbol, side",
    )?;
    let rows = stmt
        .query_map(params![lead_id, fetched_at], map_snapshot)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Mark prices (entry price as fallback) of the most recent `limit` snapshot
/// rows for a symbol, newest first.
pub fn recent_snapshot_prices(
    conn: &Connection,
    platform: &str,
    symbol: &str,
    limit: usize,
) -> Result<Vec<f64>> {
    let mut stmt = conn.prepare(
        "SELECT COALESCE(mark_price, entry_price) FROM position_snapshots
         WHERE platform = ?1 AND symbol = ?2
         ORDER BY fetched_at DESC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![platform, symbol, limit as i64], |row| {
            row.get::<_, Option<f64>>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().flatten().collect())
}

fn map_snapshot(row: &Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        lead_id: row.get(0)?,
        fetched_at: row.get(1)?,
        symbol: row.get(2)?,
        side: parse_side(row.get::<_, String>(3)?)?,
        leverage: row.get(4)?,
        size: row.get(5)?,
        entry_price: row.get(6)?,
        mark_price: row.get(7)?,
        margin_usdt: row.get(8)?,
        pnl_usdt: row.get(9)?,
    })
}

// =============================================================================
// Events
// =============================================================================

/// Outcome of inserting one cycle's normalised events.
#[derive(Debug, Default)]
pub struct EventInsertOutcome {
    /// Events that were actually new this cycle, chronological.
    pub fresh: Vec<NormalizedEvent>,
    /// Duplicates silently dropped by the unique key.
    pub duplicates: usize,
}

/// Insert events with skip-on-conflict semantics on `event_key`. Re-ingesting
/// the same payload inserts zero rows.
pub fn insert_events(
    conn: &Connection,
    platform: &str,
    lead_id: &str,
    events: &[NormalizedEvent],
) -> Result<EventInsertOutcome> {
    let mut out = EventInsertOutcome::default();
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO events
             (event_key, platform, lead_id, event_type, symbol, price, amount, amount_asset,
              realized_pnl, event_time_text, event_time, fetched_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for e in events {
        let n = stmt.execute(params![
            e.event_key,
            platform,
            lead_id,
            e.event_type.as_str(),
            e.symbol,
            e.price,
            e.amount,
            e.amount_asset,
            e.realized_pnl,
            e.event_time_text,
            e.event_time,
            e.fetched_at,
        ])?;
        if n == 1 {
            out.fresh.push(e.clone());
        } else {
            out.duplicates += 1;
        }
    }
    Ok(out)
}

pub fn count_events(conn: &Connection, lead_id: &str) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE lead_id = ?1",
        params![lead_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Find an OPEN event for (trader, symbol, side) in `[since, until]`, newest
/// first. Used by the visible tracker for open-time refinement.
pub fn find_open_event(
    conn: &Connection,
    lead_id: &str,
    symbol: &str,
    side: Side,
    since: i64,
    until: i64,
) -> Result<Option<(String, i64)>> {
    let row = conn
        .query_row(
            "SELECT event_key, event_time FROM events
             WHERE lead_id = ?1 AND symbol = ?2 AND event_type = ?3
               AND event_time >= ?4 AND event_time <= ?5
             ORDER BY event_time DESC LIMIT 1",
            params![
                lead_id,
                symbol,
                EventType::open_for(side).as_str(),
                since,
                until
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row)
}

/// Events newer than `since`, optionally filtered by symbol, newest first.
pub fn events_since(
    conn: &Connection,
    platform: &str,
    symbol: Option<&str>,
    since: i64,
    limit: usize,
) -> Result<Vec<EventRow>> {
    let mut rows = Vec::new();
    match symbol {
        Some(sym) => {
            let mut stmt = conn.prepare(
                "SELECT event_key, lead_id, event_type, symbol, price, amount, realized_pnl,
                        event_time_text, event_time, fetched_at
                 FROM events
                 WHERE platform = ?1 AND symbol = ?2 AND event_time >= ?3
                 ORDER BY event_time DESC LIMIT ?4",
            )?;
            let mapped = stmt.query_map(params![platform, sym, since, limit as i64], map_event)?;
            for r in mapped {
                rows.push(r?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT event_key, lead_id, event_type, symbol, price, amount, realized_pnl,
                        event_time_text, event_time, fetched_at
                 FROM events
                 WHERE platform = ?1 AND event_time >= ?2
                 ORDER BY event_time DESC LIMIT ?3",
            )?;
            let mapped = stmt.query_map(params![platform, since, limit as i64], map_event)?;
            for r in mapped {
                rows.push(r?);
            }
        }
    }
    Ok(rows)
}

/// Price of the most recent event carrying one, for the reference-price
/// fallback.
pub fn latest_event_price(conn: &Connection, platform: &str, symbol: &str) -> Result<Option<f64>> {
    let v = conn
        .query_row(
            "SELECT price FROM events
             WHERE platform = ?1 AND symbol = ?2 AND price IS NOT NULL
             ORDER BY event_time DESC LIMIT 1",
            params![platform, symbol],
            |row| row.get::<_, Option<f64>>(0),
        )
        .optional()?
        .flatten();
    Ok(v)
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        event_key: row.get(0)?,
        lead_id: row.get(1)?,
        event_type: EventType::parse(&row.get::<_, String>(2)?),
        symbol: row.get(3)?,
        price: row.get(4)?,
        amount: row.get(5)?,
        realized_pnl: row.get(6)?,
        event_time_text: row.get(7)?,
        event_time: row.get(8)?,
        fetched_at: row.get(9)?,
    })
}

// =============================================================================
// Position states
// =============================================================================

/// All ACTIVE lifecycle rows for one trader.
pub fn active_states(conn: &Connection, lead_id: &str) -> Result<Vec<PositionStateRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STATE_COLS} FROM position_states
         WHERE lead_id = ?1 AND status = 'ACTIVE'
         ORDER BY symbol, direction"
    ))?;
    let rows = stmt
        .query_map(params![lead_id], map_state)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Lifecycle rows for one trader, newest arc first.
pub fn states_for_trader(
    conn: &Connection,
    lead_id: &str,
    limit: usize,
) -> Result<Vec<PositionStateRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STATE_COLS} FROM position_states
         WHERE lead_id = ?1 ORDER BY first_seen_at DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![lead_id, limit as i64], map_state)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Recently-touched lifecycle rows across all traders (for the feed).
pub fn recent_states(
    conn: &Connection,
    platform: &str,
    symbol: Option<&str>,
    since: i64,
    limit: usize,
) -> Result<Vec<PositionStateRow>> {
    let mut rows = Vec::new();
    match symbol {
        Some(sym) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STATE_COLS} FROM position_states
                 WHERE platform = ?1 AND symbol = ?2 AND last_seen_at >= ?3
                 ORDER BY last_seen_at DESC LIMIT ?4"
            ))?;
            let mapped = stmt.query_map(params![platform, sym, since, limit as i64], map_state)?;
            for r in mapped {
                rows.push(r?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STATE_COLS} FROM position_states
                 WHERE platform = ?1 AND last_seen_at >= ?2
                 ORDER BY last_seen_at DESC LIMIT ?3"
            ))?;
            let mapped = stmt.query_map(params![platform, since, limit as i64], map_state)?;
            for r in mapped {
                rows.push(r?);
            }
        }
    }
    Ok(rows)
}

const STATE_COLS: &str = "id, platform, lead_id, symbol, direction, status, entry_price, amount, \
                          leverage, first_seen_at, last_seen_at, disappeared_at, \
                          estimated_open_time, estimated_close_time, open_event_id, close_event_id";

pub(crate) fn map_state(row: &Row<'_>) -> rusqlite::Result<PositionStateRow> {
    let status_text: String = row.get(5)?;
    Ok(PositionStateRow {
        id: row.get(0)?,
        platform: row.get(1)?,
        lead_id: row.get(2)?,
        symbol: row.get(3)?,
        direction: parse_side(row.get::<_, String>(4)?)?,
        status: LifecycleStatus::parse(&status_text).ok_or_else(|| bad_text(&status_text))?,
        entry_price: row.get(6)?,
        amount: row.get(7)?,
        leverage: row.get(8)?,
        first_seen_at: row.get(9)?,
        last_seen_at: row.get(10)?,
        disappeared_at: row.get(11)?,
        estimated_open_time: row.get(12)?,
        estimated_close_time: row.get(13)?,
        open_event_id: row.get(14)?,
        close_event_id: row.get(15)?,
    })
}

// =============================================================================
// Aggregations & scores
// =============================================================================

pub fn symbol_aggregations(conn: &Connection, platform: &str) -> Result<Vec<SymbolAggregationRow>> {
    let mut stmt = conn.prepare(
        "SELECT platform, symbol, open_long_count, open_short_count, total_open,
                latest_event_at, updated_at
         FROM symbol_aggregations WHERE platform = ?1 ORDER BY total_open DESC, symbol",
    )?;
    let rows = stmt
        .query_map(params![platform], |row| {
            Ok(SymbolAggregationRow {
                platform: row.get(0)?,
                symbol: row.get(1)?,
                open_long_count: row.get(2)?,
                open_short_count: row.get(3)?,
                total_open: row.get(4)?,
                latest_event_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn trader_scores(conn: &Connection, platform: &str) -> Result<Vec<TraderScoreRow>> {
    let mut stmt = conn.prepare(
        "SELECT platform, lead_id, score_30d, quality_score, confidence, win_rate,
                sample_size, trader_weight, updated_at
         FROM trader_scores WHERE platform = ?1",
    )?;
    let rows = stmt
        .query_map(params![platform], map_score)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_trader_score(
    conn: &Connection,
    platform: &str,
    lead_id: &str,
) -> Result<Option<TraderScoreRow>> {
    let row = conn
        .query_row(
            "SELECT platform, lead_id, score_30d, quality_score, confidence, win_rate,
                    sample_size, trader_weight, updated_at
             FROM trader_scores WHERE platform = ?1 AND lead_id = ?2",
            params![platform, lead_id],
            map_score,
        )
        .optional()?;
    Ok(row)
}

fn map_score(row: &Row<'_>) -> rusqlite::Result<TraderScoreRow> {
    Ok(TraderScoreRow {
        platform: row.get(0)?,
        lead_id: row.get(1)?,
        score_30d: row.get(2)?,
        quality_score: row.get(3)?,
        confidence: row.get(4)?,
        win_rate: row.get(5)?,
        sample_size: row.get(6)?,
        trader_weight: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// =============================================================================
// Internal helpers
// =============================================================================

fn parse_side(s: String) -> rusqlite::Result<Side> {
    Side::parse(&s).ok_or_else(|| bad_text(&s))
}

fn bad_text(s: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unrecognised stored value: {s}").into(),
    )
}
