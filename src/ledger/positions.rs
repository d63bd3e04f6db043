// =============================================================================
// Position Projection — materialized current-holdings view
// =============================================================================
//
// The projection is recomputed deterministically from the full event log for
// the touched (portfolio, symbol) key, inside the same transaction as the
// event insert. Readers only ever see a fully-refreshed row set.
//
// Arithmetic, per key:
//   total_quantity = fold of BUY(+q) / SELL(−q) / SPLIT(×ratio) /
//                    RIGHTS and CORRECTION(+signed payload q)
//   total_cost     = Σ BUY total − Σ SELL total, plus the signed
//                    total_amount of RIGHTS and CORRECTION events
//   avg_cost       = total_cost / total_quantity while quantity > 0
// The row is deleted when total_quantity ≤ 0.
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::errors::CoreError;
use crate::ledger::events::{
    map_event_row, payload_decimal, EventType, LedgerEvent, EVENT_COLUMNS,
};
use crate::storage::db::{dec_from_sql, dec_to_sql};

// =============================================================================
// Models
// =============================================================================

/// Materialized holding for one (portfolio, symbol) key.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub portfolio_id: String,
    pub symbol: String,
    pub total_quantity: Decimal,
    pub total_cost: Decimal,
    pub avg_cost_per_share: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// Mark-to-market view derived from a position snapshot, never recomputed
/// from events.
#[derive(Debug, Clone, Serialize)]
pub struct UnrealizedPnL {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
}

impl UnrealizedPnL {
    pub fn from_position(position: &Position, current_price: Decimal) -> Self {
        let market_value = position.total_quantity * current_price;
        let cost_basis = position.total_cost;
        let unrealized = market_value - cost_basis;
        let pct = if cost_basis.is_zero() {
            Decimal::ZERO
        } else {
            (unrealized / cost_basis * Decimal::ONE_HUNDRED).round_dp(2)
        };

        Self {
            symbol: position.symbol.clone(),
            quantity: position.total_quantity,
            avg_cost: position.avg_cost_per_share,
            current_price,
            market_value,
            cost_basis,
            unrealized_pnl: unrealized,
            unrealized_pnl_pct: pct,
        }
    }
}

// =============================================================================
// Projection refresh
// =============================================================================

/// Recompute the projection for one (portfolio, symbol) from its events and
/// upsert (or delete) the materialized row.
pub(crate) fn refresh(
    conn: &Connection,
    portfolio_id: &str,
    symbol: &str,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM ledger_events
         WHERE portfolio_id = ?1 AND symbol = ?2
         ORDER BY occurred_at ASC, recorded_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let events = stmt
        .query_map(params![portfolio_id, symbol], map_event_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let (quantity, cost) = fold_events(&events);

    if quantity > Decimal::ZERO {
        let avg = (cost / quantity).round_dp(4);
        conn.execute(
            "INSERT INTO positions
                (portfolio_id, symbol, total_quantity, total_cost, avg_cost_per_share, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(portfolio_id, symbol) DO UPDATE SET
                total_quantity = excluded.total_quantity,
                total_cost = excluded.total_cost,
                avg_cost_per_share = excluded.avg_cost_per_share,
                last_updated = excluded.last_updated",
            params![
                portfolio_id,
                symbol,
                dec_to_sql(&quantity),
                dec_to_sql(&cost),
                dec_to_sql(&avg),
                now.to_rfc3339(),
            ],
        )?;
    } else {
        conn.execute(
            "DELETE FROM positions WHERE portfolio_id = ?1 AND symbol = ?2",
            params![portfolio_id, symbol],
        )?;
    }

    Ok(())
}

/// Chronological fold of the event stream into (quantity, cost).
fn fold_events(events: &[LedgerEvent]) -> (Decimal, Decimal) {
    let mut quantity = Decimal::ZERO;
    let mut cost = Decimal::ZERO;

    for event in events {
        match event.event_type {
            EventType::Buy => {
                quantity += event.quantity;
                cost += event.total_amount;
            }
            EventType::Sell => {
                quantity -= event.quantity;
                cost -= event.total_amount;
            }
            EventType::Split => {
                if let Some(ratio) = payload_decimal(event.payload.as_ref(), "ratio") {
                    if ratio > Decimal::ZERO {
                        quantity *= ratio;
                    }
                }
            }
            EventType::Rights | EventType::Correction => {
                // Only the explicit fields move the projection: the payload's
                // signed quantity and the event's signed total_amount.
                if let Some(q) = payload_decimal(event.payload.as_ref(), "quantity") {
                    quantity += q;
                }
                cost += event.total_amount;
            }
            EventType::Dividend => {}
        }
    }

    (quantity, cost)
}

// =============================================================================
// Reads
// =============================================================================

pub(crate) fn get(
    conn: &Connection,
    portfolio_id: &str,
    symbol: &str,
) -> Result<Option<Position>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT portfolio_id, symbol, total_quantity, total_cost, avg_cost_per_share, last_updated
         FROM positions WHERE portfolio_id = ?1 AND symbol = ?2",
    )?;

    let mut rows = stmt.query_map(params![portfolio_id, symbol], map_position_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub(crate) fn list(conn: &Connection, portfolio_id: &str) -> Result<Vec<Position>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT portfolio_id, symbol, total_quantity, total_cost, avg_cost_per_share, last_updated
         FROM positions WHERE portfolio_id = ?1 ORDER BY symbol ASC",
    )?;

    let rows = stmt
        .query_map(params![portfolio_id], map_position_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn map_position_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let quantity: String = row.get(2)?;
    let cost: String = row.get(3)?;
    let avg: String = row.get(4)?;
    let updated: String = row.get(5)?;

    Ok(Position {
        portfolio_id: row.get(0)?,
        symbol: row.get(1)?,
        total_quantity: dec_from_sql(2, &quantity)?,
        total_cost: dec_from_sql(3, &cost)?,
        avg_cost_per_share: dec_from_sql(4, &avg)?,
        last_updated: crate::ledger::events::parse_rfc3339(5, &updated)?,
    })
}
