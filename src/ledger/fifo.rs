// =============================================================================
// FIFO Tax Lots — cost-basis tracking and realized P&L matching
// =============================================================================
//
// A BUY opens one lot. A SELL consumes open lots for that symbol oldest-first
// (ascending purchase date, insertion order as tiebreak), emitting one
// RealizedPnL row per consumed lot. Fees and taxes on the SELL are prorated
// across matched lots by matched-quantity weight, with the final lot taking
// the rounding remainder so the allocations sum exactly.
//
// Invariant: 0 ≤ remaining ≤ original; a lot is closed iff remaining = 0.
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::ledger::events::{parse_rfc3339, LedgerEvent};
use crate::storage::db::{dec_from_sql, dec_to_sql};

// =============================================================================
// Models
// =============================================================================

/// A FIFO-tracked fraction of a BUY.
#[derive(Debug, Clone, Serialize)]
pub struct TaxLot {
    pub lot_id: String,
    pub portfolio_id: String,
    pub symbol: String,
    pub buy_event_id: String,
    pub purchase_date: DateTime<Utc>,
    /// Cost per share including the BUY's fee and tax.
    pub purchase_price: Decimal,
    pub original_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub is_closed: bool,
}

/// One FIFO match produced by a SELL.
#[derive(Debug, Clone, Serialize)]
pub struct RealizedPnL {
    pub id: String,
    pub portfolio_id: String,
    pub symbol: String,
    pub buy_event_id: String,
    pub sell_event_id: String,
    pub quantity: Decimal,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub allocated_fees_taxes: Decimal,
    pub realized_pnl: Decimal,
    pub holding_days: i64,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Lot lifecycle
// =============================================================================

/// Open a lot for a BUY event. The per-share price folds the BUY's fee and
/// tax into the cost basis: `total_amount / quantity`.
pub(crate) fn open_lot(conn: &Connection, event: &LedgerEvent) -> Result<(), CoreError> {
    let purchase_price = event.total_amount / event.quantity;

    conn.execute(
        "INSERT INTO tax_lots
            (lot_id, portfolio_id, symbol, buy_event_id, purchase_date,
             purchase_price, original_quantity, remaining_quantity, is_closed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        params![
            Uuid::new_v4().to_string(),
            event.portfolio_id,
            event.symbol,
            event.event_id,
            event.occurred_at.to_rfc3339(),
            dec_to_sql(&purchase_price),
            dec_to_sql(&event.quantity),
            dec_to_sql(&event.quantity),
        ],
    )?;
    Ok(())
}

/// Load open lots for (portfolio, symbol), oldest first.
fn open_lots(
    conn: &Connection,
    portfolio_id: &str,
    symbol: &str,
) -> Result<Vec<TaxLot>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT lot_id, portfolio_id, symbol, buy_event_id, purchase_date,
                purchase_price, original_quantity, remaining_quantity, is_closed
         FROM tax_lots
         WHERE portfolio_id = ?1 AND symbol = ?2 AND is_closed = 0
         ORDER BY purchase_date ASC, rowid ASC",
    )?;

    let lots = stmt
        .query_map(params![portfolio_id, symbol], map_lot_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(lots)
}

fn map_lot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaxLot> {
    let purchase_date: String = row.get(4)?;
    let purchase_price: String = row.get(5)?;
    let original: String = row.get(6)?;
    let remaining: String = row.get(7)?;

    Ok(TaxLot {
        lot_id: row.get(0)?,
        portfolio_id: row.get(1)?,
        symbol: row.get(2)?,
        buy_event_id: row.get(3)?,
        purchase_date: parse_rfc3339(4, &purchase_date)?,
        purchase_price: dec_from_sql(5, &purchase_price)?,
        original_quantity: dec_from_sql(6, &original)?,
        remaining_quantity: dec_from_sql(7, &remaining)?,
        is_closed: row.get::<_, i64>(8)? != 0,
    })
}

/// Consume open lots against a SELL event and persist the realized matches.
///
/// Fails with `Validation` — before touching any row — when the SELL
/// quantity exceeds the sum of open-lot remainders.
pub(crate) fn consume_lots(
    conn: &Connection,
    sell: &LedgerEvent,
) -> Result<Vec<RealizedPnL>, CoreError> {
    let lots = open_lots(conn, &sell.portfolio_id, &sell.symbol)?;

    let available: Decimal = lots.iter().map(|l| l.remaining_quantity).sum();
    if sell.quantity > available {
        return Err(CoreError::validation(format!(
            "sell quantity {} exceeds open lots ({available}) for {}",
            sell.quantity, sell.symbol
        )));
    }

    let total_costs = sell.fee + sell.tax;
    let mut left = sell.quantity;
    let mut allocated_so_far = Decimal::ZERO;
    let mut matches = Vec::new();

    for lot in &lots {
        if left.is_zero() {
            break;
        }

        let matched = lot.remaining_quantity.min(left);
        left -= matched;

        // Prorate fees/taxes by matched-quantity weight; the final match
        // absorbs the rounding remainder so the sum is exact.
        let allocated = if left.is_zero() {
            total_costs - allocated_so_far
        } else {
            (total_costs * matched / sell.quantity).round_dp(4)
        };
        allocated_so_far += allocated;

        let realized = (sell.price - lot.purchase_price) * matched - allocated;
        let holding_days = (sell.occurred_at.date_naive() - lot.purchase_date.date_naive())
            .num_days();

        let new_remaining = lot.remaining_quantity - matched;
        conn.execute(
            "UPDATE tax_lots SET remaining_quantity = ?1, is_closed = ?2 WHERE lot_id = ?3",
            params![
                dec_to_sql(&new_remaining),
                new_remaining.is_zero() as i64,
                lot.lot_id
            ],
        )?;

        let row = RealizedPnL {
            id: Uuid::new_v4().to_string(),
            portfolio_id: sell.portfolio_id.clone(),
            symbol: sell.symbol.clone(),
            buy_event_id: lot.buy_event_id.clone(),
            sell_event_id: sell.event_id.clone(),
            quantity: matched,
            buy_price: lot.purchase_price,
            sell_price: sell.price,
            allocated_fees_taxes: allocated,
            realized_pnl: realized,
            holding_days,
            created_at: sell.recorded_at,
        };
        insert_realized(conn, &row)?;

        debug!(
            lot_id = %lot.lot_id,
            matched = %matched,
            realized = %realized,
            "FIFO lot consumed"
        );
        matches.push(row);
    }

    Ok(matches)
}

/// Apply a SPLIT to open lots: quantities multiply by `ratio`, per-share
/// prices divide by it, so each lot's cost is preserved.
pub(crate) fn apply_split(
    conn: &Connection,
    portfolio_id: &str,
    symbol: &str,
    ratio: Decimal,
) -> Result<(), CoreError> {
    if ratio <= Decimal::ZERO {
        return Err(CoreError::validation("split ratio must be positive"));
    }

    let lots = open_lots(conn, portfolio_id, symbol)?;
    for lot in &lots {
        conn.execute(
            "UPDATE tax_lots
             SET original_quantity = ?1, remaining_quantity = ?2, purchase_price = ?3
             WHERE lot_id = ?4",
            params![
                dec_to_sql(&(lot.original_quantity * ratio)),
                dec_to_sql(&(lot.remaining_quantity * ratio)),
                dec_to_sql(&(lot.purchase_price / ratio)),
                lot.lot_id
            ],
        )?;
    }
    Ok(())
}

/// Sum of open-lot remainders for (portfolio, symbol). Used by the projection
/// invariant check and by tests.
pub(crate) fn open_quantity(
    conn: &Connection,
    portfolio_id: &str,
    symbol: &str,
) -> Result<Decimal, CoreError> {
    let lots = open_lots(conn, portfolio_id, symbol)?;
    Ok(lots.iter().map(|l| l.remaining_quantity).sum())
}

// =============================================================================
// Realized P&L rows
// =============================================================================

fn insert_realized(conn: &Connection, row: &RealizedPnL) -> Result<(), CoreError> {
    conn.execute(
        "INSERT INTO realized_pnl
            (id, portfolio_id, symbol, buy_event_id, sell_event_id, quantity,
             buy_price, sell_price, allocated_fees_taxes, realized_pnl,
             holding_days, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            row.id,
            row.portfolio_id,
            row.symbol,
            row.buy_event_id,
            row.sell_event_id,
            dec_to_sql(&row.quantity),
            dec_to_sql(&row.buy_price),
            dec_to_sql(&row.sell_price),
            dec_to_sql(&row.allocated_fees_taxes),
            dec_to_sql(&row.realized_pnl),
            row.holding_days,
            row.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub(crate) fn list_realized(
    conn: &Connection,
    portfolio_id: &str,
    symbol: Option<&str>,
) -> Result<Vec<RealizedPnL>, CoreError> {
    let sql = "SELECT id, portfolio_id, symbol, buy_event_id, sell_event_id, quantity,
                      buy_price, sell_price, allocated_fees_taxes, realized_pnl,
                      holding_days, created_at
               FROM realized_pnl
               WHERE portfolio_id = ?1 AND (?2 IS NULL OR symbol = ?2)
               ORDER BY created_at DESC";

    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![portfolio_id, symbol], map_realized_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn map_realized_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RealizedPnL> {
    let quantity: String = row.get(5)?;
    let buy_price: String = row.get(6)?;
    let sell_price: String = row.get(7)?;
    let allocated: String = row.get(8)?;
    let realized: String = row.get(9)?;
    let created_at: String = row.get(11)?;

    Ok(RealizedPnL {
        id: row.get(0)?,
        portfolio_id: row.get(1)?,
        symbol: row.get(2)?,
        buy_event_id: row.get(3)?,
        sell_event_id: row.get(4)?,
        quantity: dec_from_sql(5, &quantity)?,
        buy_price: dec_from_sql(6, &buy_price)?,
        sell_price: dec_from_sql(7, &sell_price)?,
        allocated_fees_taxes: dec_from_sql(8, &allocated)?,
        realized_pnl: dec_from_sql(9, &realized)?,
        holding_days: row.get(10)?,
        created_at: parse_rfc3339(11, &created_at)?,
    })
}
