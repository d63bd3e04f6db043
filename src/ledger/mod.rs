// =============================================================================
// Ledger Store — append-only event log with derived positions and P&L
// =============================================================================
//
// All mutations are transactional: event insert, tax-lot updates, realized
// P&L inserts, and the position-projection refresh succeed or fail together.
// =============================================================================

pub mod events;
pub mod fifo;
pub mod positions;

use chrono::{DateTime, Utc};
use rusqlite::params;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::storage::Database;
use crate::symbol;

pub use events::{EventType, LedgerEvent, RecordEventRequest};
pub use fifo::{RealizedPnL, TaxLot};
pub use positions::{Position, UnrealizedPnL};

// =============================================================================
// Portfolio
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub portfolio_id: String,
    pub user_id: String,
    pub name: String,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePortfolioRequest {
    pub user_id: String,
    pub name: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "TWD".to_string()
}

// =============================================================================
// LedgerStore
// =============================================================================

#[derive(Clone)]
pub struct LedgerStore {
    db: Database,
}

impl LedgerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Portfolios ──────────────────────────────────────────────────────

    pub fn create_portfolio(
        &self,
        req: &CreatePortfolioRequest,
    ) -> Result<Portfolio, CoreError> {
        if req.name.trim().is_empty() {
            return Err(CoreError::validation("portfolio name must not be empty"));
        }

        let portfolio = Portfolio {
            portfolio_id: Uuid::new_v4().to_string(),
            user_id: req.user_id.clone(),
            name: req.name.clone(),
            currency: req.currency.clone(),
            created_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO portfolios (portfolio_id, user_id, name, currency, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    portfolio.portfolio_id,
                    portfolio.user_id,
                    portfolio.name,
                    portfolio.currency,
                    portfolio.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        info!(portfolio_id = %portfolio.portfolio_id, name = %portfolio.name, "portfolio created");
        Ok(portfolio)
    }

    pub fn get_portfolio(&self, portfolio_id: &str) -> Result<Portfolio, CoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT portfolio_id, user_id, name, currency, created_at
                 FROM portfolios WHERE portfolio_id = ?1",
            )?;
            let mut rows = stmt.query_map(params![portfolio_id], |row| {
                let created_at: String = row.get(4)?;
                Ok(Portfolio {
                    portfolio_id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    currency: row.get(3)?,
                    created_at: events::parse_rfc3339(4, &created_at)?,
                })
            })?;

            match rows.next() {
                Some(row) => Ok(row?),
                None => Err(CoreError::not_found(format!(
                    "portfolio {portfolio_id} not found"
                ))),
            }
        })
    }

    // ── Event recording ─────────────────────────────────────────────────

    /// Append an event and refresh all derived state in one transaction.
    pub fn record_event(&self, req: &RecordEventRequest) -> Result<LedgerEvent, CoreError> {
        let validated = events::validate(req)?;

        let event = LedgerEvent {
            event_id: Uuid::new_v4().to_string(),
            portfolio_id: req.portfolio_id.clone(),
            event_type: validated.event_type,
            symbol: validated.symbol,
            quantity: validated.quantity,
            price: validated.price,
            fee: validated.fee,
            tax: validated.tax,
            total_amount: validated.total_amount,
            occurred_at: validated.occurred_at,
            recorded_at: Utc::now(),
            source: validated.source,
            notes: validated.notes,
            payload: validated.payload,
        };

        self.db.with_tx(|tx| {
            // The ledger contract: recording against a missing portfolio is a
            // conflict, not a not-found.
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM portfolios WHERE portfolio_id = ?1",
                params![event.portfolio_id],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Err(CoreError::conflict(format!(
                    "portfolio {} does not exist",
                    event.portfolio_id
                )));
            }

            // SELL over-sale is rejected before any write.
            match event.event_type {
                EventType::Sell => {
                    let matches = fifo::consume_lots(tx, &event)?;
                    events::insert_event(tx, &event)?;
                    info!(
                        event_id = %event.event_id,
                        symbol = %event.symbol,
                        matches = matches.len(),
                        "SELL recorded with FIFO matches"
                    );
                }
                EventType::Buy => {
                    events::insert_event(tx, &event)?;
                    fifo::open_lot(tx, &event)?;
                }
                EventType::Split => {
                    let ratio = events::payload_decimal(event.payload.as_ref(), "ratio")
                        .ok_or_else(|| {
                            CoreError::validation("SPLIT event requires payload.ratio")
                        })?;
                    events::insert_event(tx, &event)?;
                    fifo::apply_split(tx, &event.portfolio_id, &event.symbol, ratio)?;
                }
                EventType::Dividend | EventType::Rights | EventType::Correction => {
                    events::insert_event(tx, &event)?;
                }
            }

            positions::refresh(tx, &event.portfolio_id, &event.symbol, event.recorded_at)?;
            Ok(())
        })?;

        info!(
            event_id = %event.event_id,
            portfolio_id = %event.portfolio_id,
            event_type = %event.event_type,
            symbol = %event.symbol,
            quantity = %event.quantity,
            total_amount = %event.total_amount,
            "ledger event recorded"
        );
        Ok(event)
    }

    // ── Event reads ─────────────────────────────────────────────────────

    /// Newest-first events for a portfolio.
    pub fn list_events(
        &self,
        portfolio_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, CoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM ledger_events
                 WHERE portfolio_id = ?1
                 ORDER BY recorded_at DESC, rowid DESC
                 LIMIT ?2",
                events::EVENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![portfolio_id, limit as i64], events::map_event_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Newest-first events for a portfolio, scoped to one symbol.
    pub fn list_events_by_symbol(
        &self,
        portfolio_id: &str,
        raw_symbol: &str,
    ) -> Result<Vec<LedgerEvent>, CoreError> {
        let sym = symbol::canonicalize(raw_symbol)?;
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM ledger_events
                 WHERE portfolio_id = ?1 AND symbol = ?2
                 ORDER BY recorded_at DESC, rowid DESC",
                events::EVENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![portfolio_id, sym], events::map_event_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ── Positions ───────────────────────────────────────────────────────

    pub fn get_position(
        &self,
        portfolio_id: &str,
        raw_symbol: &str,
    ) -> Result<Position, CoreError> {
        let sym = symbol::canonicalize(raw_symbol)?;
        self.db
            .with_conn(|conn| positions::get(conn, portfolio_id, &sym))?
            .ok_or_else(|| {
                CoreError::not_found(format!("no position in {sym} for {portfolio_id}"))
            })
    }

    pub fn list_positions(&self, portfolio_id: &str) -> Result<Vec<Position>, CoreError> {
        self.db.with_conn(|conn| positions::list(conn, portfolio_id))
    }

    /// Mark-to-market against a caller-supplied price, derived from the
    /// position snapshot.
    pub fn unrealized_pnl(
        &self,
        portfolio_id: &str,
        raw_symbol: &str,
        current_price: Decimal,
    ) -> Result<UnrealizedPnL, CoreError> {
        if current_price < Decimal::ZERO {
            return Err(CoreError::validation("current_price must not be negative"));
        }
        let position = self.get_position(portfolio_id, raw_symbol)?;
        Ok(UnrealizedPnL::from_position(&position, current_price))
    }

    // ── Realized P&L ────────────────────────────────────────────────────

    pub fn list_realized(
        &self,
        portfolio_id: &str,
        raw_symbol: Option<&str>,
    ) -> Result<Vec<RealizedPnL>, CoreError> {
        let sym = match raw_symbol {
            Some(s) => Some(symbol::canonicalize(s)?),
            None => None,
        };
        self.db
            .with_conn(|conn| fifo::list_realized(conn, portfolio_id, sym.as_deref()))
    }

    /// Sum of open-lot remainders; exposed for invariant checks.
    pub fn open_lot_quantity(
        &self,
        portfolio_id: &str,
        raw_symbol: &str,
    ) -> Result<Decimal, CoreError> {
        let sym = symbol::canonicalize(raw_symbol)?;
        self.db
            .with_conn(|conn| fifo::open_quantity(conn, portfolio_id, &sym))
    }
}

// =============================================================================
// Tests — the canonical BUY/BUY/SELL chain and its invariants
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn store() -> (LedgerStore, String) {
        let db = Database::open_in_memory().unwrap();
        let store = LedgerStore::new(db);
        let portfolio = store
            .create_portfolio(&CreatePortfolioRequest {
                user_id: "u1".to_string(),
                name: "growth".to_string(),
                currency: "TWD".to_string(),
            })
            .unwrap();
        (store, portfolio.portfolio_id)
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 5, 30, 0).unwrap()
    }

    fn event_request(
        portfolio_id: &str,
        event_type: &str,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        tax: Decimal,
        day: u32,
    ) -> RecordEventRequest {
        RecordEventRequest {
            portfolio_id: portfolio_id.to_string(),
            event_type: event_type.to_string(),
            symbol: "2330".to_string(),
            quantity,
            price,
            fee,
            tax,
            occurred_at: at(day),
            source: None,
            notes: None,
            payload: None,
        }
    }

    #[test]
    fn first_buy_builds_position() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(1000),
                dec!(580),
                dec!(826.50),
                Decimal::ZERO,
                2,
            ))
            .unwrap();

        let pos = store.get_position(&pid, "2330").unwrap();
        assert_eq!(pos.total_quantity, dec!(1000));
        assert_eq!(pos.total_cost, dec!(580826.50));
        assert_eq!(pos.avg_cost_per_share, dec!(580.8265));
    }

    #[test]
    fn second_buy_averages_in() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(1000),
                dec!(580),
                dec!(826.50),
                Decimal::ZERO,
                2,
            ))
            .unwrap();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(500),
                dec!(590),
                dec!(421),
                Decimal::ZERO,
                3,
            ))
            .unwrap();

        let pos = store.get_position(&pid, "2330").unwrap();
        assert_eq!(pos.total_quantity, dec!(1500));
        // 580826.50 + (500·590 + 421) = 876247.50
        assert_eq!(pos.total_cost, dec!(876247.50));
        assert_eq!(pos.avg_cost_per_share, dec!(584.1650));

        // Two open lots.
        assert_eq!(store.open_lot_quantity(&pid, "2330").unwrap(), dec!(1500));
    }

    #[test]
    fn sell_matches_oldest_lot_first() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(1000),
                dec!(580),
                dec!(826.50),
                Decimal::ZERO,
                2,
            ))
            .unwrap();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(500),
                dec!(590),
                dec!(421),
                Decimal::ZERO,
                3,
            ))
            .unwrap();

        let sell = store
            .record_event(&event_request(
                &pid,
                "SELL",
                dec!(300),
                dec!(600),
                dec!(256.95),
                dec!(540),
                10,
            ))
            .unwrap();
        assert_eq!(sell.total_amount, dec!(179203.05));

        // One realized row against the oldest lot.
        let realized = store.list_realized(&pid, Some("2330")).unwrap();
        assert_eq!(realized.len(), 1);
        let r = &realized[0];
        assert_eq!(r.quantity, dec!(300));
        assert_eq!(r.buy_price, dec!(580.8265));
        assert_eq!(r.sell_price, dec!(600));
        assert_eq!(r.allocated_fees_taxes, dec!(796.95));
        // (600 − 580.8265)·300 − 796.95
        assert_eq!(r.realized_pnl, dec!(4955.10));
        assert_eq!(r.holding_days, 8);

        // Position: 1500 − 300 shares; cost drops by the SELL total.
        let pos = store.get_position(&pid, "2330").unwrap();
        assert_eq!(pos.total_quantity, dec!(1200));
        assert_eq!(pos.total_cost, dec!(876247.50) - dec!(179203.05));

        // First lot partially consumed.
        assert_eq!(store.open_lot_quantity(&pid, "2330").unwrap(), dec!(1200));
    }

    #[test]
    fn sell_spanning_lots_prorates_fees_exactly() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(100),
                dec!(100),
                Decimal::ZERO,
                Decimal::ZERO,
                2,
            ))
            .unwrap();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(100),
                dec!(110),
                Decimal::ZERO,
                Decimal::ZERO,
                3,
            ))
            .unwrap();

        store
            .record_event(&event_request(
                &pid,
                "SELL",
                dec!(150),
                dec!(120),
                dec!(100),
                Decimal::ZERO,
                5,
            ))
            .unwrap();

        let realized = store.list_realized(&pid, Some("2330")).unwrap();
        assert_eq!(realized.len(), 2);

        // Matched quantities cover the SELL exactly.
        let total_matched: Decimal = realized.iter().map(|r| r.quantity).sum();
        assert_eq!(total_matched, dec!(150));

        // Allocations sum back to the SELL's fee+tax with no rounding drift.
        let total_allocated: Decimal =
            realized.iter().map(|r| r.allocated_fees_taxes).sum();
        assert_eq!(total_allocated, dec!(100));
    }

    #[test]
    fn oversell_rejected_without_state_change() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(100),
                dec!(100),
                Decimal::ZERO,
                Decimal::ZERO,
                2,
            ))
            .unwrap();

        let err = store
            .record_event(&event_request(
                &pid,
                "SELL",
                dec!(101),
                dec!(100),
                Decimal::ZERO,
                Decimal::ZERO,
                3,
            ))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        // No event appended, no lot consumed, position unchanged.
        assert_eq!(store.list_events(&pid, 10).unwrap().len(), 1);
        assert_eq!(store.open_lot_quantity(&pid, "2330").unwrap(), dec!(100));
        let pos = store.get_position(&pid, "2330").unwrap();
        assert_eq!(pos.total_quantity, dec!(100));
    }

    #[test]
    fn projection_quantity_matches_open_lots() {
        let (store, pid) = store();
        for (qty, price, day) in [(dec!(300), dec!(50), 2), (dec!(200), dec!(55), 3)] {
            store
                .record_event(&event_request(
                    &pid,
                    "BUY",
                    qty,
                    price,
                    Decimal::ZERO,
                    Decimal::ZERO,
                    day,
                ))
                .unwrap();
        }
        store
            .record_event(&event_request(
                &pid,
                "SELL",
                dec!(350),
                dec!(60),
                Decimal::ZERO,
                Decimal::ZERO,
                8,
            ))
            .unwrap();

        let pos = store.get_position(&pid, "2330").unwrap();
        assert_eq!(
            pos.total_quantity,
            store.open_lot_quantity(&pid, "2330").unwrap()
        );
    }

    #[test]
    fn selling_everything_removes_the_position_row() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(100),
                dec!(100),
                Decimal::ZERO,
                Decimal::ZERO,
                2,
            ))
            .unwrap();
        store
            .record_event(&event_request(
                &pid,
                "SELL",
                dec!(100),
                dec!(110),
                Decimal::ZERO,
                Decimal::ZERO,
                3,
            ))
            .unwrap();

        assert!(matches!(
            store.get_position(&pid, "2330"),
            Err(CoreError::NotFound(_))
        ));
        assert!(store.list_positions(&pid).unwrap().is_empty());
    }

    #[test]
    fn zero_price_buy_creates_zero_cost_lot() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(1),
                Decimal::ZERO,
                Decimal::ZERO,
                Decimal::ZERO,
                2,
            ))
            .unwrap();

        let pos = store.get_position(&pid, "2330").unwrap();
        assert_eq!(pos.total_quantity, dec!(1));
        assert_eq!(pos.avg_cost_per_share, Decimal::ZERO);
    }

    #[test]
    fn split_doubles_quantity_and_halves_lot_price() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(100),
                dec!(100),
                Decimal::ZERO,
                Decimal::ZERO,
                2,
            ))
            .unwrap();

        let mut split = event_request(
            &pid,
            "SPLIT",
            dec!(1),
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            5,
        );
        split.payload = Some(serde_json::json!({ "ratio": "2" }));
        store.record_event(&split).unwrap();

        let pos = store.get_position(&pid, "2330").unwrap();
        assert_eq!(pos.total_quantity, dec!(200));
        assert_eq!(pos.total_cost, dec!(10000));
        assert_eq!(pos.avg_cost_per_share, dec!(50));
        assert_eq!(store.open_lot_quantity(&pid, "2330").unwrap(), dec!(200));
    }

    #[test]
    fn rights_event_moves_position_by_explicit_fields() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(100),
                dec!(100),
                Decimal::ZERO,
                Decimal::ZERO,
                2,
            ))
            .unwrap();

        let mut rights = event_request(
            &pid,
            "RIGHTS",
            dec!(10),
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            5,
        );
        rights.payload = Some(serde_json::json!({ "quantity": "10", "total_amount": "500" }));
        let event = store.record_event(&rights).unwrap();
        // The recorded event and the projection agree on the cash impact.
        assert_eq!(event.total_amount, dec!(500));

        let pos = store.get_position(&pid, "2330").unwrap();
        assert_eq!(pos.total_quantity, dec!(110));
        assert_eq!(pos.total_cost, dec!(10500));
        assert_eq!(pos.avg_cost_per_share, dec!(95.4545));
    }

    #[test]
    fn record_against_missing_portfolio_is_conflict() {
        let (store, _) = store();
        let err = store
            .record_event(&event_request(
                "ghost",
                "BUY",
                dec!(1),
                dec!(1),
                Decimal::ZERO,
                Decimal::ZERO,
                2,
            ))
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn recorded_event_is_listed_for_its_symbol() {
        let (store, pid) = store();
        let event = store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(10),
                dec!(5),
                Decimal::ZERO,
                Decimal::ZERO,
                2,
            ))
            .unwrap();

        let listed = store.list_events_by_symbol(&pid, "2330.TW").unwrap();
        assert!(listed.iter().any(|e| e.event_id == event.event_id));
    }

    #[test]
    fn list_events_newest_first_with_limit() {
        let (store, pid) = store();
        for day in 2..=5 {
            store
                .record_event(&event_request(
                    &pid,
                    "BUY",
                    dec!(1),
                    dec!(10),
                    Decimal::ZERO,
                    Decimal::ZERO,
                    day,
                ))
                .unwrap();
        }

        let listed = store.list_events(&pid, 2).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].recorded_at >= listed[1].recorded_at);
    }

    #[test]
    fn unrealized_pnl_uses_the_snapshot() {
        let (store, pid) = store();
        store
            .record_event(&event_request(
                &pid,
                "BUY",
                dec!(1000),
                dec!(580),
                dec!(826.50),
                Decimal::ZERO,
                2,
            ))
            .unwrap();

        let pnl = store.unrealized_pnl(&pid, "2330", dec!(600)).unwrap();
        assert_eq!(pnl.quantity, dec!(1000));
        assert_eq!(pnl.avg_cost, dec!(580.8265));
        assert_eq!(pnl.market_value, dec!(600000));
        assert_eq!(pnl.unrealized_pnl, dec!(19173.50));
    }
}
