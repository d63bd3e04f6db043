// =============================================================================
// Corporate Actions — externally loaded reference table
// =============================================================================
//
// Read-only to the engine: rows arrive from an external loader and are only
// ever listed here. Date ordering (announcement ≤ ex ≤ record ≤ payment) is
// checked at load time for the dates that are present.
// =============================================================================

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::market::bars::parse_date;
use crate::storage::db::{dec_from_sql, dec_to_sql};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorporateActionType {
    Dividend,
    StockDividend,
    Split,
    Rights,
    Merger,
}

impl CorporateActionType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Dividend => "DIVIDEND",
            Self::StockDividend => "STOCK_DIVIDEND",
            Self::Split => "SPLIT",
            Self::Rights => "RIGHTS",
            Self::Merger => "MERGER",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DIVIDEND" => Some(Self::Dividend),
            "STOCK_DIVIDEND" => Some(Self::StockDividend),
            "SPLIT" => Some(Self::Split),
            "RIGHTS" => Some(Self::Rights),
            "MERGER" => Some(Self::Merger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorporateAction {
    #[serde(default)]
    pub action_id: Option<String>,
    pub symbol: String,
    pub action_type: CorporateActionType,
    pub announcement_date: Option<NaiveDate>,
    pub ex_date: Option<NaiveDate>,
    pub record_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
    pub cash_dividend: Option<Decimal>,
    pub stock_dividend: Option<Decimal>,
    pub split_ratio: Option<Decimal>,
    pub rights_ratio: Option<Decimal>,
    pub subscription_price: Option<Decimal>,
    pub adjustment_factor: Option<Decimal>,
}

impl CorporateAction {
    /// Present dates must be ordered announcement ≤ ex ≤ record ≤ payment.
    pub fn validate(&self) -> Result<(), CoreError> {
        let ordered = [
            self.announcement_date,
            self.ex_date,
            self.record_date,
            self.payment_date,
        ];
        let present: Vec<NaiveDate> = ordered.into_iter().flatten().collect();
        if present.windows(2).any(|w| w[0] > w[1]) {
            return Err(CoreError::validation(format!(
                "corporate action for {} has out-of-order dates",
                self.symbol
            )));
        }
        Ok(())
    }
}

pub(crate) fn upsert(conn: &Connection, action: &CorporateAction) -> Result<String, CoreError> {
    action.validate()?;

    let id = action
        .action_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    conn.execute(
        "INSERT INTO corporate_actions
            (action_id, symbol, action_type, announcement_date, ex_date, record_date,
             payment_date, cash_dividend, stock_dividend, split_ratio, rights_ratio,
             subscription_price, adjustment_factor)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(action_id) DO UPDATE SET
            symbol = excluded.symbol,
            action_type = excluded.action_type,
            announcement_date = excluded.announcement_date,
            ex_date = excluded.ex_date,
            record_date = excluded.record_date,
            payment_date = excluded.payment_date,
            cash_dividend = excluded.cash_dividend,
            stock_dividend = excluded.stock_dividend,
            split_ratio = excluded.split_ratio,
            rights_ratio = excluded.rights_ratio,
            subscription_price = excluded.subscription_price,
            adjustment_factor = excluded.adjustment_factor",
        params![
            id,
            action.symbol,
            action.action_type.as_str(),
            action.announcement_date.map(|d| d.to_string()),
            action.ex_date.map(|d| d.to_string()),
            action.record_date.map(|d| d.to_string()),
            action.payment_date.map(|d| d.to_string()),
            action.cash_dividend.as_ref().map(dec_to_sql),
            action.stock_dividend.as_ref().map(dec_to_sql),
            action.split_ratio.as_ref().map(dec_to_sql),
            action.rights_ratio.as_ref().map(dec_to_sql),
            action.subscription_price.as_ref().map(dec_to_sql),
            action.adjustment_factor.as_ref().map(dec_to_sql),
        ],
    )?;
    Ok(id)
}

pub(crate) fn list_for_symbol(
    conn: &Connection,
    symbol: &str,
) -> Result<Vec<CorporateAction>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT action_id, symbol, action_type, announcement_date, ex_date, record_date,
                payment_date, cash_dividend, stock_dividend, split_ratio, rights_ratio,
                subscription_price, adjustment_factor
         FROM corporate_actions
         WHERE symbol = ?1
         ORDER BY ex_date DESC",
    )?;

    let rows = stmt
        .query_map(params![symbol], map_action_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn opt_date(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_date(idx, &s)).transpose()
}

fn opt_dec(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| dec_from_sql(idx, &s)).transpose()
}

fn map_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CorporateAction> {
    let action_type_raw: String = row.get(2)?;
    let action_type = CorporateActionType::parse(&action_type_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown corporate action type '{action_type_raw}'").into(),
        )
    })?;

    Ok(CorporateAction {
        action_id: row.get(0)?,
        symbol: row.get(1)?,
        action_type,
        announcement_date: opt_date(row, 3)?,
        ex_date: opt_date(row, 4)?,
        record_date: opt_date(row, 5)?,
        payment_date: opt_date(row, 6)?,
        cash_dividend: opt_dec(row, 7)?,
        stock_dividend: opt_dec(row, 8)?,
        split_ratio: opt_dec(row, 9)?,
        rights_ratio: opt_dec(row, 10)?,
        subscription_price: opt_dec(row, 11)?,
        adjustment_factor: opt_dec(row, 12)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn dividend(symbol: &str) -> CorporateAction {
        CorporateAction {
            action_id: None,
            symbol: symbol.to_string(),
            action_type: CorporateActionType::Dividend,
            announcement_date: Some("2024-02-01".parse().unwrap()),
            ex_date: Some("2024-03-15".parse().unwrap()),
            record_date: Some("2024-03-21".parse().unwrap()),
            payment_date: Some("2024-04-10".parse().unwrap()),
            cash_dividend: Some(dec!(3.5)),
            stock_dividend: None,
            split_ratio: None,
            rights_ratio: None,
            subscription_price: None,
            adjustment_factor: None,
        }
    }

    #[test]
    fn ordered_dates_pass() {
        assert!(dividend("2330").validate().is_ok());
    }

    #[test]
    fn out_of_order_dates_rejected() {
        let mut action = dividend("2330");
        action.record_date = Some("2024-03-01".parse().unwrap()); // before ex
        assert!(action.validate().is_err());
    }

    #[test]
    fn missing_dates_are_skipped_in_ordering() {
        let mut action = dividend("2330");
        action.ex_date = None;
        action.record_date = None;
        assert!(action.validate().is_ok());
    }
}
