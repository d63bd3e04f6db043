// =============================================================================
// Ledger Events — append-only portfolio event log
// =============================================================================
//
// Events are the single source of truth: created once, never mutated or
// deleted. Positions, tax lots, and realized P&L are all derived from them
// inside the same transaction that appends the event.
//
// `total_amount` convention: signed and authoritative. BUY and SELL are both
// stored positive (the event type carries direction); DIVIDEND and
// CORRECTION take the payload value verbatim.
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CoreError;
use crate::storage::db::{dec_from_sql, dec_to_sql};
use crate::symbol;

// =============================================================================
// Event type
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Buy,
    Sell,
    Dividend,
    Split,
    Rights,
    Correction,
}

impl EventType {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            "DIVIDEND" => Ok(Self::Dividend),
            "SPLIT" => Ok(Self::Split),
            "RIGHTS" => Ok(Self::Rights),
            "CORRECTION" => Ok(Self::Correction),
            other => Err(CoreError::validation(format!(
                "unknown event type '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Dividend => "DIVIDEND",
            Self::Split => "SPLIT",
            Self::Rights => "RIGHTS",
            Self::Correction => "CORRECTION",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event model
// =============================================================================

/// An immutable record of a portfolio action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: String,
    pub portfolio_id: String,
    pub event_type: EventType,
    /// Canonical 4-digit core; suffixes are stripped on input.
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub tax: Decimal,
    pub total_amount: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Incoming request to append an event. `event_type` stays a string so the
/// validation error for an unknown type is ours, not serde's.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordEventRequest {
    pub portfolio_id: String,
    pub event_type: String,
    pub symbol: String,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    #[serde(default)]
    pub tax: Decimal,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Validated form of a request, ready to persist.
#[derive(Debug)]
pub(crate) struct ValidatedEvent {
    pub event_type: EventType,
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub tax: Decimal,
    pub total_amount: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub notes: Option<String>,
    pub payload: Option<Value>,
}

/// Validate a request and compute its `total_amount`.
pub(crate) fn validate(req: &RecordEventRequest) -> Result<ValidatedEvent, CoreError> {
    let event_type = EventType::parse(&req.event_type)?;
    let sym = symbol::canonicalize(&req.symbol)?;

    if req.quantity <= Decimal::ZERO {
        return Err(CoreError::validation("quantity must be positive"));
    }
    if req.price < Decimal::ZERO {
        return Err(CoreError::validation("price must not be negative"));
    }
    if req.fee < Decimal::ZERO || req.tax < Decimal::ZERO {
        return Err(CoreError::validation("fee and tax must not be negative"));
    }

    let total_amount = compute_total_amount(event_type, req);

    Ok(ValidatedEvent {
        event_type,
        symbol: sym,
        quantity: req.quantity,
        price: req.price,
        fee: req.fee,
        tax: req.tax,
        total_amount,
        occurred_at: req.occurred_at,
        source: req.source.clone().unwrap_or_else(|| "manual".to_string()),
        notes: req.notes.clone(),
        payload: req.payload.clone(),
    })
}

/// The `total_amount` rule.
///
/// - BUY:  quantity·price + fee + tax (outflow, stored positive)
/// - SELL: quantity·price − fee − tax (net inflow)
/// - DIVIDEND: payload `cash_amount` when present, else quantity·price
/// - RIGHTS / CORRECTION: payload `total_amount` verbatim, else zero
/// - SPLIT: zero (no cash moves)
fn compute_total_amount(event_type: EventType, req: &RecordEventRequest) -> Decimal {
    match event_type {
        EventType::Buy => req.quantity * req.price + req.fee + req.tax,
        EventType::Sell => req.quantity * req.price - req.fee - req.tax,
        EventType::Dividend => payload_decimal(req.payload.as_ref(), "cash_amount")
            .unwrap_or_else(|| req.quantity * req.price),
        EventType::Rights | EventType::Correction => {
            payload_decimal(req.payload.as_ref(), "total_amount").unwrap_or(Decimal::ZERO)
        }
        EventType::Split => Decimal::ZERO,
    }
}

/// Extract a decimal from a free-form payload, accepting both JSON numbers
/// and decimal strings.
pub(crate) fn payload_decimal(payload: Option<&Value>, key: &str) -> Option<Decimal> {
    let value = payload?.get(key)?;
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

// =============================================================================
// SQL
// =============================================================================

pub(crate) fn insert_event(conn: &Connection, event: &LedgerEvent) -> Result<(), CoreError> {
    conn.execute(
        "INSERT INTO ledger_events
            (event_id, portfolio_id, event_type, symbol, quantity, price, fee, tax,
             total_amount, occurred_at, recorded_at, source, notes, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            event.event_id,
            event.portfolio_id,
            event.event_type.as_str(),
            event.symbol,
            dec_to_sql(&event.quantity),
            dec_to_sql(&event.price),
            dec_to_sql(&event.fee),
            dec_to_sql(&event.tax),
            dec_to_sql(&event.total_amount),
            event.occurred_at.to_rfc3339(),
            event.recorded_at.to_rfc3339(),
            event.source,
            event.notes,
            event.payload.as_ref().map(|p| p.to_string()),
        ],
    )?;
    Ok(())
}

pub(crate) fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEvent> {
    let event_type_raw: String = row.get(2)?;
    let quantity: String = row.get(4)?;
    let price: String = row.get(5)?;
    let fee: String = row.get(6)?;
    let tax: String = row.get(7)?;
    let total_amount: String = row.get(8)?;
    let occurred_at: String = row.get(9)?;
    let recorded_at: String = row.get(10)?;
    let payload_raw: Option<String> = row.get(13)?;

    Ok(LedgerEvent {
        event_id: row.get(0)?,
        portfolio_id: row.get(1)?,
        event_type: EventType::parse(&event_type_raw).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown event type '{event_type_raw}'").into(),
            )
        })?,
        symbol: row.get(3)?,
        quantity: dec_from_sql(4, &quantity)?,
        price: dec_from_sql(5, &price)?,
        fee: dec_from_sql(6, &fee)?,
        tax: dec_from_sql(7, &tax)?,
        total_amount: dec_from_sql(8, &total_amount)?,
        occurred_at: parse_rfc3339(9, &occurred_at)?,
        recorded_at: parse_rfc3339(10, &recorded_at)?,
        source: row.get(11)?,
        notes: row.get(12)?,
        payload: payload_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

pub(crate) fn parse_rfc3339(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) const EVENT_COLUMNS: &str = "event_id, portfolio_id, event_type, symbol, quantity, \
     price, fee, tax, total_amount, occurred_at, recorded_at, source, notes, payload";
