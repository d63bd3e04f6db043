// =============================================================================
// TWSE Daily Snapshot Client — one exchange-wide request per trading day
// =============================================================================
//
// The after-trading MI_INDEX endpoint returns every listed symbol's OHLCV for
// one day in a single response, as a set of positionally-indexed tables. The
// snapshot table is identified as the one with the largest row count; rows
// that fail to parse are skipped, never aborting the day.
//
// Column layout (per row): 0 = symbol, 2 = traded volume, 4 = turnover,
// 5..=8 = open/high/low/close. Numbers carry thousands separators; "--",
// "---", and "-" are "no value".
// =============================================================================

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::CoreError;
use crate::market::OhlcvBar;
use crate::symbol;

/// Where the bulk worker gets a day's worth of bars. Abstracted so the worker
/// can run against a scripted source in tests.
#[async_trait]
pub trait DailySnapshotSource: Send + Sync {
    async fn fetch_day(&self, day: NaiveDate) -> Result<Vec<OhlcvBar>, CoreError>;
}

// =============================================================================
// Production client
// =============================================================================

const TWSE_BASE_URL: &str = "https://www.twse.com.tw/rwd/zh/afterTrading/MI_INDEX";

pub struct TwseSnapshotClient {
    client: reqwest::Client,
    base_url: String,
}

impl TwseSnapshotClient {
    pub fn new(timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: TWSE_BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl DailySnapshotSource for TwseSnapshotClient {
    async fn fetch_day(&self, day: NaiveDate) -> Result<Vec<OhlcvBar>, CoreError> {
        let url = format!(
            "{}?response=json&type=ALL&date={}",
            self.base_url,
            day.format("%Y%m%d")
        );
        debug!(%day, "fetching exchange-wide daily snapshot");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::upstream(format!("snapshot request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::upstream(format!(
                "snapshot endpoint returned {status} for {day}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::upstream(format!("snapshot body is not JSON: {e}")))?;

        Ok(parse_snapshot(&body, day))
    }
}

// =============================================================================
// Snapshot parsing
// =============================================================================

/// Extract bars from a daily snapshot response.
///
/// A zero-length result on a successful response means the exchange was
/// closed that day (holiday); the caller decides what that means.
pub fn parse_snapshot(body: &Value, day: NaiveDate) -> Vec<OhlcvBar> {
    let rows = match largest_table(body) {
        Some(rows) => rows,
        None => return Vec::new(),
    };

    let mut bars = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;

    for row in rows {
        match parse_row(row, day) {
            Some(bar) => bars.push(bar),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        debug!(%day, parsed = bars.len(), skipped, "snapshot rows skipped during parse");
    }
    bars
}

/// The snapshot table is the candidate with the most rows. Candidates are
/// any array-of-arrays found either under `tables[].data` or directly under
/// a top-level key (the endpoint has shipped both shapes).
fn largest_table(body: &Value) -> Option<&Vec<Value>> {
    let mut best: Option<&Vec<Value>> = None;

    fn consider<'a>(value: Option<&'a Value>, best: &mut Option<&'a Vec<Value>>) {
        if let Some(rows) = value.and_then(Value::as_array) {
            if !rows.is_empty()
                && rows.iter().all(Value::is_array)
                && rows.len() > best.map_or(0, |b| b.len())
            {
                *best = Some(rows);
            }
        }
    }

    if let Some(tables) = body.get("tables").and_then(Value::as_array) {
        for table in tables {
            consider(table.get("data"), &mut best);
        }
    }
    if let Some(obj) = body.as_object() {
        for (key, value) in obj {
            if key.starts_with("data") {
                consider(Some(value), &mut best);
            }
        }
    }

    best
}

fn parse_row(row: &Value, day: NaiveDate) -> Option<OhlcvBar> {
    let cells = row.as_array()?;
    if cells.len() < 9 {
        return None;
    }

    let raw_symbol = cell_str(&cells[0])?;
    let sym = symbol::canonicalize(&raw_symbol).ok()?;

    let volume = parse_integer(&cells[2])?;
    let turnover = parse_decimal(&cells[4]).unwrap_or(Decimal::ZERO);
    let open = parse_decimal(&cells[5])?;
    let high = parse_decimal(&cells[6])?;
    let low = parse_decimal(&cells[7])?;
    let close = parse_decimal(&cells[8])?;

    // Open and close both zero means no trade printed for the symbol.
    if open.is_zero() && close.is_zero() {
        return None;
    }

    let bar = OhlcvBar {
        symbol: sym,
        ts: day,
        open,
        high,
        low,
        close,
        volume,
        turnover,
    };

    match bar.validate() {
        Ok(()) => Some(bar),
        Err(e) => {
            warn!(%day, error = %e, "snapshot row violated bar invariant");
            None
        }
    }
}

fn cell_str(cell: &Value) -> Option<String> {
    match cell {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Strip thousands separators and map the exchange's "no value" sentinels to
/// `None`.
fn clean_number(cell: &Value) -> Option<String> {
    let raw = cell_str(cell)?;
    let cleaned = raw.replace(',', "");
    match cleaned.as_str() {
        "" | "-" | "--" | "---" => None,
        _ => Some(cleaned),
    }
}

fn parse_decimal(cell: &Value) -> Option<Decimal> {
    clean_number(cell)?.parse().ok()
}

fn parse_integer(cell: &Value) -> Option<i64> {
    clean_number(cell)?.parse().ok()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn day() -> NaiveDate {
        "2024-01-02".parse().unwrap()
    }

    fn row(symbol: &str, volume: &str, turnover: &str, ohlc: [&str; 4]) -> Value {
        json!([
            symbol, "TSMC", volume, "12345", turnover, ohlc[0], ohlc[1], ohlc[2], ohlc[3],
            "+", "5.00", "0.86", "585.00", "586.00", "12"
        ])
    }

    #[test]
    fn parses_well_formed_rows() {
        let body = json!({
            "tables": [
                { "data": [ ["junk header"] ] },
                { "data": [
                    row("2330", "25,000,123", "14,600,000,000", ["580.00", "590.00", "578.00", "585.00"]),
                    row("2317", "8,000,000", "800,000,000", ["100.00", "101.50", "99.50", "100.50"]),
                ]}
            ]
        });

        let bars = parse_snapshot(&body, day());
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].symbol, "2330");
        assert_eq!(bars[0].open, dec!(580.00));
        assert_eq!(bars[0].high, dec!(590.00));
        assert_eq!(bars[0].low, dec!(578.00));
        assert_eq!(bars[0].close, dec!(585.00));
        assert_eq!(bars[0].volume, 25_000_123);
        assert_eq!(bars[0].turnover, dec!(14600000000));
    }

    #[test]
    fn picks_largest_table() {
        let body = json!({
            "tables": [
                { "data": [ row("1101", "1,000", "50,000", ["50", "51", "49", "50.5"]) ] },
                { "data": [
                    row("2330", "1,000", "50,000", ["580", "590", "578", "585"]),
                    row("2317", "1,000", "50,000", ["100", "101", "99", "100.5"]),
                    row("2454", "1,000", "50,000", ["900", "910", "890", "905"]),
                ]}
            ]
        });

        let bars = parse_snapshot(&body, day());
        assert_eq!(bars.len(), 3);
    }

    #[test]
    fn legacy_top_level_data_keys_supported() {
        let body = json!({
            "data9": [ row("2330", "1,000", "50,000", ["580", "590", "578", "585"]) ],
            "stat": "OK"
        });

        let bars = parse_snapshot(&body, day());
        assert_eq!(bars.len(), 1);
    }

    #[test]
    fn sentinel_prices_skip_the_row() {
        let body = json!({
            "tables": [ { "data": [
                row("2330", "0", "0", ["--", "--", "--", "--"]),
                row("2317", "1,000", "50,000", ["100", "101", "99", "100.5"]),
            ]}]
        });

        let bars = parse_snapshot(&body, day());
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].symbol, "2317");
    }

    #[test]
    fn zero_open_and_close_skipped() {
        let body = json!({
            "tables": [ { "data": [
                row("2330", "0", "0", ["0.00", "0.00", "0.00", "0.00"]),
            ]}]
        });

        assert!(parse_snapshot(&body, day()).is_empty());
    }

    #[test]
    fn non_symbol_rows_skipped() {
        let body = json!({
            "tables": [ { "data": [
                row("合計", "1,000", "50,000", ["1", "2", "0.5", "1.5"]),
                row("2330", "1,000", "50,000", ["580", "590", "578", "585"]),
            ]}]
        });

        let bars = parse_snapshot(&body, day());
        assert_eq!(bars.len(), 1);
    }

    #[test]
    fn short_rows_skipped() {
        let body = json!({
            "tables": [ { "data": [ ["2330", "x"] ] } ]
        });
        assert!(parse_snapshot(&body, day()).is_empty());
    }

    #[test]
    fn empty_response_is_no_rows() {
        assert!(parse_snapshot(&json!({ "stat": "很抱歉，沒有符合條件的資料!" }), day()).is_empty());
    }

    #[test]
    fn invariant_violations_skipped() {
        let body = json!({
            "tables": [ { "data": [
                // low above open.
                row("2330", "1,000", "50,000", ["580", "590", "585", "585"]),
            ]}]
        });
        assert!(parse_snapshot(&body, day()).is_empty());
    }
}
