// =============================================================================
// Realtime Quotes — per-symbol upstream polling with sentinel-safe parsing
// =============================================================================
//
// The upstream (mis.twse.com.tw style) answers one HTTP round-trip for up to
// 20 symbols. Every numeric field arrives as a string and "-" means "no
// value". Volume arrives in lots of 1000 shares. The 5-level book is the
// `_`-separated parallel-array encoding handled by `book::OrderBook`.
//
// Quotes are ephemeral: rebuilt from upstream on every poll, never persisted.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::CoreError;
use crate::realtime::book::OrderBook;

/// Shares per lot in the upstream's volume fields.
const SHARES_PER_LOT: i64 = 1000;

// =============================================================================
// Model
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeQuote {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub last: Option<Decimal>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub prev_close: Option<Decimal>,
    /// last − prev_close.
    pub change: Option<Decimal>,
    /// Percent vs prev_close, rounded to 2 decimals.
    pub change_percent: Option<Decimal>,
    /// Accumulated shares (upstream reports lots of 1000).
    pub volume: i64,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub limit_up: Option<Decimal>,
    pub limit_down: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_book: Option<OrderBook>,
    pub trade_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Record parsing
// =============================================================================

/// Parse one upstream record. `None` when the record has no symbol at all;
/// individual missing fields degrade to `None` values instead.
pub fn parse_quote_record(record: &Value) -> Option<RealtimeQuote> {
    let symbol = record.get("c")?.as_str()?.trim().to_string();
    if symbol.is_empty() {
        return None;
    }

    let last = field_decimal(record, "z");
    let prev_close = field_decimal(record, "y");

    let (change, change_percent) = match (last, prev_close) {
        (Some(l), Some(p)) if !p.is_zero() => {
            let diff = l - p;
            (
                Some(diff),
                Some((diff / p * Decimal::ONE_HUNDRED).round_dp(2)),
            )
        }
        (Some(l), Some(p)) => (Some(l - p), None),
        _ => (None, None),
    };

    let order_book = OrderBook::parse(
        field_str(record, "b").unwrap_or_default().as_str(),
        field_str(record, "g").unwrap_or_default().as_str(),
        field_str(record, "a").unwrap_or_default().as_str(),
        field_str(record, "f").unwrap_or_default().as_str(),
    );

    let volume_lots = field_decimal(record, "v")
        .and_then(|d| d.trunc().to_i64())
        .unwrap_or(0);

    let trade_time = field_str(record, "tlong")
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    Some(RealtimeQuote {
        symbol,
        name: field_str(record, "n"),
        last,
        open: field_decimal(record, "o"),
        high: field_decimal(record, "h"),
        low: field_decimal(record, "l"),
        prev_close,
        change,
        change_percent,
        volume: volume_lots * SHARES_PER_LOT,
        best_bid: order_book.as_ref().and_then(OrderBook::best_bid),
        best_ask: order_book.as_ref().and_then(OrderBook::best_ask),
        limit_up: field_decimal(record, "u"),
        limit_down: field_decimal(record, "w"),
        order_book,
        trade_time,
    })
}

fn field_str(record: &Value, key: &str) -> Option<String> {
    let raw = record.get(key)?.as_str()?.trim();
    if raw.is_empty() || raw == "-" {
        None
    } else {
        Some(raw.to_string())
    }
}

fn field_decimal(record: &Value, key: &str) -> Option<Decimal> {
    field_str(record, key)?.parse().ok()
}

// =============================================================================
// Upstream client
// =============================================================================

const MIS_BASE_URL: &str = "https://mis.twse.com.tw/stock/api/getStockInfo.jsp";

pub struct MisQuoteClient {
    client: reqwest::Client,
    base_url: String,
    quote_timeout: std::time::Duration,
    batch_timeout: std::time::Duration,
    batch_cap: usize,
}

impl MisQuoteClient {
    pub fn new(
        quote_timeout: std::time::Duration,
        batch_timeout: std::time::Duration,
        batch_cap: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: MIS_BASE_URL.to_string(),
            quote_timeout,
            batch_timeout,
            batch_cap,
        }
    }

    /// One round-trip for a single symbol.
    pub async fn get_quote(&self, symbol: &str) -> Result<RealtimeQuote, CoreError> {
        let sym = crate::symbol::canonicalize(symbol)?;
        let mut quotes = self
            .fetch(std::slice::from_ref(&sym), self.quote_timeout)
            .await?;

        quotes.pop().ok_or_else(|| {
            CoreError::not_found(format!("no quote returned for {sym}"))
        })
    }

    /// One round-trip for up to `batch_cap` symbols; overflow is dropped with
    /// a warning.
    pub async fn get_batch_quotes(
        &self,
        symbols: &[String],
    ) -> Result<Vec<RealtimeQuote>, CoreError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let canonical = prepare_batch(symbols, self.batch_cap);
        self.fetch(&canonical, self.batch_timeout).await
    }

    async fn fetch(
        &self,
        symbols: &[String],
        timeout: std::time::Duration,
    ) -> Result<Vec<RealtimeQuote>, CoreError> {
        let ex_ch = symbols
            .iter()
            .map(|s| format!("tse_{s}.tw"))
            .collect::<Vec<_>>()
            .join("|");
        let url = format!("{}?ex_ch={ex_ch}&json=1&delay=0", self.base_url);

        debug!(symbols = symbols.len(), "fetching realtime quotes");
        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CoreError::upstream(format!("quote request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::upstream(format!(
                "quote endpoint returned {status}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::upstream(format!("quote body is not JSON: {e}")))?;

        let records = body
            .get("msgArray")
            .and_then(Value::as_array)
            .ok_or_else(|| CoreError::upstream("quote body missing msgArray"))?;

        Ok(records.iter().filter_map(parse_quote_record).collect())
    }
}

/// Canonicalize a batch request: invalid symbols are dropped with a warning,
/// and anything beyond `cap` is cut.
fn prepare_batch(symbols: &[String], cap: usize) -> Vec<String> {
    let mut canonical = Vec::with_capacity(symbols.len().min(cap));
    for raw in symbols {
        match crate::symbol::canonicalize(raw) {
            Ok(sym) => canonical.push(sym),
            Err(e) => warn!(symbol = %raw, error = %e, "dropping invalid symbol from batch"),
        }
    }
    if canonical.len() > cap {
        warn!(
            requested = canonical.len(),
            cap, "batch quote request over cap, excess symbols dropped"
        );
        canonical.truncate(cap);
    }
    canonical
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn record() -> Value {
        json!({
            "c": "2330",
            "n": "台積電",
            "z": "585.00",
            "o": "580.00",
            "h": "590.00",
            "l": "578.00",
            "y": "579.00",
            "v": "25123",
            "b": "585.0_584.5_584.0_583.5_583.0",
            "g": "10_20_30_40_50",
            "a": "585.5_586.0_586.5_587.0_587.5",
            "f": "100_200_300_400_500",
            "u": "636.00",
            "w": "522.00",
            "tlong": "1704186000000"
        })
    }

    #[test]
    fn full_record_parses() {
        let quote = parse_quote_record(&record()).unwrap();
        assert_eq!(quote.symbol, "2330");
        assert_eq!(quote.last, Some(dec!(585.00)));
        assert_eq!(quote.prev_close, Some(dec!(579.00)));
        assert_eq!(quote.change, Some(dec!(6.00)));
        // 6 / 579 = 1.0362...% -> 1.04
        assert_eq!(quote.change_percent, Some(dec!(1.04)));
        assert_eq!(quote.volume, 25_123_000);
        assert_eq!(quote.limit_up, Some(dec!(636.00)));
        assert_eq!(quote.limit_down, Some(dec!(522.00)));

        let book = quote.order_book.as_ref().unwrap();
        assert_eq!(book.bids.len(), 5);
        assert_eq!(book.asks.len(), 5);
        assert_eq!(quote.best_bid, Some(dec!(585.0)));
        assert_eq!(quote.best_ask, Some(dec!(585.5)));

        let t = quote.trade_time.unwrap();
        assert_eq!(t.timestamp_millis(), 1_704_186_000_000);
    }

    #[test]
    fn book_sides_ordered() {
        let quote = parse_quote_record(&record()).unwrap();
        let book = quote.order_book.unwrap();
        for pair in book.bids.windows(2) {
            assert!(pair[0].price > pair[1].price, "bids must descend");
        }
        for pair in book.asks.windows(2) {
            assert!(pair[0].price < pair[1].price, "asks must ascend");
        }
    }

    #[test]
    fn sentinel_last_price_degrades_gracefully() {
        let mut rec = record();
        rec["z"] = json!("-");
        let quote = parse_quote_record(&rec).unwrap();
        assert!(quote.last.is_none());
        assert!(quote.change.is_none());
        assert!(quote.change_percent.is_none());
    }

    #[test]
    fn zero_prev_close_skips_percent() {
        let mut rec = record();
        rec["y"] = json!("0.00");
        let quote = parse_quote_record(&rec).unwrap();
        assert_eq!(quote.change, Some(dec!(585.00)));
        assert!(quote.change_percent.is_none());
    }

    #[test]
    fn empty_book_is_absent() {
        let mut rec = record();
        rec["b"] = json!("-");
        rec["g"] = json!("-");
        rec["a"] = json!("_");
        rec["f"] = json!("_");
        let quote = parse_quote_record(&rec).unwrap();
        assert!(quote.order_book.is_none());
        assert!(quote.best_bid.is_none());
        assert!(quote.best_ask.is_none());
    }

    #[test]
    fn record_without_symbol_is_dropped() {
        assert!(parse_quote_record(&json!({ "z": "585.00" })).is_none());
    }

    #[test]
    fn batch_of_21_symbols_is_cut_to_20() {
        let symbols: Vec<String> = (1101..=1121).map(|n| n.to_string()).collect();
        assert_eq!(symbols.len(), 21);
        let prepared = prepare_batch(&symbols, 20);
        assert_eq!(prepared.len(), 20);
        assert_eq!(prepared[0], "1101");
        assert_eq!(prepared[19], "1120");
    }

    #[test]
    fn invalid_symbols_dropped_from_batch() {
        let symbols = vec![
            "2330".to_string(),
            "not-a-symbol".to_string(),
            "2317.TW".to_string(),
        ];
        assert_eq!(prepare_batch(&symbols, 20), vec!["2330", "2317"]);
    }

    #[test]
    fn negative_change_percent_rounds_to_two_places() {
        let mut rec = record();
        rec["z"] = json!("570.00");
        let quote = parse_quote_record(&rec).unwrap();
        assert_eq!(quote.change, Some(dec!(-9.00)));
        // -9 / 579 = -1.5544...% -> -1.55
        assert_eq!(quote.change_percent, Some(dec!(-1.55)));
    }
}
