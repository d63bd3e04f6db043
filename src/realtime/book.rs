// =============================================================================
// 5-Level Order Book — parsing the upstream's parallel-array encoding
// =============================================================================
//
// The upstream encodes each side as two `_`-separated lists: prices and
// volumes as parallel arrays. Levels align by index; the first five survive.
// A level with an empty or unparsable price, or an unparsable volume, is
// skipped. Bids are kept best-first (highest price), asks best-first (lowest
// price) — the upstream usually emits that order, but it is verified by
// sorting rather than trusted.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const BOOK_DEPTH: usize = 5;

/// One price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub volume: i64,
}

/// Best five levels per side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Parse both sides. `None` when no level on either side survives.
    pub fn parse(
        bid_prices: &str,
        bid_volumes: &str,
        ask_prices: &str,
        ask_volumes: &str,
    ) -> Option<Self> {
        let mut bids = parse_side(bid_prices, bid_volumes);
        let mut asks = parse_side(ask_prices, ask_volumes);

        if bids.is_empty() && asks.is_empty() {
            return None;
        }

        // Verify side ordering instead of trusting the feed.
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        Some(Self { bids, asks })
    }

    /// Re-encode into the upstream's wire form:
    /// (bid_prices, bid_volumes, ask_prices, ask_volumes).
    pub fn to_wire(&self) -> (String, String, String, String) {
        (
            join_prices(&self.bids),
            join_volumes(&self.bids),
            join_prices(&self.asks),
            join_volumes(&self.asks),
        )
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

fn parse_side(prices: &str, volumes: &str) -> Vec<BookLevel> {
    let prices = prices.split('_');
    let volumes = volumes.split('_');

    prices
        .zip(volumes)
        .take(BOOK_DEPTH)
        .filter_map(|(p, v)| {
            let price: Decimal = parse_cell(p)?;
            let volume: i64 = parse_cell(v)?;
            Some(BookLevel { price, volume })
        })
        .collect()
}

/// `-` is the upstream's "no value"; empty segments appear on thin books.
fn parse_cell<T: std::str::FromStr>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }
    trimmed.parse().ok()
}

fn join_prices(levels: &[BookLevel]) -> String {
    levels
        .iter()
        .map(|l| l.price.to_string())
        .collect::<Vec<_>>()
        .join("_")
}

fn join_volumes(levels: &[BookLevel]) -> String {
    levels
        .iter()
        .map(|l| l.volume.to_string())
        .collect::<Vec<_>>()
        .join("_")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn five_levels_each_side() {
        let book = OrderBook::parse(
            "585.0_584.5_584.0_583.5_583.0",
            "10_20_30_40_50",
            "585.5_586.0_586.5_587.0_587.5",
            "100_200_300_400_500",
        )
        .unwrap();

        assert_eq!(book.bids.len(), 5);
        assert_eq!(book.asks.len(), 5);

        // Bids descending, asks ascending.
        for pair in book.bids.windows(2) {
            assert!(pair[0].price > pair[1].price);
        }
        for pair in book.asks.windows(2) {
            assert!(pair[0].price < pair[1].price);
        }

        assert_eq!(book.best_bid(), Some(dec!(585.0)));
        assert_eq!(book.best_ask(), Some(dec!(585.5)));
        assert_eq!(book.asks[4].volume, 500);
    }

    #[test]
    fn misordered_feed_is_sorted() {
        let book = OrderBook::parse("583.0_585.0_584.0", "1_2_3", "587.0_586.0", "1_2").unwrap();
        assert_eq!(book.bids[0].price, dec!(585.0));
        assert_eq!(book.asks[0].price, dec!(586.0));
    }

    #[test]
    fn only_first_five_levels_kept() {
        let book = OrderBook::parse(
            "10_9_8_7_6_5_4",
            "1_1_1_1_1_1_1",
            "11_12_13_14_15_16",
            "1_1_1_1_1_1",
        )
        .unwrap();
        assert_eq!(book.bids.len(), BOOK_DEPTH);
        assert_eq!(book.asks.len(), BOOK_DEPTH);
    }

    #[test]
    fn sentinel_and_empty_levels_skipped() {
        let book = OrderBook::parse("585.0_-_584.0", "10_20_30", "-_", "_").unwrap();
        assert_eq!(book.bids.len(), 2);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn unparsable_volume_drops_the_level() {
        let book = OrderBook::parse("585.0_584.0", "abc_30", "", "").unwrap();
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].price, dec!(584.0));
    }

    #[test]
    fn empty_both_sides_is_none() {
        assert!(OrderBook::parse("-", "-", "_", "_").is_none());
        assert!(OrderBook::parse("", "", "", "").is_none());
    }

    #[test]
    fn wire_roundtrip() {
        let book = OrderBook::parse(
            "585.0_584.5_584.0",
            "10_20_30",
            "585.5_586.0",
            "100_200",
        )
        .unwrap();

        let (bp, bv, ap, av) = book.to_wire();
        let reparsed = OrderBook::parse(&bp, &bv, &ap, &av).unwrap();
        assert_eq!(reparsed, book);
    }
}
