// =============================================================================
// MACD — Moving Average Convergence/Divergence
// =============================================================================
//
// macd      = EMA(close, fast) − EMA(close, slow)
// signal    = EMA(macd, signal_period)
// histogram = macd − signal
//
// The MACD line exists from close index `slow - 1`; the signal needs another
// `signal_period - 1` points. Output aligns with the input from index
// `slow + signal_period - 2`.
// =============================================================================

use crate::indicators::ma::ema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Full MACD series.
///
/// # Edge cases
/// - any period of zero, or `fast >= slow` => empty vec
/// - `closes.len() < slow + signal_period - 1` => empty vec
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Vec<MacdPoint> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return Vec::new();
    }
    if closes.len() < slow + signal_period - 1 {
        return Vec::new();
    }

    let fast_series = ema(closes, fast);
    let slow_series = ema(closes, slow);

    // Trim the fast series to the slow series' start so both align on the
    // same close index.
    let offset = slow - fast;
    let macd_line: Vec<f64> = fast_series[offset..]
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema(&macd_line, signal_period);
    let line_offset = signal_period - 1;

    macd_line[line_offset..]
        .iter()
        .zip(signal_series.iter())
        .map(|(&m, &s)| MacdPoint {
            macd: m,
            signal: s,
            histogram: m - s,
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_periods() {
        let closes: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        assert!(macd(&closes, 0, 26, 9).is_empty());
        assert!(macd(&closes, 26, 12, 9).is_empty());
        assert!(macd(&closes, 12, 12, 9).is_empty());
        assert!(macd(&closes, 12, 26, 0).is_empty());
    }

    #[test]
    fn insufficient_data() {
        // Needs slow + signal - 1 = 34 closes for 12/26/9.
        let closes: Vec<f64> = (1..=33).map(|x| x as f64).collect();
        assert!(macd(&closes, 12, 26, 9).is_empty());
    }

    #[test]
    fn minimum_data_yields_one_point() {
        let closes: Vec<f64> = (1..=34).map(|x| x as f64).collect();
        let series = macd(&closes, 12, 26, 9);
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn output_length_matches_input() {
        let closes: Vec<f64> = (1..=100).map(|x| (x as f64).sin() * 10.0 + 100.0).collect();
        let series = macd(&closes, 12, 26, 9);
        assert_eq!(series.len(), 100 - (26 + 9 - 2));
    }

    #[test]
    fn histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (1..=80).map(|x| (x as f64 * 0.3).cos() * 5.0 + 50.0).collect();
        for point in macd(&closes, 12, 26, 9) {
            assert!((point.histogram - (point.macd - point.signal)).abs() < 1e-12);
        }
    }

    #[test]
    fn rising_market_has_positive_macd() {
        // In a steady uptrend the fast EMA sits above the slow EMA.
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let series = macd(&closes, 12, 26, 9);
        assert!(series.last().unwrap().macd > 0.0);
    }
}
