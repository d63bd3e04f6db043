// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(close, period)
// upper  = middle + k·σ
// lower  = middle − k·σ
// with σ the population standard deviation over the same window.
//
// Output aligns with the input from index `period - 1`.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerPoint {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Full band series.
///
/// # Edge cases
/// - `period == 0` or `closes.len() < period` => empty vec
/// - Non-finite window results stop the series.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Vec<BollingerPoint> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let period_f = period as f64;
    let mut result = Vec::with_capacity(closes.len() - period + 1);

    for window in closes.windows(period) {
        let middle = window.iter().sum::<f64>() / period_f;
        let variance = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period_f;
        let sigma = variance.sqrt();

        let upper = middle + k * sigma;
        let lower = middle - k * sigma;

        if !upper.is_finite() || !lower.is_finite() {
            break;
        }
        result.push(BollingerPoint {
            upper,
            middle,
            lower,
        });
    }

    result
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        assert!(bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_empty());
    }

    #[test]
    fn exactly_period_yields_one_point() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let series = bollinger(&closes, 20, 2.0);
        assert_eq!(series.len(), 1);
        assert!((series[0].middle - 10.5).abs() < 1e-12);
        assert!(series[0].upper > series[0].middle);
        assert!(series[0].lower < series[0].middle);
    }

    #[test]
    fn flat_series_collapses_the_bands() {
        let closes = vec![100.0; 25];
        for point in bollinger(&closes, 20, 2.0) {
            assert!((point.upper - 100.0).abs() < 1e-12);
            assert!((point.middle - 100.0).abs() < 1e-12);
            assert!((point.lower - 100.0).abs() < 1e-12);
        }
    }

    #[test]
    fn bands_are_symmetric_around_middle() {
        let closes: Vec<f64> = (1..=40).map(|x| (x as f64 * 0.7).sin() * 3.0 + 50.0).collect();
        for point in bollinger(&closes, 20, 2.0) {
            let up = point.upper - point.middle;
            let down = point.middle - point.lower;
            assert!((up - down).abs() < 1e-9);
        }
    }

    #[test]
    fn wider_k_widens_the_bands() {
        let closes: Vec<f64> = (1..=30).map(|x| (x % 7) as f64 + 100.0).collect();
        let narrow = bollinger(&closes, 20, 1.0);
        let wide = bollinger(&closes, 20, 3.0);
        for (n, w) in narrow.iter().zip(wide.iter()) {
            assert!(w.upper >= n.upper);
            assert!(w.lower <= n.lower);
        }
    }
}
