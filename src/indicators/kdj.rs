// =============================================================================
// KDJ — stochastic oscillator with the J divergence line
// =============================================================================
//
// RSV_t = (close_t − lowest_low(period)) / (highest_high(period) − lowest_low(period)) · 100
// K_t   = 2/3 · K_{t-1} + 1/3 · RSV_t      (fixed smoothing 3)
// D_t   = 2/3 · D_{t-1} + 1/3 · K_t        (fixed smoothing 3)
// J_t   = 3·K_t − 2·D_t
//
// K and D seed at 50. A flat window (high == low) carries RSV = 50.
// Output aligns with the input from index `period - 1`.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KdjPoint {
    pub k: f64,
    pub d: f64,
    pub j: f64,
}

/// Full KDJ series over aligned high/low/close slices.
///
/// # Edge cases
/// - `period == 0`, mismatched slice lengths, or fewer than `period` points
///   => empty vec
pub fn kdj(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<KdjPoint> {
    let len = closes.len();
    if period == 0 || len < period || highs.len() != len || lows.len() != len {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(len - period + 1);
    let mut k = 50.0_f64;
    let mut d = 50.0_f64;

    for t in (period - 1)..len {
        let window = (t + 1 - period)..=t;
        let highest = highs[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let lowest = lows[window].iter().cloned().fold(f64::MAX, f64::min);

        let range = highest - lowest;
        let rsv = if range == 0.0 {
            50.0
        } else {
            (closes[t] - lowest) / range * 100.0
        };

        if !rsv.is_finite() {
            break;
        }

        k = (2.0 * k + rsv) / 3.0;
        d = (2.0 * d + k) / 3.0;
        result.push(KdjPoint {
            k,
            d,
            j: 3.0 * k - 2.0 * d,
        });
    }

    result
}
