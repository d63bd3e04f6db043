// =============================================================================
// Indicator Engine — store-fed computation with a parameter-keyed cache
// =============================================================================
//
// Closes (and highs/lows for KDJ) come newest-first from the market store and
// are reversed to chronological order before the math runs. Computation is
// f64 for speed; returned values are decimals rounded to 4 places. Warm-up
// NaN points never appear: the pure kernels only emit finite values and the
// conversion drops anything non-finite.
//
// Cache: the FULL computed series is stored per (symbol, indicator,
// normalized params) with a TTL; reads tail-slice `limit` points from a live
// entry. Writes to the underlying bars do not invalidate — `clear(symbol)`
// and TTL expiry are the only evictions.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::params;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::CoreError;
use crate::indicators::{bollinger, kdj, ma, macd, rsi};
use crate::ledger::events::parse_rfc3339;
use crate::market::{MarketStore, OhlcvBar, Timeframe};
use crate::storage::Database;

/// Upper bound on the history fed into one computation.
const MAX_SERIES: usize = 5000;

/// Decimal places on returned values.
const VALUE_DP: u32 = 4;

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaType {
    Sma,
    Ema,
}

impl MaType {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.to_ascii_uppercase().as_str() {
            "SMA" => Ok(Self::Sma),
            "EMA" => Ok(Self::Ema),
            other => Err(CoreError::validation(format!(
                "unknown moving-average type '{other}': expected SMA or EMA"
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Sma => "SMA",
            Self::Ema => "EMA",
        }
    }
}

fn check_range(name: &str, value: usize, min: usize, max: usize) -> Result<(), CoreError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::validation(format!(
            "{name} must be in [{min}, {max}], got {value}"
        )))
    }
}

// =============================================================================
// Output
// =============================================================================

/// One chronological output point. The value map is flattened into the JSON
/// object: `{"timestamp": ..., "value": ...}` or `{"timestamp": ...,
/// "macd": ..., "signal": ..., "histogram": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub timestamp: NaiveDate,
    #[serde(flatten)]
    pub values: BTreeMap<String, Decimal>,
}

fn point(timestamp: NaiveDate, pairs: &[(&str, f64)]) -> Option<IndicatorPoint> {
    let mut values = BTreeMap::new();
    for (key, raw) in pairs {
        if !raw.is_finite() {
            return None;
        }
        values.insert(
            (*key).to_string(),
            Decimal::from_f64(*raw)?.round_dp(VALUE_DP),
        );
    }
    Some(IndicatorPoint { timestamp, values })
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Clone)]
pub struct IndicatorEngine {
    db: Database,
    market: MarketStore,
    ttl: Duration,
}

impl IndicatorEngine {
    pub fn new(db: Database, market: MarketStore, ttl_hours: i64) -> Self {
        Self {
            db,
            market,
            ttl: Duration::hours(ttl_hours),
        }
    }

    // ── Public indicators ───────────────────────────────────────────────

    pub fn moving_average(
        &self,
        symbol: &str,
        period: usize,
        ma_type: MaType,
        limit: usize,
    ) -> Result<Vec<IndicatorPoint>, CoreError> {
        check_range("period", period, 2, 200)?;
        let key_params = format!("period={period},type={}", ma_type.as_str());

        self.cached(symbol, "ma", &key_params, limit, |bars| {
            let closes = closes_of(bars);
            require_points(closes.len(), period)?;

            let series = match ma_type {
                MaType::Sma => ma::sma(&closes, period),
                MaType::Ema => ma::ema(&closes, period),
            };
            Ok(attach_single(bars, period - 1, &series))
        })
    }

    pub fn rsi(
        &self,
        symbol: &str,
        period: usize,
        limit: usize,
    ) -> Result<Vec<IndicatorPoint>, CoreError> {
        check_range("period", period, 2, 100)?;
        let key_params = format!("period={period}");

        self.cached(symbol, "rsi", &key_params, limit, |bars| {
            let closes = closes_of(bars);
            require_points(closes.len(), period + 1)?;

            let series = rsi::rsi(&closes, period);
            Ok(attach_single(bars, period, &series))
        })
    }

    pub fn macd(
        &self,
        symbol: &str,
        fast: usize,
        slow: usize,
        signal: usize,
        limit: usize,
    ) -> Result<Vec<IndicatorPoint>, CoreError> {
        check_range("fast", fast, 2, 100)?;
        check_range("slow", slow, 3, 200)?;
        check_range("signal", signal, 1, 50)?;
        if fast >= slow {
            return Err(CoreError::validation("fast period must be below slow"));
        }
        let key_params = format!("fast={fast},slow={slow},signal={signal}");

        self.cached(symbol, "macd", &key_params, limit, |bars| {
            let closes = closes_of(bars);
            require_points(closes.len(), slow + signal - 1)?;

            let offset = slow + signal - 2;
            let series = macd::macd(&closes, fast, slow, signal);
            Ok(series
                .iter()
                .enumerate()
                .filter_map(|(i, p)| {
                    point(
                        bars[offset + i].ts,
                        &[
                            ("macd", p.macd),
                            ("signal", p.signal),
                            ("histogram", p.histogram),
                        ],
                    )
                })
                .collect())
        })
    }

    pub fn bollinger(
        &self,
        symbol: &str,
        period: usize,
        stddev: f64,
        limit: usize,
    ) -> Result<Vec<IndicatorPoint>, CoreError> {
        check_range("period", period, 2, 200)?;
        if !(stddev > 0.0 && stddev <= 10.0) {
            return Err(CoreError::validation(
                "stddev must be in (0, 10]",
            ));
        }
        let key_params = format!("period={period},stddev={stddev}");

        self.cached(symbol, "bb", &key_params, limit, |bars| {
            let closes = closes_of(bars);
            require_points(closes.len(), period)?;

            let series = bollinger::bollinger(&closes, period, stddev);
            Ok(series
                .iter()
                .enumerate()
                .filter_map(|(i, p)| {
                    point(
                        bars[period - 1 + i].ts,
                        &[("upper", p.upper), ("middle", p.middle), ("lower", p.lower)],
                    )
                })
                .collect())
        })
    }

    pub fn kdj(
        &self,
        symbol: &str,
        period: usize,
        limit: usize,
    ) -> Result<Vec<IndicatorPoint>, CoreError> {
        check_range("period", period, 2, 100)?;
        let key_params = format!("period={period}");

        self.cached(symbol, "kdj", &key_params, limit, |bars| {
            require_points(bars.len(), period)?;

            let highs: Vec<f64> = bars.iter().map(|b| dec_f64(&b.high)).collect();
            let lows: Vec<f64> = bars.iter().map(|b| dec_f64(&b.low)).collect();
            let closes = closes_of(bars);

            let series = kdj::kdj(&highs, &lows, &closes, period);
            Ok(series
                .iter()
                .enumerate()
                .filter_map(|(i, p)| {
                    point(
                        bars[period - 1 + i].ts,
                        &[("k", p.k), ("d", p.d), ("j", p.j)],
                    )
                })
                .collect())
        })
    }

    /// Compute several indicators in one call. Per-indicator failures are
    /// embedded as `{"error": ...}` so one bad parameter does not void the
    /// rest of the batch.
    pub fn batch(
        &self,
        symbol: &str,
        names: &[String],
        params: &Value,
        limit: usize,
    ) -> Result<BTreeMap<String, Value>, CoreError> {
        let mut out = BTreeMap::new();

        for name in names {
            let result = match name.as_str() {
                "ma" => {
                    let ma_type = match params.get("type").and_then(Value::as_str) {
                        Some(raw) => MaType::parse(raw)?,
                        None => MaType::Sma,
                    };
                    self.moving_average(symbol, param_usize(params, "period", 20), ma_type, limit)
                }
                "rsi" => self.rsi(symbol, param_usize(params, "period", 14), limit),
                "macd" => self.macd(
                    symbol,
                    param_usize(params, "fast", 12),
                    param_usize(params, "slow", 26),
                    param_usize(params, "signal", 9),
                    limit,
                ),
                "bb" => self.bollinger(
                    symbol,
                    param_usize(params, "period", 20),
                    params
                        .get("stddev")
                        .and_then(Value::as_f64)
                        .unwrap_or(2.0),
                    limit,
                ),
                "kdj" => self.kdj(symbol, param_usize(params, "period", 9), limit),
                other => Err(CoreError::validation(format!(
                    "unknown indicator '{other}'"
                ))),
            };

            let entry = match result {
                Ok(points) => serde_json::to_value(points)
                    .map_err(|e| CoreError::Internal(e.into()))?,
                Err(CoreError::Internal(e)) => return Err(CoreError::Internal(e)),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            };
            out.insert(name.clone(), entry);
        }

        Ok(out)
    }

    /// Drop every cached series for a symbol.
    pub fn clear(&self, raw_symbol: &str) -> Result<usize, CoreError> {
        let sym = crate::symbol::canonicalize(raw_symbol)?;
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM indicator_cache WHERE symbol = ?1",
                params![sym],
            )?)
        })?;
        debug!(symbol = %sym, removed, "indicator cache cleared");
        Ok(removed)
    }

    // ── Cache plumbing ──────────────────────────────────────────────────

    fn cached(
        &self,
        raw_symbol: &str,
        indicator: &str,
        key_params: &str,
        limit: usize,
        compute: impl FnOnce(&[OhlcvBar]) -> Result<Vec<IndicatorPoint>, CoreError>,
    ) -> Result<Vec<IndicatorPoint>, CoreError> {
        if limit == 0 {
            return Err(CoreError::validation("limit must be positive"));
        }
        let sym = crate::symbol::canonicalize(raw_symbol)?;
        let cache_key = format!("{sym}:{indicator}:{key_params}");
        let now = Utc::now();

        if let Some(series) = self.cache_lookup(&cache_key, now)? {
            debug!(key = %cache_key, "indicator cache hit");
            return Ok(tail(series, limit));
        }

        // Miss: pull ascending history and run the kernel.
        let mut bars = self
            .market
            .get_bars(&sym, None, None, MAX_SERIES, Timeframe::Daily)?;
        bars.reverse();

        let series = compute(&bars)?;
        self.cache_store(&cache_key, &sym, &series, now)?;
        Ok(tail(series, limit))
    }

    fn cache_lookup(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<IndicatorPoint>>, CoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT data, expires_at FROM indicator_cache WHERE cache_key = ?1",
            )?;
            let mut rows = stmt.query_map(params![cache_key], |row| {
                let data: String = row.get(0)?;
                let expires_at: String = row.get(1)?;
                Ok((data, parse_rfc3339(1, &expires_at)?))
            })?;

            match rows.next() {
                Some(row) => {
                    let (data, expires_at) = row?;
                    if expires_at <= now {
                        return Ok(None);
                    }
                    let series: Vec<IndicatorPoint> = serde_json::from_str(&data)
                        .map_err(|e| CoreError::Internal(e.into()))?;
                    Ok(Some(series))
                }
                None => Ok(None),
            }
        })
    }

    fn cache_store(
        &self,
        cache_key: &str,
        symbol: &str,
        series: &[IndicatorPoint],
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let data = serde_json::to_string(series).map_err(|e| CoreError::Internal(e.into()))?;
        let expires_at = now + self.ttl;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO indicator_cache (cache_key, symbol, data, calculated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    data = excluded.data,
                    calculated_at = excluded.calculated_at,
                    expires_at = excluded.expires_at",
                params![
                    cache_key,
                    symbol,
                    data,
                    now.to_rfc3339(),
                    expires_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn closes_of(bars: &[OhlcvBar]) -> Vec<f64> {
    bars.iter().map(|b| dec_f64(&b.close)).collect()
}

fn dec_f64(value: &Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(f64::NAN)
}

fn require_points(have: usize, need: usize) -> Result<(), CoreError> {
    if have < need {
        Err(CoreError::insufficient_data(format!(
            "need at least {need} data points, have {have}"
        )))
    } else {
        Ok(())
    }
}

fn attach_single(bars: &[OhlcvBar], offset: usize, series: &[f64]) -> Vec<IndicatorPoint> {
    series
        .iter()
        .enumerate()
        .filter_map(|(i, &v)| point(bars[offset + i].ts, &[("value", v)]))
        .collect()
}

fn tail(series: Vec<IndicatorPoint>, limit: usize) -> Vec<IndicatorPoint> {
    let skip = series.len().saturating_sub(limit);
    series.into_iter().skip(skip).collect()
}

fn param_usize(params: &Value, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}
