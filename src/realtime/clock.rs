// =============================================================================
// Market Clock — trading-session state from Taipei wall time
// =============================================================================
//
// Session schedule (Asia/Taipei):
//   Sat/Sun            closed (weekend)
//   weekday  < 08:30   closed
//   08:30 – 08:59      pre_market (call auction order collection)
//   09:00 – 13:29      open
//   13:30 – 14:29      after_hours (odd-lot / after-hours session)
//   >= 14:30           closed
//
// Exchange holidays are not encoded here; clients that need them consult the
// ingestion results. The `holiday` state exists in the protocol for feeds
// that do learn one.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Asia::Taipei;
use chrono_tz::Tz;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketState {
    PreMarket,
    Open,
    AfterHours,
    Closed,
    Holiday,
}

/// Derived session status, recomputed from the clock on every request.
#[derive(Debug, Clone, Serialize)]
pub struct MarketStatus {
    pub is_open: bool,
    pub state: MarketState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_open_time: Option<DateTime<Tz>>,
    pub server_time: DateTime<Tz>,
}

/// Status for the current instant.
pub fn current_market_status() -> MarketStatus {
    market_status_at(Utc::now().with_timezone(&Taipei))
}

/// Status for an arbitrary Taipei instant. Pure, so every boundary is
/// testable.
pub fn market_status_at(now: DateTime<Tz>) -> MarketStatus {
    let weekday = now.weekday();
    let minutes = now.hour() * 60 + now.minute();

    if matches!(weekday, Weekday::Sat | Weekday::Sun) {
        return MarketStatus {
            is_open: false,
            state: MarketState::Closed,
            message: "weekend".to_string(),
            next_open_time: Some(next_open_after(now)),
            server_time: now,
        };
    }

    // Weekday schedule, by minutes since midnight.
    let (state, is_open, message) = if minutes < 8 * 60 + 30 {
        (MarketState::Closed, false, "before pre-market")
    } else if minutes < 9 * 60 {
        (MarketState::PreMarket, false, "pre-market call auction")
    } else if minutes < 13 * 60 + 30 {
        (MarketState::Open, true, "regular session")
    } else if minutes < 14 * 60 + 30 {
        (MarketState::AfterHours, false, "after-hours session")
    } else {
        (MarketState::Closed, false, "closed")
    };

    let next_open_time = if is_open {
        None
    } else {
        Some(next_open_after(now))
    };

    MarketStatus {
        is_open,
        state,
        message: message.to_string(),
        next_open_time,
        server_time: now,
    }
}

/// The next 09:00 session open strictly relevant to `now`: today if the open
/// is still ahead on a weekday, otherwise the next weekday.
fn next_open_after(now: DateTime<Tz>) -> DateTime<Tz> {
    let mut day = now.date_naive();
    let today_is_weekday = !matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
    let before_open = now.hour() < 9;

    if !(today_is_weekday && before_open) {
        day += Duration::days(1);
        while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            day += Duration::days(1);
        }
    }

    Taipei
        .with_ymd_and_hms(day.year(), day.month(), day.day(), 9, 0, 0)
        .single()
        .expect("09:00 Taipei always exists")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn taipei(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> DateTime<Tz> {
        Taipei.with_ymd_and_hms(y, m, d, hh, mm, ss).unwrap()
    }

    // 2024-01-01 is a Monday.

    #[test]
    fn monday_just_before_open_is_closed() {
        let status = market_status_at(taipei(2024, 1, 1, 8, 59, 59));
        assert!(!status.is_open);
        assert_eq!(status.state, MarketState::PreMarket);
    }

    #[test]
    fn monday_at_open_is_open() {
        let status = market_status_at(taipei(2024, 1, 1, 9, 0, 0));
        assert!(status.is_open);
        assert_eq!(status.state, MarketState::Open);
        assert!(status.next_open_time.is_none());
    }

    #[test]
    fn early_morning_is_closed_with_today_open() {
        let status = market_status_at(taipei(2024, 1, 1, 7, 15, 0));
        assert_eq!(status.state, MarketState::Closed);
        assert_eq!(status.next_open_time, Some(taipei(2024, 1, 1, 9, 0, 0)));
    }

    #[test]
    fn pre_market_window() {
        let status = market_status_at(taipei(2024, 1, 1, 8, 30, 0));
        assert_eq!(status.state, MarketState::PreMarket);
        assert!(!status.is_open);
        assert_eq!(status.next_open_time, Some(taipei(2024, 1, 1, 9, 0, 0)));
    }

    #[test]
    fn last_trading_minute_is_open() {
        let status = market_status_at(taipei(2024, 1, 1, 13, 29, 59));
        assert!(status.is_open);
    }

    #[test]
    fn after_hours_window() {
        let status = market_status_at(taipei(2024, 1, 1, 13, 30, 0));
        assert_eq!(status.state, MarketState::AfterHours);
        assert!(!status.is_open);
        // Next open is tomorrow.
        assert_eq!(status.next_open_time, Some(taipei(2024, 1, 2, 9, 0, 0)));
    }

    #[test]
    fn late_afternoon_closed_rolls_to_next_day() {
        let status = market_status_at(taipei(2024, 1, 1, 14, 30, 0));
        assert_eq!(status.state, MarketState::Closed);
        assert_eq!(status.next_open_time, Some(taipei(2024, 1, 2, 9, 0, 0)));
    }

    #[test]
    fn friday_close_rolls_over_the_weekend() {
        // 2024-01-05 is a Friday.
        let status = market_status_at(taipei(2024, 1, 5, 15, 0, 0));
        assert_eq!(status.next_open_time, Some(taipei(2024, 1, 8, 9, 0, 0)));
    }

    #[test]
    fn weekend_reports_next_monday() {
        // 2024-01-06 is a Saturday.
        let status = market_status_at(taipei(2024, 1, 6, 11, 0, 0));
        assert_eq!(status.state, MarketState::Closed);
        assert_eq!(status.message, "weekend");
        assert_eq!(status.next_open_time, Some(taipei(2024, 1, 8, 9, 0, 0)));

        // Sunday morning too.
        let status = market_status_at(taipei(2024, 1, 7, 8, 0, 0));
        assert_eq!(status.next_open_time, Some(taipei(2024, 1, 8, 9, 0, 0)));
    }
}
