use chrono::{DateTime, Datelike, Duration, FixedOffset, Utc};
use companion_core::Period;

/// Whether a recipient whose last delivery for `period` was `last_sent` is due at `now`.
///
/// Calendar comparisons happen in `now`'s offset:
/// - daily: never sent, or last sent on a different calendar day;
/// - weekly: never sent, or at least one full 7-day window has elapsed
///   (rolling, not aligned to a weekday);
/// - monthly: never sent, or last sent in a different (month, year).
pub fn is_due(period: Period, last_sent: Option<DateTime<Utc>>, now: DateTime<FixedOffset>) -> bool {
    let Some(last) = last_sent else {
        return true;
    };
    let last = last.with_timezone(now.offset());

    match period {
        Period::Daily => last.date_naive() != now.date_naive(),
        Period::Weekly => now.signed_duration_since(last) >= Duration::days(7),
        Period::Monthly => last.month() != now.month() || last.year() != now.year(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap().fixed_offset()
    }

    #[test]
    fn never_sent_is_always_due() {
        for p in Period::ALL {
            assert!(is_due(p, None, utc(2025, 3, 1, 8, 0)));
        }
    }

    #[test]
    fn daily_flips_at_midnight() {
        let last = Utc.with_ymd_and_hms(2025, 2, 28, 23, 59, 0).unwrap();
        assert!(is_due(Period::Daily, Some(last), utc(2025, 3, 1, 0, 1)));

        let last = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert!(!is_due(Period::Daily, Some(last), utc(2025, 3, 1, 0, 1)));
        assert!(!is_due(Period::Daily, Some(last), utc(2025, 3, 1, 23, 59)));
    }

    #[test]
    fn daily_uses_local_calendar_day() {
        // 02:00 UTC on Mar 2 is still Mar 1 in UTC-03:00.
        let brt = FixedOffset::west_opt(3 * 3600).unwrap();
        let last = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let now = Utc
            .with_ymd_and_hms(2025, 3, 2, 2, 0, 0)
            .unwrap()
            .with_timezone(&brt);
        assert!(!is_due(Period::Daily, Some(last), now));
        assert!(is_due(Period::Daily, Some(last), utc(2025, 3, 2, 2, 0)));
    }

    #[test]
    fn weekly_is_a_rolling_seven_day_window() {
        let now = utc(2025, 3, 10, 8, 0);
        let six_days = (now - Duration::days(6)).with_timezone(&Utc);
        let seven_days = (now - Duration::days(7)).with_timezone(&Utc);
        assert!(!is_due(Period::Weekly, Some(six_days), now));
        assert!(is_due(Period::Weekly, Some(seven_days), now));
    }

    #[test]
    fn monthly_crosses_boundary_without_28_days() {
        let last = Utc.with_ymd_and_hms(2025, 1, 31, 10, 0, 0).unwrap();
        assert!(is_due(Period::Monthly, Some(last), utc(2025, 2, 1, 8, 0)));
        assert!(!is_due(Period::Monthly, Some(last), utc(2025, 1, 31, 23, 0)));
    }

    #[test]
    fn monthly_same_month_other_year_is_due() {
        let last = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        assert!(is_due(Period::Monthly, Some(last), utc(2025, 3, 15, 10, 0)));
    }
}
