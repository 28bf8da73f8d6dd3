use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use companion_core::Period;

/// Compute the UTC instant a new job for `period` should be scheduled at.
///
/// `now` carries the configured local offset; `sending_hour` is local.
///
/// - daily: today's slot, even when it has already passed (the job is then
///   immediately ready). Rolls to tomorrow only when `last_sent` is today.
/// - weekly: the next Monday, 1 to 7 days ahead (a Monday rolls a full week).
/// - monthly: the 1st of the next month.
///
/// Returns `None` only if the calendar arithmetic overflows.
pub fn scheduled_for(
    period: Period,
    now: DateTime<FixedOffset>,
    sending_hour: u32,
    last_sent: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let offset = *now.offset();
    let today = now.date_naive();

    let date = match period {
        Period::Daily => {
            let sent_today = last_sent
                .map(|t| t.with_timezone(&offset).date_naive() == today)
                .unwrap_or(false);
            if sent_today {
                today.succ_opt()?
            } else {
                today
            }
        }
        Period::Weekly => {
            // 1 = Monday when counting from Sunday.
            let from_sunday = now.weekday().num_days_from_sunday() as i64;
            let ahead = match (1 + 7 - from_sunday) % 7 {
                0 => 7,
                n => n,
            };
            today.checked_add_signed(Duration::days(ahead))?
        }
        Period::Monthly => {
            let (y, m) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            NaiveDate::from_ymd_opt(y, m, 1)?
        }
    };

    let at = NaiveTime::from_hms_opt(sending_hour.min(23), 0, 0)?;
    offset
        .from_local_datetime(&date.and_time(at))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// E-mail subject line for a report whose range starts at `range_start`.
pub fn subject_for(period: Period, range_start: DateTime<Utc>, offset: FixedOffset) -> String {
    let start = range_start.with_timezone(&offset);
    match period {
        Period::Daily => format!("Daily report - {}", start.format("%d/%m/%Y")),
        Period::Weekly => {
            let end = start + Duration::days(6);
            format!(
                "Weekly report - {} to {}",
                start.format("%d/%m/%Y"),
                end.format("%d/%m/%Y")
            )
        }
        Period::Monthly => format!("Monthly report - {}", start.format("%B %Y")),
    }
}
