//! Billing period arithmetic: next period boundaries and period ids.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use service_core::error::AppError;

use crate::models::BillingPeriod;

/// Upper bound on periods walked while locating an event's period.
const MAX_PERIOD_ITERATIONS: usize = 100;

/// Start of the period following the one starting at `current`.
///
/// The time of day always comes from `anchor`. Monthly-based cadences land on
/// the anchor's day of month, clamped to the last day of the target month.
/// Annual cadences keep the anchor's month.
pub fn next_billing_date(
    current: DateTime<Utc>,
    anchor: DateTime<Utc>,
    unit: i32,
    period: BillingPeriod,
) -> Result<DateTime<Utc>, AppError> {
    if unit <= 0 {
        return Err(AppError::ValidationError(format!(
            "billing period unit must be a positive integer, got {}",
            unit
        )));
    }

    let months = match period {
        BillingPeriod::Daily => return Ok(current + Duration::days(i64::from(unit))),
        BillingPeriod::Weekly => {
            let anchor_weekday = anchor.weekday().num_days_from_sunday() as i64;
            let current_weekday = current.weekday().num_days_from_sunday() as i64;
            let days_to_add = if anchor_weekday == current_weekday {
                i64::from(unit) * 7
            } else {
                (anchor_weekday - current_weekday).rem_euclid(7) + i64::from(unit - 1) * 7
            };
            let date = current.date_naive() + Duration::days(days_to_add);
            return at_anchor_clock(date, anchor);
        }
        BillingPeriod::Monthly => unit,
        BillingPeriod::Quarterly => unit * 3,
        BillingPeriod::HalfYearly => unit * 6,
        BillingPeriod::Annual => unit * 12,
    };

    let total_months = current.year() * 12 + current.month0() as i32 + months;
    let target_year = total_months.div_euclid(12);
    let target_month = if period == BillingPeriod::Annual {
        anchor.month()
    } else {
        total_months.rem_euclid(12) as u32 + 1
    };

    let last_day = last_day_of_month(target_year, target_month)?;
    let mut target_day = anchor.day().min(last_day);
    if period == BillingPeriod::Annual
        && anchor.month() == 2
        && anchor.day() == 29
        && !is_leap_year(target_year)
    {
        target_day = 28;
    }

    let date = NaiveDate::from_ymd_opt(target_year, target_month, target_day).ok_or_else(|| {
        AppError::ValidationError(format!(
            "invalid billing date {}-{}-{}",
            target_year, target_month, target_day
        ))
    })?;
    at_anchor_clock(date, anchor)
}

/// Epoch-millisecond start of the billing period containing `ts`.
///
/// Events inside the current period resolve immediately. Earlier events are
/// located by walking forward from the subscription start; later events by
/// walking forward from the current period.
pub fn calculate_period_id(
    ts: DateTime<Utc>,
    sub_start: DateTime<Utc>,
    current_start: DateTime<Utc>,
    current_end: DateTime<Utc>,
    anchor: DateTime<Utc>,
    unit: i32,
    period: BillingPeriod,
) -> Result<u64, AppError> {
    if ts < sub_start {
        return Err(AppError::ValidationError(format!(
            "event timestamp {} is before subscription start {}",
            ts, sub_start
        )));
    }

    if is_between(ts, current_start, current_end) {
        return Ok(period_id(current_start));
    }

    if ts < current_start {
        let mut start = sub_start;
        let mut end = next_billing_date(start, anchor, unit, period)?;
        for _ in 0..MAX_PERIOD_ITERATIONS {
            if is_between(ts, start, end) {
                return Ok(period_id(start));
            }
            if start >= current_start {
                break;
            }
            start = end;
            end = next_billing_date(start, anchor, unit, period)?;
        }
        return Err(AppError::ValidationError(format!(
            "no billing period found for past event at {}",
            ts
        )));
    }

    let mut start = current_start;
    for _ in 0..MAX_PERIOD_ITERATIONS {
        let next_start = next_billing_date(start, anchor, unit, period)?;
        let next_end = next_billing_date(next_start, anchor, unit, period)?;
        if is_between(ts, next_start, next_end) {
            return Ok(period_id(next_start));
        }
        start = next_start;
    }

    Err(AppError::ValidationError(format!(
        "no billing period found for event at {}",
        ts
    )))
}

/// Period id for a period starting at `start`.
pub fn period_id(start: DateTime<Utc>) -> u64 {
    (start.timestamp() * 1000).max(0) as u64
}

/// Inverse of [`period_id`].
pub fn period_start(period_id: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(i64::try_from(period_id).ok()?)
}

fn is_between(ts: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    ts >= start && ts < end
}

fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn last_day_of_month(year: i32, month: u32) -> Result<u32, AppError> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .ok_or_else(|| AppError::ValidationError(format!("invalid month {}-{}", year, month)))
}

fn at_anchor_clock(date: NaiveDate, anchor: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    date.and_hms_opt(anchor.hour(), anchor.minute(), anchor.second())
        .map(|dt| dt.and_utc())
        .ok_or_else(|| AppError::ValidationError(format!("invalid billing time on {}", date)))
}
