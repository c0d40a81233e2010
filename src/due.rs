//! Due-tier evaluation: pure, deterministic rules deciding whether a tier
//! needs a backup right now.
//!
//! The hourly tier compares elapsed duration since the last success, which
//! tolerates scheduler jitter. The calendar tiers compare "buckets" (date,
//! ISO week, month, year): a tier stays due from its scheduled instant until
//! a success lands in the current bucket, so missed ticks are caught up but
//! a bucket never fires twice.

use chrono::{DateTime, Datelike, Duration, Utc};

use crate::policy::{ScheduleRule, Tier, TierConfig};

/// The dedup bucket key for a tier at a given instant.
///
/// Used both for dispatch-marker idempotency in the scheduler and for the
/// executor's duplicate-delivery check.
pub fn bucket_key(tier: Tier, now: DateTime<Utc>) -> String {
    match tier {
        Tier::Hourly => now.format("%Y-%m-%dT%H").to_string(),
        Tier::Daily => now.format("%Y-%m-%d").to_string(),
        Tier::Weekly => {
            let week = now.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        Tier::Monthly => now.format("%Y-%m").to_string(),
        Tier::Yearly => now.format("%Y").to_string(),
    }
}

/// Whether `cfg`'s tier is due at `now`, given the timestamp of the tier's
/// last successful backup (if any). Side-effect free.
pub fn is_due(cfg: &TierConfig, now: DateTime<Utc>, last_success: Option<DateTime<Utc>>) -> bool {
    if !cfg.enabled {
        return false;
    }

    match &cfg.rule {
        ScheduleRule::Hourly { interval_hours } => match last_success {
            None => true,
            Some(last) => {
                now.signed_duration_since(last) >= Duration::hours(i64::from(*interval_hours))
            }
        },
        ScheduleRule::Daily { time } => {
            time.reached_by(now.time())
                && last_success.map_or(true, |last| last.date_naive() != now.date_naive())
        }
        ScheduleRule::Weekly { time, day_of_week } => {
            now.weekday().num_days_from_sunday() == u32::from(*day_of_week)
                && time.reached_by(now.time())
                && last_success.map_or(true, |last| last.iso_week() != now.iso_week())
        }
        ScheduleRule::Monthly { time, day_of_month } => {
            now.day() == u32::from(*day_of_month)
                && time.reached_by(now.time())
                && last_success
                    .map_or(true, |last| (last.year(), last.month()) != (now.year(), now.month()))
        }
        ScheduleRule::Yearly {
            time,
            day_of_month,
            month,
        } => {
            now.month() == u32::from(*month)
                && now.day() == u32::from(*day_of_month)
                && time.reached_by(now.time())
                && last_success.map_or(true, |last| last.year() != now.year())
        }
    }
}
