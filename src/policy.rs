//! Backup policy model: the five retention tiers, their schedule rules,
//! and validation.
//!
//! A policy always carries exactly five tier configurations, one per member
//! of the closed tier set. A policy with every tier disabled is legal and
//! simply produces no backups.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The closed set of retention tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Tier {
    /// All tiers in evaluation order.
    pub const ALL: [Tier; 5] = [
        Tier::Hourly,
        Tier::Daily,
        Tier::Weekly,
        Tier::Monthly,
        Tier::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hourly => "hourly",
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Yearly => "yearly",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hourly" => Ok(Tier::Hourly),
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            "yearly" => Ok(Tier::Yearly),
            other => Err(Error::Policy(format!("unknown tier: {}", other))),
        }
    }
}

/// Wall-clock time of day in the engine's reference timezone (UTC).
///
/// Serialized as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::Policy(format!(
                "invalid time of day: {:02}:{:02}",
                hour, minute
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Whether `now`'s time-of-day has reached this time.
    pub fn reached_by(&self, now: chrono::NaiveTime) -> bool {
        use chrono::Timelike;
        (now.hour(), now.minute()) >= (u32::from(self.hour), u32::from(self.minute))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let (h, m) = value
            .split_once(':')
            .ok_or_else(|| Error::Policy(format!("invalid time of day: {}", value)))?;
        let hour: u8 = h
            .parse()
            .map_err(|_| Error::Policy(format!("invalid time of day: {}", value)))?;
        let minute: u8 = m
            .parse()
            .map_err(|_| Error::Policy(format!("invalid time of day: {}", value)))?;
        TimeOfDay::new(hour, minute)
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        format!("{:02}:{:02}", value.hour, value.minute)
    }
}

/// Schedule rule for one tier. The variant shape depends on the tier:
/// hourly runs on an elapsed interval, the others on calendar instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleRule {
    Hourly {
        interval_hours: u32,
    },
    Daily {
        time: TimeOfDay,
    },
    Weekly {
        time: TimeOfDay,
        /// 0 = Sunday through 6 = Saturday.
        day_of_week: u8,
    },
    Monthly {
        time: TimeOfDay,
        /// 1-28. Capped below 29 to avoid short-month ambiguity.
        day_of_month: u8,
    },
    Yearly {
        time: TimeOfDay,
        day_of_month: u8,
        /// 1-12.
        month: u8,
    },
}

impl ScheduleRule {
    /// The tier this rule shape belongs to.
    pub fn tier(&self) -> Tier {
        match self {
            ScheduleRule::Hourly { .. } => Tier::Hourly,
            ScheduleRule::Daily { .. } => Tier::Daily,
            ScheduleRule::Weekly { .. } => Tier::Weekly,
            ScheduleRule::Monthly { .. } => Tier::Monthly,
            ScheduleRule::Yearly { .. } => Tier::Yearly,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            ScheduleRule::Hourly { interval_hours } => {
                if *interval_hours == 0 {
                    return Err(Error::Policy(
                        "hourly interval_hours must be at least 1".to_string(),
                    ));
                }
            }
            ScheduleRule::Daily { .. } => {}
            ScheduleRule::Weekly { day_of_week, .. } => {
                if *day_of_week > 6 {
                    return Err(Error::Policy(format!(
                        "weekly day_of_week must be 0-6, got {}",
                        day_of_week
                    )));
                }
            }
            ScheduleRule::Monthly { day_of_month, .. } => {
                validate_day_of_month(*day_of_month)?;
            }
            ScheduleRule::Yearly {
                day_of_month,
                month,
                ..
            } => {
                validate_day_of_month(*day_of_month)?;
                if !(1..=12).contains(month) {
                    return Err(Error::Policy(format!(
                        "yearly month must be 1-12, got {}",
                        month
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_day_of_month(day: u8) -> Result<()> {
    // Capped at 28 so the rule fires in every month, including February.
    if !(1..=28).contains(&day) {
        return Err(Error::Policy(format!(
            "day_of_month must be 1-28, got {}",
            day
        )));
    }
    Ok(())
}

/// Configuration for a single tier: whether it runs, how many completed
/// artifacts to retain, and when it is due.
///
/// `keep_count` of 0 means "retain nothing": pruning removes every completed
/// artifact except the one that triggered the prune pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub enabled: bool,
    pub keep_count: u32,
    pub rule: ScheduleRule,
}

impl TierConfig {
    pub fn disabled(rule: ScheduleRule) -> Self {
        Self {
            enabled: false,
            keep_count: 0,
            rule,
        }
    }
}

/// The five tier configurations of a policy, keyed by tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSet {
    pub hourly: TierConfig,
    pub daily: TierConfig,
    pub weekly: TierConfig,
    pub monthly: TierConfig,
    pub yearly: TierConfig,
}

impl TierSet {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Hourly => &self.hourly,
            Tier::Daily => &self.daily,
            Tier::Weekly => &self.weekly,
            Tier::Monthly => &self.monthly,
            Tier::Yearly => &self.yearly,
        }
    }

    /// A set with every tier disabled, using default rule shapes.
    pub fn all_disabled() -> Self {
        Self {
            hourly: TierConfig::disabled(ScheduleRule::Hourly { interval_hours: 1 }),
            daily: TierConfig::disabled(ScheduleRule::Daily {
                time: TimeOfDay { hour: 0, minute: 0 },
            }),
            weekly: TierConfig::disabled(ScheduleRule::Weekly {
                time: TimeOfDay { hour: 0, minute: 0 },
                day_of_week: 0,
            }),
            monthly: TierConfig::disabled(ScheduleRule::Monthly {
                time: TimeOfDay { hour: 0, minute: 0 },
                day_of_month: 1,
            }),
            yearly: TierConfig::disabled(ScheduleRule::Yearly {
                time: TimeOfDay { hour: 0, minute: 0 },
                day_of_month: 1,
                month: 1,
            }),
        }
    }
}

/// A backup policy: identity, display name, and one configuration per tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub id: String,
    pub name: String,
    pub tiers: TierSet,
}

impl BackupPolicy {
    /// Validate every tier: rule ranges and that each rule's shape matches
    /// the tier it is configured under.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            let cfg = self.tiers.get(tier);
            if cfg.rule.tier() != tier {
                return Err(Error::Policy(format!(
                    "{} tier configured with a {} rule",
                    tier,
                    cfg.rule.tier()
                )));
            }
            cfg.rule.validate()?;
        }
        Ok(())
    }
}
