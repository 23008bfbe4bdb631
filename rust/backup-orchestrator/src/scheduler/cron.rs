//! Cron expression parsing and evaluation.
//!
//! Supports the standard 5-field form `minute hour day month weekday`, the
//! 6-field form with a leading seconds field, and the `@hourly`-style
//! descriptors. All evaluation is in UTC.

use anyhow::{Context, bail};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

use crate::error::{OrchestratorError, Result};

/// Years searched ahead before concluding an expression never fires
/// (e.g. `0 0 31 2 *`).
const SEARCH_YEARS: i32 = 8;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    second: CronField,
    minute: CronField,
    hour: CronField,
    /// Day of month (1-31).
    day: CronField,
    /// Month (1-12).
    month: CronField,
    /// Day of week (0-6, Sunday = 0; 7 is accepted as Sunday).
    weekday: CronField,
}

/// Allowed values of one field as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    bits: u64,
    /// False when the field was written as `*` (possibly with a step).
    restricted: bool,
}

impl CronField {
    fn matches(self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }
}

/// Cron expression parser.
pub struct CronParser;

impl CronParser {
    /// Parse a cron expression string.
    ///
    /// # Examples
    ///
    /// - `0 0 * * *` - daily at midnight
    /// - `*/5 * * * *` - every 5 minutes
    /// - `0 0 * * * *` - at the top of every hour (6-field)
    /// - `0 9-17 * * mon-fri` - hourly during office hours
    /// - `@daily`
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidCron`] if the expression is invalid.
    pub fn parse(expr: &str) -> Result<CronExpression> {
        Self::parse_inner(expr).map_err(|e| OrchestratorError::InvalidCron {
            expression: expr.to_string(),
            reason: format!("{e:#}"),
        })
    }

    fn parse_inner(expr: &str) -> anyhow::Result<CronExpression> {
        let trimmed = expr.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            "@monthly" => "0 0 0 1 * *",
            "@weekly" => "0 0 0 * * 0",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@hourly" => "0 0 * * * *",
            other if other.starts_with('@') => bail!("unknown descriptor {other}"),
            _ => trimmed,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        let (second, rest) = match parts.len() {
            5 => (
                CronField {
                    bits: 1,
                    restricted: true,
                },
                &parts[..],
            ),
            6 => (
                Self::parse_field(parts[0], 0, 59, None).context("Invalid second field")?,
                &parts[1..],
            ),
            n => bail!("expected 5 or 6 fields, got {n}"),
        };

        let mut weekday =
            Self::parse_field(rest[4], 0, 7, Some(&DAY_NAMES[..])).context("Invalid weekday field")?;
        // 7 is Sunday too.
        if weekday.matches(7) {
            weekday.bits = (weekday.bits & !(1u64 << 7)) | 1;
        }

        Ok(CronExpression {
            source: trimmed.to_string(),
            second,
            minute: Self::parse_field(rest[0], 0, 59, None).context("Invalid minute field")?,
            hour: Self::parse_field(rest[1], 0, 23, None).context("Invalid hour field")?,
            day: Self::parse_field(rest[2], 1, 31, None).context("Invalid day field")?,
            month: Self::parse_field(rest[3], 1, 12, Some(&MONTH_NAMES[..]))
                .context("Invalid month field")?,
            weekday,
        })
    }

    fn parse_field(field: &str, min: u32, max: u32, names: Option<&[&str]>) -> anyhow::Result<CronField> {
        let mut bits = 0u64;
        let mut restricted = false;

        for part in field.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().context("Invalid step value")?;
                    if step == 0 || step > max {
                        bail!("step must be 1-{max}");
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else {
                restricted = true;
                match range.split_once('-') {
                    Some((a, b)) => {
                        let start = Self::parse_value(a, min, max, names)?;
                        let end = Self::parse_value(b, min, max, names)?;
                        if start > end {
                            bail!("range start {start} is after end {end}");
                        }
                        (start, end)
                    }
                    // `a/n` runs from a to the top of the field.
                    None if step > 1 => (Self::parse_value(range, min, max, names)?, max),
                    None => {
                        let value = Self::parse_value(range, min, max, names)?;
                        (value, value)
                    }
                }
            };

            for value in (start..=end).step_by(step as usize) {
                bits |= 1u64 << value;
            }
        }

        Ok(CronField { bits, restricted })
    }

    fn parse_value(raw: &str, min: u32, max: u32, names: Option<&[&str]>) -> anyhow::Result<u32> {
        let lower = raw.to_ascii_lowercase();
        let named = names.and_then(|names| names.iter().position(|n| *n == lower));
        let value = match named {
            // Month names are 1-based, day names 0-based.
            Some(idx) => u32::try_from(idx)? + min,
            None => raw
                .parse()
                .with_context(|| format!("Invalid numeric value '{raw}'"))?,
        };
        if value < min || value > max {
            bail!("value {value} must be {min}-{max}");
        }
        Ok(value)
    }
}

impl CronExpression {
    /// The expression text as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Check if the expression fires at the given second.
    #[must_use]
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.second.matches(time.second())
            && self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.month.matches(time.month())
            && self.day_matches(time.date_naive())
    }

    /// Day-of-month and day-of-week are OR'ed when both are restricted.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day.matches(date.day());
        let dow = self.weekday.matches(date.weekday().num_days_from_sunday());
        if self.day.restricted && self.weekday.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The first firing strictly after `after`.
    ///
    /// Skips whole months, days, hours and minutes that cannot match, so the
    /// search is cheap even for sparse expressions. Returns `None` when
    /// nothing matches within the search horizon.
    #[must_use]
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        let last_year = t.year() + SEARCH_YEARS;

        while t.year() <= last_year {
            if !self.month.matches(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = t.date_naive().and_hms_opt(0, 0, 0)?.and_utc() + Duration::days(1);
                continue;
            }
            if !self.hour.matches(t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.matches(t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.second.matches(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}
