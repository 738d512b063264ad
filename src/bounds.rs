//! Date expressions, CF time units, and the conversions between them.
//!
//! Aggregation bounds can be given either numerically, in the units of the
//! index variable, or as a compact date expression `TYYYY[MM[DD[HH[MM]]]]`.
//! A date expression that stands alone implies its own end: the least
//! significant component given is incremented by one, so `T201702` covers
//! exactly February 2017.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

use crate::errors::{Error, Result};

/// A parsed `TYYYY[MM[DD[HH[MM]]]]` date expression.
///
/// Components omitted from the expression default to the start of their
/// period, but the parser remembers which was the least significant one
/// actually given so that [`DateExpr::next`] can step by the right amount.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateExpr {
    year: i32,
    month: Option<u32>,
    day: Option<u32>,
    hour: Option<u32>,
    minute: Option<u32>,
}

impl DateExpr {
    /// Parse a date expression. The leading `T` is required; the digit count
    /// decides how many components are present.
    ///
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = || Error::ConfigInvalid(format!("bad date expression: {expr:?}"));

        let digits = expr.strip_prefix('T').ok_or_else(invalid)?;
        if !matches!(digits.len(), 4 | 6 | 8 | 10 | 12) || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let field = |range: std::ops::Range<usize>| -> Option<u32> {
            digits.get(range).map(|s| s.parse().unwrap())
        };

        let parsed = DateExpr {
            year: digits[0..4].parse().unwrap(),
            month: field(4..6),
            day: field(6..8),
            hour: field(8..10),
            minute: field(10..12),
        };

        // Reject expressions that don't name a real instant, eg. T201713.
        if parsed.checked_start().is_none() {
            return Err(invalid());
        }

        Ok(parsed)
    }

    fn checked_start(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month.unwrap_or(1), self.day.unwrap_or(1))?
            .and_hms_opt(self.hour.unwrap_or(0), self.minute.unwrap_or(0), 0)
    }

    /// The instant this expression begins.
    ///
    pub fn start(&self) -> NaiveDateTime {
        self.checked_start().expect("validated at parse time")
    }

    /// The instant one period after [`DateExpr::start`], where the period is
    /// the least significant component present: `T2017` steps a year,
    /// `T20170203` steps a day, and so on.
    ///
    pub fn next(&self) -> NaiveDateTime {
        let start = self.start();
        if self.minute.is_some() {
            start + Duration::minutes(1)
        } else if self.hour.is_some() {
            start + Duration::hours(1)
        } else if self.day.is_some() {
            start + Duration::days(1)
        } else if self.month.is_some() {
            let (year, month) = if start.month() == 12 {
                (start.year() + 1, 1)
            } else {
                (start.year(), start.month() + 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1)
                .expect("month arithmetic stays in range")
                .and_hms_opt(0, 0, 0)
                .unwrap()
        } else {
            NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
                .expect("year arithmetic stays in range")
                .and_hms_opt(0, 0, 0)
                .unwrap()
        }
    }

    /// The instant one period before [`DateExpr::start`]. The mirror image of
    /// [`DateExpr::next`], used when a lone `max` bound implies its `min`.
    ///
    pub fn prev(&self) -> NaiveDateTime {
        let start = self.start();
        if self.minute.is_some() {
            start - Duration::minutes(1)
        } else if self.hour.is_some() {
            start - Duration::hours(1)
        } else if self.day.is_some() {
            start - Duration::days(1)
        } else if self.month.is_some() {
            let (year, month) = if start.month() == 1 {
                (start.year() - 1, 12)
            } else {
                (start.year(), start.month() - 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1)
                .expect("month arithmetic stays in range")
                .and_hms_opt(0, 0, 0)
                .unwrap()
        } else {
            NaiveDate::from_ymd_opt(start.year() - 1, 1, 1)
                .expect("year arithmetic stays in range")
                .and_hms_opt(0, 0, 0)
                .unwrap()
        }
    }
}

/// A parsed CF `units` attribute of the form `<unit> since <epoch>`.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeUnits {
    seconds_per_unit: f64,
    epoch: NaiveDateTime,
}

impl TimeUnits {
    /// Parse a CF time units string, eg. `"seconds since 2000-01-01 12:00:00"`.
    ///
    pub fn parse(units: &str) -> Result<Self> {
        let invalid = || Error::ConfigInvalid(format!("bad time units: {units:?}"));

        let mut parts = units.splitn(2, " since ");
        let unit = parts.next().ok_or_else(invalid)?.trim();
        let epoch_str = parts.next().ok_or_else(invalid)?.trim();

        let seconds_per_unit = match unit.to_ascii_lowercase().as_str() {
            "microseconds" | "microsecond" | "us" => 1e-6,
            "milliseconds" | "millisecond" | "ms" => 1e-3,
            "seconds" | "second" | "sec" | "secs" | "s" => 1.0,
            "minutes" | "minute" | "min" | "mins" => 60.0,
            "hours" | "hour" | "hr" | "hrs" | "h" => 3600.0,
            "days" | "day" | "d" => 86400.0,
            _ => return Err(invalid()),
        };

        let epoch_str = epoch_str.trim_end_matches('Z');
        let epoch = NaiveDateTime::parse_from_str(epoch_str, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(epoch_str, "%Y-%m-%dT%H:%M:%S%.f"))
            .or_else(|_| {
                NaiveDate::parse_from_str(epoch_str, "%Y-%m-%d")
                    .map(|d| d.and_hms_opt(0, 0, 0).unwrap())
            })
            .map_err(|_| invalid())?;

        Ok(TimeUnits {
            seconds_per_unit,
            epoch,
        })
    }

    /// Convert a datetime to a numeric index value in these units.
    ///
    pub fn date2num(&self, dt: NaiveDateTime) -> f64 {
        let delta = dt - self.epoch;
        delta.num_milliseconds() as f64 / 1000.0 / self.seconds_per_unit
    }

    /// Convert a numeric index value in these units back to a datetime.
    ///
    pub fn num2date(&self, value: f64) -> Option<NaiveDateTime> {
        if !value.is_finite() {
            return None;
        }
        let millis = (value * self.seconds_per_unit * 1000.0).round();
        if millis.abs() > i64::MAX as f64 {
            return None;
        }
        self.epoch.checked_add_signed(Duration::milliseconds(millis as i64))
    }
}

/// The one timestamp format used for all global attributes: ISO-8601 with
/// millisecond precision and a `Z` suffix.
///
pub fn datetime_format(dt: NaiveDateTime) -> String {
    format!("{}Z", dt.format("%Y-%m-%dT%H:%M:%S%.3f"))
}
