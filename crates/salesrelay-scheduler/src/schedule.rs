//! Daily fire-time parsing and next-occurrence calculation.
//! Accepts "HH:MM" or a cron line with fixed minute and hour: "M H * * *".

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone};

use salesrelay_core::error::{RelayError, Result};

/// A fixed time of day, evaluated in whatever timezone the caller uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    hour: u32,
    minute: u32,
}

impl DailySchedule {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(RelayError::Config(format!(
                "fire time {hour:02}:{minute:02} is out of range"
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let invalid = || {
            RelayError::Config(format!(
                "invalid schedule '{spec}' (expected \"HH:MM\" or \"M H * * *\")"
            ))
        };

        if let Some((hour, minute)) = spec.split_once(':') {
            let hour = parse_number(hour).ok_or_else(invalid)?;
            let minute = parse_number(minute).ok_or_else(invalid)?;
            return Self::new(hour, minute);
        }

        let parts: Vec<&str> = spec.split_whitespace().collect();
        if parts.len() != 5 || parts[2..].iter().any(|p| *p != "*") {
            return Err(invalid());
        }
        let minute = parse_number(parts[0]).ok_or_else(invalid)?;
        let hour = parse_number(parts[1]).ok_or_else(invalid)?;
        Self::new(hour, minute)
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// First fire instant strictly after `now`, in `now`'s timezone.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<DateTime<Tz>> {
        let tz = now.timezone();
        let mut date = now.date_naive();
        // Today, tomorrow, and one spare day for a gap that swallows a whole candidate.
        for _ in 0..3 {
            if let Some(candidate) = self.on_date(date, |naive| tz.from_local_datetime(naive)) {
                if candidate > *now {
                    return Ok(candidate);
                }
            }
            date = date
                .succ_opt()
                .ok_or_else(|| RelayError::Config("calendar overflow".into()))?;
        }
        Err(RelayError::Config(format!(
            "no valid fire time for {self} after {}",
            now.naive_local()
        )))
    }

    /// Resolve the fire time on `date`. Inside a DST gap the firing moves one
    /// hour later; an ambiguous time uses its earliest instant.
    fn on_date<T, F>(&self, date: NaiveDate, resolve: F) -> Option<T>
    where
        F: Fn(&NaiveDateTime) -> LocalResult<T>,
    {
        let naive = date.and_hms_opt(self.hour, self.minute, 0)?;
        match resolve(&naive) {
            LocalResult::Single(t) => Some(t),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => match resolve(&(naive + Duration::hours(1))) {
                LocalResult::Single(t) => Some(t),
                LocalResult::Ambiguous(earliest, _) => Some(earliest),
                LocalResult::None => None,
            },
        }
    }
}

impl std::fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

fn parse_number(field: &str) -> Option<u32> {
    let field = field.trim();
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}
