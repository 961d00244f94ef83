use crate::prelude::*;

use chrono::{
    DateTime, Days, FixedOffset, Local, LocalResult, NaiveDateTime, NaiveTime, TimeDelta, TimeZone,
};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

pub const MIN_TARGET_SOC: u8 = 10;
pub const MAX_TARGET_SOC: u8 = 100;

// StartSpec {{{
/// When a schedule starts.
///
/// Older clients send a bare `HH:MM`, newer ones a full RFC 3339 timestamp.
/// Both are parsed once here; the string form is kept for persistence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum StartSpec {
    TimeOfDay(NaiveTime),
    AbsoluteInstant(DateTime<FixedOffset>),
}

impl StartSpec {
    /// First time this schedule should fire, as seen at `now`.
    ///
    /// A time of day is rolled to tomorrow if it is not strictly in the
    /// future. An absolute instant is returned unchanged even if it has
    /// already passed, so the timer fires straight away.
    pub fn next_run_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        match self {
            Self::TimeOfDay(time) => next_time_of_day(*time, now),
            Self::AbsoluteInstant(instant) => instant.with_timezone(&now.timezone()),
        }
    }

    /// Next daily occurrence strictly after `now`, used to re-arm recurring
    /// schedules. An absolute instant recurs at its local time of day.
    pub fn next_occurrence_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        match self {
            Self::TimeOfDay(time) => next_time_of_day(*time, now),
            Self::AbsoluteInstant(instant) => {
                next_time_of_day(instant.with_timezone(&now.timezone()).time(), now)
            }
        }
    }

    /// Local time of day used for the dongle's charge window.
    pub fn window_start(&self) -> NaiveTime {
        match self {
            Self::TimeOfDay(time) => *time,
            Self::AbsoluteInstant(instant) => instant.with_timezone(&Local).time(),
        }
    }

    fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
        // strictly HH:MM, 00:00 to 23:59
        let parsed = s.split_once(':').and_then(|(h, m)| {
            let two_digits = |p: &str| p.len() == 2 && p.bytes().all(|b| b.is_ascii_digit());
            if !two_digits(h) || !two_digits(m) {
                return None;
            }
            NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
        });

        parsed.ok_or_else(|| anyhow!("start time must be HH:MM (00:00 to 23:59) or RFC 3339, got {:?}", s))
    }
}

impl FromStr for StartSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Ok(instant) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::AbsoluteInstant(instant));
        }

        Self::parse_time_of_day(s).map(Self::TimeOfDay)
    }
}

impl std::fmt::Display for StartSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimeOfDay(time) => write!(f, "{}", time.format("%H:%M")),
            Self::AbsoluteInstant(instant) => write!(f, "{}", instant.to_rfc3339()),
        }
    }
}

fn next_time_of_day<Tz: TimeZone>(time: NaiveTime, now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    let candidate = resolve_local(&tz, today.and_time(time));
    if candidate > *now {
        candidate
    } else {
        resolve_local(&tz, (today + Days::new(1)).and_time(time))
    }
}

// a wall-clock time skipped by a DST change resolves an hour later
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => resolve_local(tz, naive + TimeDelta::hours(1)),
    }
} // }}}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    Once,
    Recurring,
}

impl std::fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Once => write!(f, "once"),
            Self::Recurring => write!(f, "recurring"),
        }
    }
}

/// Incoming request to create or replace the schedule.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ScheduleRequest {
    pub target_soc: u8,
    pub start_time: StartSpec,
    #[serde(default = "ScheduleRequest::default_mode")]
    pub mode: ScheduleMode,
    #[serde(default = "ScheduleRequest::default_enabled")]
    pub enabled: bool,
}

impl ScheduleRequest {
    fn default_mode() -> ScheduleMode {
        ScheduleMode::Recurring
    }

    fn default_enabled() -> bool {
        true
    }
}

// Schedule {{{
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub target_soc: u8,
    pub start_time: StartSpec,
    pub mode: ScheduleMode,
    pub enabled: bool,
    pub created_at: DateTime<Local>,
    #[serde(default)]
    pub last_run: Option<DateTime<Local>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Local>>,
}

impl Schedule {
    pub fn new(request: ScheduleRequest, now: DateTime<Local>) -> Result<Self> {
        validate_target_soc(request.target_soc)?;

        Ok(Self {
            target_soc: request.target_soc,
            start_time: request.start_time,
            mode: request.mode,
            enabled: request.enabled,
            created_at: now,
            last_run: None,
            next_run: None,
        })
    }

    /// A one-time schedule starting right now, backing an immediate enable.
    pub fn immediate(target_soc: u8, now: DateTime<Local>) -> Result<Self> {
        validate_target_soc(target_soc)?;

        Ok(Self {
            target_soc,
            start_time: StartSpec::AbsoluteInstant(now.into()),
            mode: ScheduleMode::Once,
            enabled: true,
            created_at: now,
            last_run: Some(now),
            next_run: None,
        })
    }

    pub fn is_recurring(&self) -> bool {
        self.mode == ScheduleMode::Recurring
    }
} // }}}

pub fn validate_target_soc(target_soc: u8) -> Result<()> {
    if !(MIN_TARGET_SOC..=MAX_TARGET_SOC).contains(&target_soc) {
        bail!(
            "target SOC must be between {} and {}, got {}",
            MIN_TARGET_SOC,
            MAX_TARGET_SOC,
            target_soc
        );
    }
    Ok(())
}
