//! Recurring prompts and their UTC schedules.

use agentcore_ai::AgentConfig;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("minute_of_hour must be below 60, got {0}")]
    InvalidMinute(u32),
    #[error("days_of_week must not be empty")]
    NoWeekdays,
    #[error("day of week must be 0 (Sunday) to 6 (Saturday), got {0}")]
    InvalidWeekday(u8),
    #[error("day_of_month must be between 1 and 31, got {0}")]
    InvalidDayOfMonth(u32),
    #[error("no occurrence found after {0}")]
    NoOccurrence(DateTime<Utc>),
}

/// When a scheduled task fires. All times are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    Hourly {
        #[serde(default)]
        minute_of_hour: u32,
    },
    Daily {
        time_of_day: NaiveTime,
    },
    Weekly {
        time_of_day: NaiveTime,
        /// Sunday = 0 through Saturday = 6.
        days_of_week: Vec<u8>,
    },
    Monthly {
        time_of_day: NaiveTime,
        day_of_month: u32,
    },
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Hourly { minute_of_hour: 0 }
    }
}

impl Schedule {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::Hourly { minute_of_hour } if *minute_of_hour >= 60 => {
                Err(ScheduleError::InvalidMinute(*minute_of_hour))
            }
            Schedule::Weekly { days_of_week, .. } => {
                if days_of_week.is_empty() {
                    return Err(ScheduleError::NoWeekdays);
                }
                match days_of_week.iter().find(|day| **day > 6) {
                    Some(day) => Err(ScheduleError::InvalidWeekday(*day)),
                    None => Ok(()),
                }
            }
            Schedule::Monthly { day_of_month, .. } if !(1..=31).contains(day_of_month) => {
                Err(ScheduleError::InvalidDayOfMonth(*day_of_month))
            }
            _ => Ok(()),
        }
    }

    /// First firing strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.validate()?;
        let today = now.date_naive();

        let next = match self {
            Schedule::Hourly { minute_of_hour } => {
                let this_hour = now
                    .date_naive()
                    .and_hms_opt(now.hour(), *minute_of_hour, 0)
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .ok_or(ScheduleError::NoOccurrence(now))?;
                if this_hour > now {
                    this_hour
                } else {
                    this_hour + Duration::hours(1)
                }
            }
            Schedule::Daily { time_of_day } => {
                let candidate = at(today, *time_of_day);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Schedule::Weekly {
                time_of_day,
                days_of_week,
            } => {
                let start = if at(today, *time_of_day) > now {
                    today
                } else {
                    today + Duration::days(1)
                };
                (0..7)
                    .map(|offset| start + Duration::days(offset))
                    .find(|date| {
                        let weekday = date.weekday().num_days_from_sunday() as u8;
                        days_of_week.contains(&weekday)
                    })
                    .map(|date| at(date, *time_of_day))
                    .ok_or(ScheduleError::NoOccurrence(now))?
            }
            Schedule::Monthly {
                time_of_day,
                day_of_month,
            } => {
                let this_month = NaiveDate::from_ymd_opt(today.year(), today.month(), *day_of_month)
                    .map(|date| at(date, *time_of_day))
                    .filter(|candidate| *candidate > now);
                match this_month {
                    Some(candidate) => candidate,
                    None => {
                        let (year, month) = if today.month() == 12 {
                            (today.year() + 1, 1)
                        } else {
                            (today.year(), today.month() + 1)
                        };
                        let day = (*day_of_month).min(days_in_month(year, month));
                        NaiveDate::from_ymd_opt(year, month, day)
                            .map(|date| at(date, *time_of_day))
                            .ok_or(ScheduleError::NoOccurrence(now))?
                    }
                }
            }
        };
        Ok(next)
    }

    pub fn describe(&self) -> String {
        match self {
            Schedule::Hourly { minute_of_hour } => format!("hourly at :{minute_of_hour:02}"),
            Schedule::Daily { time_of_day } => format!("daily at {}", time_of_day.format("%H:%M")),
            Schedule::Weekly {
                time_of_day,
                days_of_week,
            } => {
                let days: Vec<&str> = days_of_week
                    .iter()
                    .map(|day| WEEKDAY_NAMES.get(*day as usize).copied().unwrap_or("?"))
                    .collect();
                format!("weekly on {} at {}", days.join(","), time_of_day.format("%H:%M"))
            }
            Schedule::Monthly {
                time_of_day,
                day_of_month,
            } => format!("monthly on day {day_of_month} at {}", time_of_day.format("%H:%M")),
        }
    }
}

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

fn at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// A prompt that is appended to a thread and run on a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub account_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub agent_config: Option<AgentConfig>,
    /// Created on first firing when absent.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Created on first firing when absent.
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub schedule: Schedule,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn new(
        account_id: impl Into<String>,
        agent_id: impl Into<String>,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let next_run_at = schedule.next_run_after(now)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            agent_id: agent_id.into(),
            agent_config: None,
            project_id: None,
            thread_id: None,
            prompt: None,
            model: None,
            schedule,
            next_run_at,
            last_run_at: None,
            is_active: true,
            created_at: now,
        })
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at <= now
    }

    /// Record a firing at `now` and move `next_run_at` past it.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.last_run_at = Some(now);
        self.next_run_at = self.schedule.next_run_after(now)?;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.is_active = false;
    }

    /// Reactivate without catching up on slots missed while paused.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.is_active = true;
        if self.next_run_at <= now {
            self.next_run_at = self.schedule.next_run_after(now)?;
        }
        Ok(())
    }
}
