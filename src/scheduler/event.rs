use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};

use crate::error::{LabError, Result};
use crate::scheduler::deduping::DedupingScheduler;
use crate::scheduler::task::{BranchBuilds, Task};

/// A named trigger owning the tasks it runs.
#[derive(Debug, Clone)]
pub struct BaseEvent {
    keyword: String,
    tasks: Vec<Task>,
}

impl BaseEvent {
    /// Duplicate tasks collapse to the first occurrence.
    pub fn new(keyword: impl Into<String>, tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut seen = HashSet::new();
        let tasks = tasks
            .into_iter()
            .filter(|task| seen.insert(task.clone()))
            .collect();
        Self {
            keyword: keyword.into(),
            tasks,
        }
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Run every task against every board. A task that asks to be discarded
    /// on any board is dropped afterwards.
    pub async fn handle(
        &mut self,
        scheduler: &DedupingScheduler,
        builds_per_board: &BTreeMap<String, BranchBuilds>,
        force: bool,
    ) {
        tracing::info!(event = %self.keyword, tasks = self.tasks.len(), "Handling event");
        let mut keep = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let mut keep_task = true;
            for (board, branch_builds) in builds_per_board {
                keep_task &= task.run(scheduler, branch_builds, board, force).await;
            }
            keep.push(keep_task);
        }

        let mut keep = keep.into_iter();
        self.tasks.retain(|task| {
            let kept = keep.next().unwrap_or(true);
            if !kept {
                tracing::info!(task = %task.name(), event = %self.keyword, "Dropping finished task");
            }
            kept
        });
    }
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Nightly { at: NaiveTime },
    Weekly { day: Weekday, at: NaiveTime },
}

impl Recurrence {
    pub fn nightly(hour: u32) -> Result<Self> {
        Ok(Recurrence::Nightly {
            at: hour_of_day(hour)?,
        })
    }

    /// `day` counts from 0 = Monday.
    pub fn weekly(day: u32, hour: u32) -> Result<Self> {
        let day = usize::try_from(day)
            .ok()
            .and_then(|d| WEEKDAYS.get(d).copied())
            .ok_or_else(|| LabError::Config(format!("weekday {} out of range", day)))?;
        Ok(Recurrence::Weekly {
            day,
            at: hour_of_day(hour)?,
        })
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Recurrence::Nightly { .. } => "nightly",
            Recurrence::Weekly { .. } => "weekly",
        }
    }

    fn period(&self) -> Duration {
        match self {
            Recurrence::Nightly { .. } => Duration::days(1),
            Recurrence::Weekly { .. } => Duration::weeks(1),
        }
    }

    /// This period's trigger time, or the next period's if it already passed.
    fn first_deadline(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date();
        let deadline = match *self {
            Recurrence::Nightly { at } => today.and_time(at),
            Recurrence::Weekly { day, at } => {
                let offset = i64::from(day.num_days_from_monday())
                    - i64::from(today.weekday().num_days_from_monday());
                (today + Duration::days(offset)).and_time(at)
            }
        };
        if now > deadline {
            deadline + self.period()
        } else {
            deadline
        }
    }
}

fn hour_of_day(hour: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, 0, 0)
        .ok_or_else(|| LabError::Config(format!("hour {} out of range", hour)))
}

/// An event that fires once its deadline passes, then waits a full period.
#[derive(Debug, Clone)]
pub struct TimedEvent {
    base: BaseEvent,
    recurrence: Recurrence,
    deadline: NaiveDateTime,
}

impl TimedEvent {
    pub fn new(recurrence: Recurrence, tasks: impl IntoIterator<Item = Task>, now: NaiveDateTime) -> Self {
        Self {
            base: BaseEvent::new(recurrence.keyword(), tasks),
            recurrence,
            deadline: recurrence.first_deadline(now),
        }
    }

    pub fn keyword(&self) -> &str {
        self.base.keyword()
    }

    pub fn recurrence(&self) -> Recurrence {
        self.recurrence
    }

    pub fn deadline(&self) -> NaiveDateTime {
        self.deadline
    }

    pub fn tasks(&self) -> &[Task] {
        self.base.tasks()
    }

    pub fn should_handle(&self, now: NaiveDateTime) -> bool {
        now >= self.deadline
    }

    /// Move the deadline to the first trigger time after `now`.
    pub fn update_criteria(&mut self, now: NaiveDateTime) {
        while self.deadline <= now {
            self.deadline += self.recurrence.period();
        }
        tracing::debug!(event = %self.keyword(), deadline = %self.deadline, "Next deadline");
    }

    pub async fn handle(
        &mut self,
        scheduler: &DedupingScheduler,
        builds_per_board: &BTreeMap<String, BranchBuilds>,
        force: bool,
    ) {
        self.base.handle(scheduler, builds_per_board, force).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn recurrence_bounds() {
        assert!(Recurrence::nightly(24).is_err());
        assert!(Recurrence::weekly(7, 1).is_err());
        assert_eq!(
            Recurrence::weekly(0, 3).unwrap(),
            Recurrence::Weekly {
                day: Weekday::Mon,
                at: NaiveTime::from_hms_opt(3, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn update_criteria_skips_missed_periods() {
        let base = at(2012, 1, 1, 21);
        let mut event = TimedEvent::new(Recurrence::nightly(21).unwrap(), Vec::new(), base);
        assert_eq!(event.deadline(), base);

        event.update_criteria(base + Duration::days(3));
        assert_eq!(event.deadline(), base + Duration::days(4));
    }
}
