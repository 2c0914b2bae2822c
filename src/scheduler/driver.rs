use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{LabError, Result};
use crate::inventory::InventoryService;
use crate::scheduler::deduping::DedupingScheduler;
use crate::scheduler::event::{Recurrence, TimedEvent};
use crate::scheduler::task::{BranchBuilds, Task};

/// Where the driver learns which builds exist for a board.
#[async_trait]
pub trait BuildSource: Send + Sync {
    async fn branch_builds(&self, board: &str) -> Result<BranchBuilds>;
}

/// Builds listed up front, e.g. in the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticBuildSource {
    builds: BTreeMap<String, BranchBuilds>,
}

impl StaticBuildSource {
    pub fn new(builds: BTreeMap<String, BranchBuilds>) -> Self {
        Self { builds }
    }
}

#[async_trait]
impl BuildSource for StaticBuildSource {
    async fn branch_builds(&self, board: &str) -> Result<BranchBuilds> {
        Ok(self.builds.get(board).cloned().unwrap_or_default())
    }
}

/// Polls timed events and hands due ones the current builds per board.
pub struct SchedulerDriver {
    scheduler: DedupingScheduler,
    events: Vec<TimedEvent>,
    builds: Arc<dyn BuildSource>,
    boards: Vec<String>,
    tick_interval: Duration,
    shutdown: CancellationToken,
}

impl SchedulerDriver {
    pub fn new(
        scheduler: DedupingScheduler,
        events: Vec<TimedEvent>,
        builds: Arc<dyn BuildSource>,
        boards: Vec<String>,
        tick_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            events,
            builds,
            boards,
            tick_interval,
            shutdown,
        }
    }

    /// Wire a driver from the `[scheduler]` config section, with the
    /// configured builds as the build source.
    pub fn from_config(
        inventory: Arc<dyn InventoryService>,
        config: &SchedulerConfig,
        shutdown: CancellationToken,
        now: NaiveDateTime,
    ) -> Result<Self> {
        let nightly = Recurrence::nightly(config.nightly_hour)?;
        let weekly = Recurrence::weekly(config.weekly_day, config.weekly_hour)?;

        let mut by_keyword: BTreeMap<&'static str, Vec<Task>> = BTreeMap::new();
        for entry in &config.tasks {
            let (keyword, task) = Task::from_config(entry)?;
            let recurrence = [nightly, weekly]
                .into_iter()
                .find(|r| r.keyword() == keyword)
                .ok_or_else(|| {
                    LabError::MalformedTask(format!("{}: unknown event {}", entry.name, keyword))
                })?;
            by_keyword.entry(recurrence.keyword()).or_default().push(task);
        }

        let events = [nightly, weekly]
            .into_iter()
            .map(|r| {
                let tasks = by_keyword.remove(r.keyword()).unwrap_or_default();
                TimedEvent::new(r, tasks, now)
            })
            .collect();

        Ok(Self::new(
            DedupingScheduler::new(inventory, config.job_timeout_mins),
            events,
            Arc::new(StaticBuildSource::new(config.builds.clone())),
            config.boards.clone(),
            config.tick_interval(),
            shutdown,
        ))
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    /// Handle every event due at `now`. Returns how many fired.
    pub async fn tick(&mut self, now: NaiveDateTime) -> usize {
        if !self.events.iter().any(|e| e.should_handle(now)) {
            return 0;
        }

        let mut builds_per_board = BTreeMap::new();
        for board in &self.boards {
            match self.builds.branch_builds(board).await {
                Ok(builds) => {
                    builds_per_board.insert(board.clone(), builds);
                }
                Err(e) => {
                    tracing::warn!(board = %board, error = %e, "Could not list builds, skipping board");
                }
            }
        }

        let mut fired = 0;
        for event in &mut self.events {
            if !event.should_handle(now) {
                continue;
            }
            event.handle(&self.scheduler, &builds_per_board, false).await;
            event.update_criteria(now);
            fired += 1;
        }
        fired
    }

    /// Tick until the shutdown token is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            events = self.events.len(),
            boards = self.boards.len(),
            "Suite scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let fired = self.tick(Local::now().naive_local()).await;
            if fired > 0 {
                tracing::info!(fired, "Events handled");
            }
        }

        tracing::info!("Suite scheduler stopped");
        Ok(())
    }
}
