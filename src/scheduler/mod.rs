//! Suite scheduling: tasks, the dedup layer that turns them into jobs, timed
//! events that fire them, and the loop that drives the events.

pub mod deduping;
pub mod driver;
pub mod event;
pub mod task;

pub use deduping::{DedupingScheduler, SuiteRequest};
pub use driver::{BuildSource, SchedulerDriver, StaticBuildSource};
pub use event::{BaseEvent, Recurrence, TimedEvent};
pub use task::{check_branch_specs, BranchBuilds, Task, TaskKind, BARE_BRANCHES};
