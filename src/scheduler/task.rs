use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::config::TaskConfig;
use crate::error::{LabError, Result};
use crate::inventory::Host;
use crate::scheduler::deduping::{DedupingScheduler, SuiteRequest};

/// Branches that are named as-is instead of by milestone.
pub const BARE_BRANCHES: [&str; 2] = ["factory", "firmware"];

/// branch -> builds for one board, e.g. `{"R19": ["link-release/R19-2077.0.0"]}`.
pub type BranchBuilds = BTreeMap<String, Vec<String>>;

/// Accept any of [`BARE_BRANCHES`] plus at most one `>=RNN` or `==RNN`.
pub fn check_branch_specs(specs: &[String]) -> Result<()> {
    let mut seen_milestone = false;
    for spec in specs {
        if BARE_BRANCHES.contains(&spec.as_str()) {
            continue;
        }
        if !seen_milestone && parse_milestone_spec(spec).is_some() {
            seen_milestone = true;
            continue;
        }
        return Err(LabError::MalformedTask(format!(
            "{} isn't a valid branch spec",
            spec
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MilestoneConstraint {
    AtLeast(u32),
    Exactly(u32),
}

impl MilestoneConstraint {
    fn allows(&self, milestone: u32) -> bool {
        match *self {
            MilestoneConstraint::AtLeast(min) => milestone >= min,
            MilestoneConstraint::Exactly(want) => milestone == want,
        }
    }
}

fn parse_milestone_spec(spec: &str) -> Option<MilestoneConstraint> {
    if let Some(rest) = spec.strip_prefix(">=R") {
        return rest.parse().ok().map(MilestoneConstraint::AtLeast);
    }
    if let Some(rest) = spec.strip_prefix("==R") {
        return rest.parse().ok().map(MilestoneConstraint::Exactly);
    }
    None
}

/// "R19" -> 19
fn parse_milestone(branch: &str) -> Option<u32> {
    branch.strip_prefix('R')?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Recurring,
    OneShot,
}

/// A rule to schedule `suite` on every build whose branch fits
/// `branch_specs`.
///
/// Two tasks are the same task when suite, branch specs, pool and kind agree;
/// the name and machine count do not take part.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    suite: String,
    branch_specs: Vec<String>,
    pool: Option<String>,
    num: Option<u32>,
    kind: TaskKind,
    bare_branches: Vec<String>,
    milestone: Option<MilestoneConstraint>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        suite: impl Into<String>,
        branch_specs: Vec<String>,
        pool: Option<String>,
        num: Option<u32>,
        kind: TaskKind,
    ) -> Result<Self> {
        let suite = suite.into();
        if suite.is_empty() {
            return Err(LabError::MalformedTask("no suite".to_string()));
        }
        check_branch_specs(&branch_specs)?;

        let (milestone, bare_branches) = if branch_specs.is_empty() {
            (Some(MilestoneConstraint::AtLeast(0)), Vec::new())
        } else {
            let milestone = branch_specs.iter().find_map(|s| parse_milestone_spec(s));
            let bare = branch_specs
                .iter()
                .filter(|s| BARE_BRANCHES.contains(&s.as_str()))
                .cloned()
                .collect();
            (milestone, bare)
        };

        Ok(Self {
            name: name.into(),
            suite,
            branch_specs,
            pool,
            num,
            kind,
            bare_branches,
            milestone,
        })
    }

    /// Build a task from a config entry, returning the keyword of the event
    /// that should run it.
    pub fn from_config(config: &TaskConfig) -> Result<(String, Task)> {
        let keyword = config.run_on.trim();
        if keyword.is_empty() {
            return Err(LabError::MalformedTask(format!(
                "{}: no event to run on",
                config.name
            )));
        }
        if config.num == Some(0) {
            return Err(LabError::MalformedTask(format!(
                "{}: num must be positive",
                config.name
            )));
        }
        let kind = if config.one_shot {
            TaskKind::OneShot
        } else {
            TaskKind::Recurring
        };
        let task = Task::new(
            config.name.clone(),
            config.suite.clone(),
            config.branch_specs.clone(),
            config.pool.clone(),
            config.num,
            kind,
        )
        .map_err(|e| LabError::MalformedTask(format!("{}: {}", config.name, e)))?;
        Ok((keyword.to_string(), task))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    pub fn branch_specs(&self) -> &[String] {
        &self.branch_specs
    }

    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    pub fn num(&self) -> Option<u32> {
        self.num
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Whether builds from `branch` ("factory", "R19", ...) fall under this
    /// task. Without branch specs any milestone fits, but no bare branch.
    pub fn fits_branch(&self, branch: &str) -> bool {
        if BARE_BRANCHES.contains(&branch) {
            return self.bare_branches.iter().any(|b| b == branch);
        }
        match (self.milestone, parse_milestone(branch)) {
            (Some(constraint), Some(milestone)) => constraint.allows(milestone),
            _ => false,
        }
    }

    /// Hosts that could run this task's suite on `board`.
    pub async fn available_hosts(
        &self,
        scheduler: &DedupingScheduler,
        board: &str,
    ) -> Result<Vec<Host>> {
        let mut labels = vec![format!("board:{}", board)];
        if let Some(pool) = &self.pool {
            labels.push(format!("pool:{}", pool));
        }
        scheduler.get_hosts(&labels).await
    }

    /// Only the bvt pool is guaranteed to have hosts for every board.
    pub fn should_have_available_hosts(&self) -> bool {
        self.pool.as_deref() == Some("bvt")
    }

    /// Schedule the suite on every fitting build for `board`.
    ///
    /// Failures are logged and do not stop the remaining builds. Returns
    /// whether the task should be kept for the next firing.
    pub async fn run(
        &self,
        scheduler: &DedupingScheduler,
        branch_builds: &BranchBuilds,
        board: &str,
        force: bool,
    ) -> bool {
        tracing::info!(task = %self.name, board, "Running task");
        let builds: Vec<&String> = branch_builds
            .iter()
            .filter(|(branch, _)| self.fits_branch(branch))
            .flat_map(|(_, builds)| builds.iter())
            .collect();

        if !builds.is_empty() && self.should_have_available_hosts() {
            match self.available_hosts(scheduler, board).await {
                Ok(hosts) if hosts.is_empty() => {
                    tracing::warn!(task = %self.name, board, pool = ?self.pool, "No hosts available for task");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task = %self.name, board, error = %e, "Could not look up hosts for task");
                }
            }
        }

        for build in builds {
            let request = SuiteRequest {
                suite: self.suite.clone(),
                board: board.to_string(),
                build: build.clone(),
                pool: self.pool.clone(),
                num: self.num,
            };
            match scheduler.schedule_suite(&request, force).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(suite = %self.suite, build = %build, board, "Skipping scheduling");
                }
                Err(e) => {
                    tracing::error!(task = %self.name, build = %build, board, error = %e, "Failed to schedule suite");
                }
            }
        }

        self.kind == TaskKind::Recurring
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.suite == other.suite
            && self.branch_specs == other.branch_specs
            && self.pool == other.pool
            && self.kind == other.kind
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.suite.hash(state);
        self.branch_specs.hash(state);
        self.pool.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let num = match self.num {
            Some(n) => n.to_string(),
            None => "[Default num]".to_string(),
        };
        write!(
            f,
            "{}: {} on {:?} with pool {}, across {} machines",
            self.name,
            self.suite,
            self.branch_specs,
            self.pool.as_deref().unwrap_or("None"),
            num
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn task(branch_specs: &[&str]) -> Task {
        Task::new("t", "bvt", specs(branch_specs), None, None, TaskKind::Recurring).unwrap()
    }

    #[test]
    fn branch_spec_validation() {
        assert!(check_branch_specs(&specs(&["factory", "firmware", ">=R20"])).is_ok());
        assert!(check_branch_specs(&specs(&["==R19"])).is_ok());
        assert!(check_branch_specs(&specs(&[">=R20", "==R21"])).is_err());
        assert!(check_branch_specs(&specs(&["release"])).is_err());
        assert!(check_branch_specs(&specs(&[">=R"])).is_err());
    }

    #[test]
    fn no_specs_fits_any_milestone_but_no_bare_branch() {
        let t = task(&[]);
        assert!(t.fits_branch("R1"));
        assert!(t.fits_branch("R40"));
        assert!(!t.fits_branch("factory"));
    }

    #[test]
    fn milestone_constraints() {
        let at_least = task(&[">=R20"]);
        assert!(!at_least.fits_branch("R19"));
        assert!(at_least.fits_branch("R20"));
        assert!(at_least.fits_branch("R21"));

        let exactly = task(&["==R20", "factory"]);
        assert!(exactly.fits_branch("R20"));
        assert!(!exactly.fits_branch("R21"));
        assert!(exactly.fits_branch("factory"));
        assert!(!exactly.fits_branch("firmware"));
    }

    #[test]
    fn bare_only_specs_reject_milestones() {
        let t = task(&["firmware"]);
        assert!(t.fits_branch("firmware"));
        assert!(!t.fits_branch("R20"));
    }

    #[test]
    fn identity_ignores_name_and_num() {
        let a = Task::new("a", "bvt", specs(&[">=R20"]), None, Some(2), TaskKind::Recurring).unwrap();
        let b = Task::new("b", "bvt", specs(&[">=R20"]), None, Some(5), TaskKind::Recurring).unwrap();
        let c = Task::new("c", "bvt", specs(&[">=R20"]), None, None, TaskKind::OneShot).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: std::collections::HashSet<Task> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn from_config_rejects_missing_fields() {
        let mut cfg = TaskConfig {
            name: "NightlyBvt".to_string(),
            suite: "bvt".to_string(),
            run_on: "nightly".to_string(),
            ..Default::default()
        };
        let (keyword, t) = Task::from_config(&cfg).unwrap();
        assert_eq!(keyword, "nightly");
        assert_eq!(t.kind(), TaskKind::Recurring);

        cfg.run_on = String::new();
        assert!(matches!(Task::from_config(&cfg), Err(LabError::MalformedTask(_))));

        cfg.run_on = "nightly".to_string();
        cfg.suite = String::new();
        assert!(matches!(Task::from_config(&cfg), Err(LabError::MalformedTask(_))));
    }
}
