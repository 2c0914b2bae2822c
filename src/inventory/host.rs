use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type HostId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked {
        owner: String,
        locked_at: DateTime<Utc>,
    },
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked { .. })
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            LockState::Locked { owner, .. } => Some(owner),
            LockState::Unlocked => None,
        }
    }
}

/// A device under test as recorded by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    pub labels: BTreeSet<String>,
    pub lock: LockState,
}

impl Host {
    pub fn new<I, S>(id: HostId, hostname: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            hostname: hostname.into(),
            labels: labels.into_iter().map(Into::into).collect(),
            lock: LockState::Unlocked,
        }
    }

    pub fn has_labels<'a>(&self, labels: impl IntoIterator<Item = &'a String>) -> bool {
        labels.into_iter().all(|l| self.labels.contains(l))
    }
}

/// Selects hosts for `get_hosts` and `modify_hosts`. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFilter {
    pub hostnames: Vec<String>,
    pub labels: Vec<String>,
    pub locked: Option<bool>,
}

impl HostFilter {
    pub fn hostnames<I, S>(hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hostnames: hostnames.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = Some(locked);
        self
    }

    pub fn matches(&self, host: &Host) -> bool {
        if !self.hostnames.is_empty() && !self.hostnames.contains(&host.hostname) {
            return false;
        }
        if let Some(locked) = self.locked {
            if host.lock.is_locked() != locked {
                return false;
            }
        }
        host.has_labels(&self.labels)
    }
}

/// Mutation applied by `modify_hosts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostUpdate {
    Lock { owner: String },
    Unlock,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host::new(1, "h1", ["board:link", "pool:bvt"])
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(HostFilter::default().matches(&host()));
    }

    #[test]
    fn filter_by_labels_requires_all() {
        assert!(HostFilter::labels(["board:link"]).matches(&host()));
        assert!(HostFilter::labels(["board:link", "pool:bvt"]).matches(&host()));
        assert!(!HostFilter::labels(["board:link", "pool:suites"]).matches(&host()));
    }

    #[test]
    fn filter_by_hostname_and_lock_state() {
        let mut h = host();
        assert!(HostFilter::hostnames(["h1"]).matches(&h));
        assert!(!HostFilter::hostnames(["h2"]).matches(&h));
        assert!(HostFilter::hostnames(["h1"]).with_locked(false).matches(&h));

        h.lock = LockState::Locked {
            owner: "someone".to_string(),
            locked_at: Utc::now(),
        };
        assert!(!HostFilter::default().with_locked(false).matches(&h));
        assert_eq!(h.lock.owner(), Some("someone"));
    }
}
