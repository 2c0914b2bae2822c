use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::inventory::Host;

/// A set of labels every host serving this requirement must carry.
///
/// Labels are kept sorted, so two specs built from the same labels in any
/// order compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostSpec {
    labels: BTreeSet<String>,
}

impl HostSpec {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    /// Number of labels; more labels means a more specific requirement.
    pub fn complexity(&self) -> usize {
        self.labels.len()
    }

    pub fn is_satisfied_by(&self, host: &Host) -> bool {
        host.has_labels(&self.labels)
    }

    /// The label the inventory schedules on (the board label when present).
    pub fn meta_host(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.starts_with("board:"))
            .or_else(|| self.labels.iter().next())
            .map(String::as_str)
    }

    /// Every label except [`HostSpec::meta_host`].
    pub fn dependencies(&self) -> Vec<String> {
        let meta = self.meta_host();
        self.labels
            .iter()
            .filter(|l| Some(l.as_str()) != meta)
            .cloned()
            .collect()
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        write!(f, "{}", labels.join(", "))
    }
}

/// Order specs most specific first.
///
/// A general spec must not grab hosts a more specific spec also needs, so
/// assignment walks specs in this order. Specs with the same number of labels
/// keep their input order.
pub fn order_by_complexity<I>(specs: I) -> Vec<HostSpec>
where
    I: IntoIterator<Item = HostSpec>,
{
    let mut ordered: Vec<HostSpec> = specs.into_iter().collect();
    ordered.sort_by(|a, b| b.complexity().cmp(&a.complexity()));
    ordered
}
