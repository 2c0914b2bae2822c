use std::collections::{HashMap, HashSet};

use crate::error::{LabError, Result};
use crate::hosts::spec::{order_by_complexity, HostSpec};
use crate::inventory::{Host, HostArgs, HostFilter, InventoryService};

/// Hosts picked for one scheduling decision, plus per-host outcomes.
///
/// Built per decision, updated as hosts report back, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostGroup {
    Explicit(ExplicitHostGroup),
    Meta(MetaHostGroup),
}

impl HostGroup {
    /// Host arguments for the inventory's `create_job` call.
    pub fn as_args(&self) -> HostArgs {
        match self {
            HostGroup::Explicit(group) => group.as_args(),
            HostGroup::Meta(group) => group.as_args(),
        }
    }

    pub fn mark_host_success(&mut self, hostname: &str) {
        match self {
            HostGroup::Explicit(group) => group.mark_host_success(hostname),
            HostGroup::Meta(group) => group.mark_host_success(hostname),
        }
    }

    pub fn mark_host_failure(&mut self, hostname: &str) {
        match self {
            HostGroup::Explicit(group) => group.mark_host_failure(hostname),
            HostGroup::Meta(group) => group.mark_host_failure(hostname),
        }
    }

    pub fn enough_hosts_succeeded(&self) -> bool {
        match self {
            HostGroup::Explicit(group) => group.enough_hosts_succeeded(),
            HostGroup::Meta(group) => group.enough_hosts_succeeded(),
        }
    }

    /// Specs that never had a host to begin with.
    pub fn unsatisfied_specs(&self) -> &[HostSpec] {
        match self {
            HostGroup::Explicit(group) => group.unsatisfied_specs(),
            HostGroup::Meta(_) => &[],
        }
    }

    /// Specs that had hosts, all of which failed.
    pub fn doomed_specs(&self) -> Vec<HostSpec> {
        match self {
            HostGroup::Explicit(group) => group.doomed_specs(),
            HostGroup::Meta(group) => group.doomed_specs(),
        }
    }
}

/// Concrete hosts chosen per spec up front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplicitHostGroup {
    /// Satisfiable specs in the order their first host was added.
    specs: Vec<HostSpec>,
    hosts_per_spec: HashMap<HostSpec, Vec<String>>,
    spec_for_host: HashMap<String, HostSpec>,
    unsatisfied: Vec<HostSpec>,
    succeeded: HashSet<String>,
    failed: HashSet<String>,
}

impl ExplicitHostGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hosts_per_spec<I, H>(hosts_per_spec: I) -> Result<Self>
    where
        I: IntoIterator<Item = (HostSpec, H)>,
        H: IntoIterator<Item = String>,
    {
        let mut group = Self::new();
        for (spec, hosts) in hosts_per_spec {
            let mut any = false;
            for hostname in hosts {
                group.add_host_for_spec(&spec, Some(&hostname))?;
                any = true;
            }
            if !any {
                group.add_host_for_spec(&spec, None)?;
            }
        }
        Ok(group)
    }

    /// Record `hostname` as serving `spec`, or with `None` record that
    /// nothing could satisfy `spec`.
    ///
    /// A host may serve only one spec. Adding it again under the same spec is
    /// a no-op.
    pub fn add_host_for_spec(&mut self, spec: &HostSpec, hostname: Option<&str>) -> Result<()> {
        let Some(hostname) = hostname else {
            if !self.hosts_per_spec.contains_key(spec) && !self.unsatisfied.contains(spec) {
                self.unsatisfied.push(spec.clone());
            }
            return Ok(());
        };

        if let Some(existing) = self.spec_for_host.get(hostname) {
            if existing == spec {
                return Ok(());
            }
            return Err(LabError::DuplicateHost {
                hostname: hostname.to_string(),
                existing: existing.to_string(),
            });
        }

        self.unsatisfied.retain(|s| s != spec);
        if !self.hosts_per_spec.contains_key(spec) {
            self.specs.push(spec.clone());
        }
        self.hosts_per_spec
            .entry(spec.clone())
            .or_default()
            .push(hostname.to_string());
        self.spec_for_host
            .insert(hostname.to_string(), spec.clone());
        Ok(())
    }

    pub fn specs(&self) -> &[HostSpec] {
        &self.specs
    }

    pub fn hosts_for_spec(&self, spec: &HostSpec) -> &[String] {
        self.hosts_per_spec
            .get(spec)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.specs
            .iter()
            .flat_map(|spec| self.hosts_for_spec(spec).iter().cloned())
            .collect()
    }

    pub fn unsatisfied_specs(&self) -> &[HostSpec] {
        &self.unsatisfied
    }

    pub fn mark_host_success(&mut self, hostname: &str) {
        if !self.spec_for_host.contains_key(hostname) {
            tracing::debug!(hostname, "Success reported for host outside the group");
            return;
        }
        self.succeeded.insert(hostname.to_string());
    }

    pub fn mark_host_failure(&mut self, hostname: &str) {
        if !self.spec_for_host.contains_key(hostname) {
            tracing::debug!(hostname, "Failure reported for host outside the group");
            return;
        }
        self.failed.insert(hostname.to_string());
    }

    /// True once every satisfiable spec has at least one successful host.
    pub fn enough_hosts_succeeded(&self) -> bool {
        self.specs.iter().all(|spec| {
            self.hosts_for_spec(spec)
                .iter()
                .any(|h| self.succeeded.contains(h))
        })
    }

    pub fn doomed_specs(&self) -> Vec<HostSpec> {
        self.specs
            .iter()
            .filter(|spec| {
                let hosts = self.hosts_for_spec(spec);
                !hosts.is_empty()
                    && hosts
                        .iter()
                        .all(|h| self.failed.contains(h) && !self.succeeded.contains(h))
            })
            .cloned()
            .collect()
    }

    pub fn as_args(&self) -> HostArgs {
        HostArgs::Explicit {
            hosts: self.hostnames(),
        }
    }
}

/// A label requirement and a replica count; the inventory picks the hosts
/// when the job is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaHostGroup {
    spec: HostSpec,
    num: usize,
    succeeded: HashSet<String>,
    failed: HashSet<String>,
}

impl MetaHostGroup {
    pub fn new(spec: HostSpec, num: usize) -> Self {
        Self {
            spec,
            num,
            succeeded: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn mark_host_success(&mut self, hostname: &str) {
        self.succeeded.insert(hostname.to_string());
    }

    pub fn mark_host_failure(&mut self, hostname: &str) {
        self.failed.insert(hostname.to_string());
    }

    pub fn enough_hosts_succeeded(&self) -> bool {
        !self.succeeded.is_empty()
    }

    pub fn doomed_specs(&self) -> Vec<HostSpec> {
        if self.succeeded.is_empty() && self.num > 0 && self.failed.len() >= self.num {
            vec![self.spec.clone()]
        } else {
            Vec::new()
        }
    }

    pub fn as_args(&self) -> HostArgs {
        HostArgs::Meta {
            meta_host: self.spec.meta_host().unwrap_or_default().to_string(),
            dependencies: self.spec.dependencies(),
            count: self.num,
        }
    }
}

/// Assign concrete hosts to specs, most specific spec first.
///
/// Each spec gets one unused host that satisfies it, or is recorded as
/// unsatisfied. Leftover slots up to `num` are then filled from the same
/// candidate lists in the same order.
pub fn choose_hosts(candidates: Vec<(HostSpec, Vec<Host>)>, num: usize) -> Result<ExplicitHostGroup> {
    if candidates.len() > num {
        return Err(LabError::InadequateHosts {
            specs: candidates.len(),
            num,
        });
    }

    let mut per_spec: HashMap<HostSpec, Vec<Host>> = HashMap::new();
    let mut specs = Vec::with_capacity(candidates.len());
    for (spec, hosts) in candidates {
        if !per_spec.contains_key(&spec) {
            specs.push(spec.clone());
        }
        per_spec.entry(spec).or_default().extend(hosts);
    }
    let ordered = order_by_complexity(specs);

    let mut group = ExplicitHostGroup::new();
    let mut used: HashSet<String> = HashSet::new();
    for spec in &ordered {
        let pick = per_spec.get(spec).and_then(|hosts| {
            hosts
                .iter()
                .find(|h| !used.contains(&h.hostname) && spec.is_satisfied_by(h))
        });
        match pick {
            Some(host) => {
                tracing::debug!(hostname = %host.hostname, spec = %spec, "Host chosen for spec");
                used.insert(host.hostname.clone());
                group.add_host_for_spec(spec, Some(&host.hostname))?;
            }
            None => {
                tracing::warn!(spec = %spec, "No usable host for spec");
                group.add_host_for_spec(spec, None)?;
            }
        }
    }

    if used.is_empty() {
        let wanted: Vec<String> = ordered.iter().map(|s| format!("[{}]", s)).collect();
        return Err(LabError::NoHosts(wanted.join(" ")));
    }

    'fill: for spec in &ordered {
        let Some(hosts) = per_spec.get(spec) else {
            continue;
        };
        for host in hosts {
            if used.len() >= num {
                break 'fill;
            }
            if used.contains(&host.hostname) || !spec.is_satisfied_by(host) {
                continue;
            }
            if group.specs().contains(spec) {
                used.insert(host.hostname.clone());
                group.add_host_for_spec(spec, Some(&host.hostname))?;
            }
        }
    }

    Ok(group)
}

/// Query the inventory for unlocked candidates and build a group for `specs`.
///
/// A single spec becomes a [`MetaHostGroup`] so the inventory can pick the
/// machines itself; several specs need explicit assignment.
pub async fn build_host_group(
    inventory: &dyn InventoryService,
    specs: &[HostSpec],
    num: usize,
) -> Result<HostGroup> {
    if specs.is_empty() {
        return Err(LabError::NoHosts("an empty list of host specs".to_string()));
    }
    if specs.len() > num {
        return Err(LabError::InadequateHosts {
            specs: specs.len(),
            num,
        });
    }

    if let [spec] = specs {
        let filter = HostFilter::labels(spec.labels().iter().cloned()).with_locked(false);
        if inventory.get_hosts(&filter).await?.is_empty() {
            return Err(LabError::NoHosts(format!("[{}]", spec)));
        }
        return Ok(HostGroup::Meta(MetaHostGroup::new(spec.clone(), num)));
    }

    let mut candidates = Vec::with_capacity(specs.len());
    for spec in specs {
        let filter = HostFilter::labels(spec.labels().iter().cloned()).with_locked(false);
        let hosts = inventory.get_hosts(&filter).await?;
        candidates.push((spec.clone(), hosts));
    }
    Ok(HostGroup::Explicit(choose_hosts(candidates, num)?))
}
