use std::collections::BTreeMap;

use chrono::Utc;

use crate::inventory::{
    HeartbeatRequest, HeartbeatResponse, Host, HostId, JobId, JobRecord, JobStatus,
};

/// A shard's local copy of the hosts and jobs the master assigned to it.
#[derive(Debug, Clone, Default)]
pub struct ShardState {
    hosts: BTreeMap<HostId, Host>,
    jobs: BTreeMap<JobId, JobRecord>,
    /// Jobs that finished here and have not reached the master yet.
    finished: BTreeMap<JobId, JobRecord>,
}

impl ShardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    pub fn host(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(&id)
    }

    pub fn job(&self, id: JobId) -> Option<&JobRecord> {
        self.jobs.get(&id)
    }

    pub fn pending_uploads(&self) -> usize {
        self.finished.len()
    }

    /// Upsert every record in `response`; the master's copy wins.
    pub fn apply(&mut self, response: &HeartbeatResponse) {
        for host in &response.hosts {
            self.hosts.insert(host.id, host.clone());
        }
        for job in &response.jobs {
            self.jobs.insert(job.id, job.clone());
        }
    }

    /// Mark a locally known job finished and queue it for upload.
    ///
    /// Returns false for unknown jobs or a status that is not terminal.
    pub fn record_job_finished(&mut self, id: JobId, status: JobStatus) -> bool {
        if !status.is_finished() {
            return false;
        }
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        job.status = status;
        job.completed_at = Some(Utc::now());
        self.finished.insert(id, job.clone());
        true
    }

    pub fn heartbeat_request(&self, shard_hostname: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            shard_hostname: shard_hostname.to_string(),
            known_host_ids: self.hosts.keys().copied().collect(),
            known_job_ids: self.jobs.keys().copied().collect(),
            finished_jobs: self.finished.values().cloned().collect(),
        }
    }

    /// Forget uploads the master acknowledged.
    pub fn mark_uploaded(&mut self, ids: &[JobId]) {
        for id in ids {
            self.finished.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{HostArgs, JobRequest};

    fn job(id: JobId) -> JobRecord {
        let request = JobRequest {
            name: format!("job-{}", id),
            suite: "bvt".to_string(),
            board: "link".to_string(),
            build: "R20-1.0".to_string(),
            pool: None,
            hosts: HostArgs::Explicit { hosts: vec![] },
            timeout_mins: 60,
        };
        JobRecord::from_request(id, &request, Utc::now())
    }

    #[test]
    fn applying_the_same_response_twice_is_idempotent() {
        let response = HeartbeatResponse {
            hosts: vec![Host::new(1, "h1", ["board:link"])],
            jobs: vec![job(7)],
        };
        let mut state = ShardState::new();
        state.apply(&response);
        let hosts_once: Vec<Host> = state.hosts().cloned().collect();
        state.apply(&response);
        let hosts_twice: Vec<Host> = state.hosts().cloned().collect();
        assert_eq!(hosts_once, hosts_twice);
        assert_eq!(state.jobs().count(), 1);
    }

    #[test]
    fn later_records_replace_earlier_ones() {
        let mut state = ShardState::new();
        state.apply(&HeartbeatResponse {
            hosts: vec![Host::new(1, "h1", ["board:link"])],
            jobs: vec![],
        });
        state.apply(&HeartbeatResponse {
            hosts: vec![Host::new(1, "h1", ["board:link", "pool:bvt"])],
            jobs: vec![],
        });
        assert_eq!(state.host(1).unwrap().labels.len(), 2);
    }

    #[test]
    fn finished_jobs_wait_for_upload() {
        let mut state = ShardState::new();
        state.apply(&HeartbeatResponse {
            hosts: vec![],
            jobs: vec![job(7)],
        });
        assert!(!state.record_job_finished(7, JobStatus::Running));
        assert!(!state.record_job_finished(8, JobStatus::Completed));
        assert!(state.record_job_finished(7, JobStatus::Completed));

        let request = state.heartbeat_request("shard1");
        assert_eq!(request.known_job_ids, vec![7]);
        assert_eq!(request.finished_jobs.len(), 1);

        state.mark_uploaded(&[7]);
        assert_eq!(state.pending_uploads(), 0);
        assert_eq!(state.job(7).unwrap().status, JobStatus::Completed);
    }
}
