use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Heartbeat is only allowed in shard mode: {0}")]
    NotAShard(String),

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("RPC {op} failed: {message}")]
    Rpc { op: &'static str, message: String },

    #[error("RPC {op} timed out after {timeout:?}")]
    RpcTimeout { op: &'static str, timeout: Duration },

    #[error("Host {hostname} is already assigned to spec [{existing}]")]
    DuplicateHost { hostname: String, existing: String },

    #[error("Not enough machines: {specs} host specs but only {num} allowed")]
    InadequateHosts { specs: usize, num: usize },

    #[error("No hosts available for {0}")]
    NoHosts(String),

    #[error("Dedup lookup failed: {0}")]
    Dedup(String),

    #[error("Scheduling failed: {0}")]
    Schedule(String),

    #[error("Malformed task entry: {0}")]
    MalformedTask(String),
}

impl LabError {
    pub fn rpc(op: &'static str, message: impl Into<String>) -> Self {
        LabError::Rpc {
            op,
            message: message.into(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LabError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Errors worth retrying or skipping to the next loop tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, LabError::Rpc { .. } | LabError::RpcTimeout { .. })
    }

    /// Errors that mean the deployment itself is broken.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LabError::Config(_) | LabError::NotAShard(_) | LabError::Filesystem { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_are_transient() {
        assert!(LabError::rpc("get_hosts", "connection reset").is_transient());
        assert!(LabError::RpcTimeout {
            op: "get_hosts",
            timeout: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!LabError::Config("missing".into()).is_transient());
    }

    #[test]
    fn config_and_filesystem_errors_are_fatal() {
        assert!(LabError::NotAShard("no hostname".into()).is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = LabError::filesystem("/leases", io);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("/leases"));
        assert!(!LabError::Schedule("boom".into()).is_fatal());
    }
}
