//! Host selection and host locking.

pub mod group;
pub mod lock;
pub mod spec;

pub use group::{build_host_group, choose_hosts, ExplicitHostGroup, HostGroup, MetaHostGroup};
pub use lock::{HostLockManager, HostsLockedBy};
pub use spec::{order_by_complexity, HostSpec};
