//! Shard side of the master/shard split: a local view of hosts and jobs,
//! refreshed by heartbeat.

pub mod client;
pub mod state;

pub use client::ShardClient;
pub use state::ShardState;
