pub mod config;
pub mod error;
pub mod hosts;
pub mod inventory;
pub mod lease;
pub mod scheduler;
pub mod shard;
pub mod shutdown;
