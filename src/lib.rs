//! Host supervisor. Keeps one continuous job host per job running in step
//! with its definition on disk, and invokes its functions through a durable
//! queue.

pub mod config;
pub mod error;
pub mod invocation;
pub mod jobs;
pub mod manager;
pub mod process;
pub mod supervisor;
pub mod watcher;
