//! Function invocation through the host's durable queue.
//!
//! - `message`: the invoke message wire format
//! - `storage`: queue/blob collaborators (in-memory and directory-backed)
//! - `dispatcher`: enqueue + status polling by correlation id

pub mod dispatcher;
pub mod message;
pub mod storage;

pub use dispatcher::{InvocationDispatcher, queue_name, status_key};
pub use message::InvocationMessage;
pub use storage::{BlobStore, DirectoryStorage, MemoryStorage, QueueClient};
