//! Bounded batch caches sitting on the edges of the execution graph.
//!
//! Architecture role:
//! - [`CacheData`] wraps eager batches and deferred Arrow-IPC payloads
//! - [`CacheMachine`] buffers entries between two kernels with flow control,
//!   completion signaling, and count-gated waits

pub mod cache_data;
pub mod cache_machine;

pub use cache_data::{decode_batches_ipc, encode_batch_ipc, CacheData};
pub use cache_machine::{CacheMachine, DEFAULT_CACHE_ID};
