//! Kernel lifecycle, task barriers, and the asynchronous task executor.
//!
//! Architecture role:
//! - [`QueryContext`] carries query identity and cluster topology
//! - [`Kernel`] is the operator contract: `run` drives control flow,
//!   `do_process` performs one unit of work
//! - [`TaskExecutor`] runs units of work on a bounded worker pool;
//!   [`TaskGroup`] is the per-kernel completion barrier
//! - [`QueryGraph`] tracks row estimates and [`run_stage`] finishes output
//!   caches once a kernel proceeds

pub mod context;
pub mod executor;
pub mod graph;
pub mod kernel;

pub use context::QueryContext;
pub use executor::{TaskExecutor, TaskGroup};
pub use graph::{run_stage, run_stages, QueryGraph};
pub use kernel::{Kernel, KernelStatus, TaskArgs};
