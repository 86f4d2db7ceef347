//! Kernel trait and lifecycle contract.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use gfq_cache::CacheMachine;
use gfq_common::{KernelId, Result};

use crate::executor::TaskGroup;

/// Terminal state of a successful kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Proceed,
}

/// Free-form per-task arguments forwarded to [`Kernel::do_process`].
pub type TaskArgs = HashMap<String, String>;

/// One operator in the execution graph.
///
/// `run` drives control flow: it drains the input cache, wraps pulled batches
/// into tasks on the executor, and does not return [`KernelStatus::Proceed`]
/// until its [`TaskGroup`] reports zero in-flight tasks. `do_process` is the
/// unit of work: it transforms a fixed batch set into output pushed to the
/// output cache, and may run concurrently with other tasks of the same kernel.
#[async_trait]
pub trait Kernel: Send + Sync {
    fn id(&self) -> KernelId;

    /// Barrier tracking this kernel's in-flight tasks.
    fn task_group(&self) -> &TaskGroup;

    async fn run(self: Arc<Self>) -> Result<KernelStatus>;

    async fn do_process(
        self: Arc<Self>,
        inputs: Vec<RecordBatch>,
        output: Arc<CacheMachine>,
        args: TaskArgs,
    ) -> Result<()>;

    /// Estimated rows this kernel will emit over its lifetime, if knowable.
    fn estimated_output_rows(&self) -> Option<u64> {
        None
    }
}
