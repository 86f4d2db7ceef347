//! Asynchronous task executor and per-kernel completion barriers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gfq_cache::{CacheData, CacheMachine};
use gfq_common::{global_metrics, GfqError, Result};
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::error;

use crate::kernel::{Kernel, TaskArgs};

/// Counted barrier over a kernel's in-flight tasks.
///
/// The executor checks tasks out before spawning them and completes them when
/// they finish, success or not. `wait_idle` suspends until the count reaches
/// zero and then surfaces the first recorded task error, so a kernel's `run`
/// observes failures only after all of its tasks have drained.
#[derive(Debug, Default)]
pub struct TaskGroup {
    outstanding: AtomicUsize,
    first_error: Mutex<Option<GfqError>>,
    notify: Notify,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkout(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn complete(&self, result: Result<()>) {
        if let Err(e) = result {
            let mut slot = self.first_error.lock().await;
            if slot.is_none() {
                *slot = Some(e);
            }
        }
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Suspend until no tasks are in flight, then report the first failure.
    pub async fn wait_idle(&self) -> Result<()> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
        match self.first_error.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Task {
    inputs: Vec<CacheData>,
    output: Arc<CacheMachine>,
    kernel: Arc<dyn Kernel>,
    args: TaskArgs,
}

/// Process-wide scheduler for kernel work units.
///
/// Explicitly constructed and handed to kernels at graph-build time; owns a
/// bounded pool of worker slots for the lifetime of one query-execution
/// process.
pub struct TaskExecutor {
    slots: Arc<Semaphore>,
}

impl TaskExecutor {
    pub fn new(task_slots: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(task_slots.max(1))),
        })
    }

    /// Enqueue one unit of work for `kernel`; non-blocking.
    ///
    /// The kernel's task group is incremented before this returns, so a
    /// subsequent `wait_idle` cannot miss the task.
    pub fn add_task(
        &self,
        inputs: Vec<CacheData>,
        output: Arc<CacheMachine>,
        kernel: Arc<dyn Kernel>,
        args: TaskArgs,
    ) {
        kernel.task_group().checkout();
        let task = Task {
            inputs,
            output,
            kernel,
            args,
        };
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let kernel = Arc::clone(&task.kernel);
            let result = match slots.acquire_owned().await {
                Ok(_permit) => execute_task(task).await,
                Err(e) => Err(GfqError::Execution(format!(
                    "failed to acquire executor slot: {e}"
                ))),
            };
            let succeeded = result.is_ok();
            if let Err(e) = &result {
                error!(kernel_id = %kernel.id(), error = %e, "kernel task failed");
            }
            global_metrics().record_task_completion(kernel.id().0, succeeded);
            kernel.task_group().complete(result).await;
        });
    }
}

async fn execute_task(task: Task) -> Result<()> {
    let Task {
        inputs,
        output,
        kernel,
        args,
    } = task;
    let batches = inputs
        .into_iter()
        .map(CacheData::materialize)
        .collect::<Result<Vec<_>>>()?;
    kernel.do_process(batches, output, args).await
}
