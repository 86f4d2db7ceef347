//! Graph-level bookkeeping and stage driving.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::try_join_all;
use gfq_cache::CacheMachine;
use gfq_common::{KernelId, Result};

use crate::kernel::{Kernel, KernelStatus};

/// Row-estimate registry for the kernels of one query graph.
///
/// Upstream stages (or the planner) record how many rows they expect to feed
/// a kernel; kernels consult it to extrapolate their own output estimates.
#[derive(Debug, Default)]
pub struct QueryGraph {
    input_row_estimates: RwLock<HashMap<KernelId, u64>>,
}

impl QueryGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_estimated_input_rows(&self, kernel: KernelId, rows: u64) {
        if let Ok(mut estimates) = self.input_row_estimates.write() {
            estimates.insert(kernel, rows);
        }
    }

    pub fn estimated_input_rows_to_kernel(&self, kernel: KernelId) -> Option<u64> {
        self.input_row_estimates
            .read()
            .ok()
            .and_then(|estimates| estimates.get(&kernel).copied())
    }
}

/// Run one kernel to completion and mark its output cache finished, so the
/// downstream kernel's pulls can drain and terminate.
pub async fn run_stage(kernel: Arc<dyn Kernel>, output: Arc<CacheMachine>) -> Result<KernelStatus> {
    let status = kernel.run().await?;
    output.finish().await;
    Ok(status)
}

/// Drive several kernels concurrently; fails fast on the first kernel error.
pub async fn run_stages(stages: Vec<(Arc<dyn Kernel>, Arc<CacheMachine>)>) -> Result<()> {
    try_join_all(
        stages
            .into_iter()
            .map(|(kernel, output)| run_stage(kernel, output)),
    )
    .await?;
    Ok(())
}
