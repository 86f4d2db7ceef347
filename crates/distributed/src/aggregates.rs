//! Distributed aggregation kernels.
//!
//! Three kernels compose one distributed GROUP BY:
//! - [`ComputeAggregateKernel`] partially aggregates each batch locally;
//! - [`DistributeAggregateKernel`] hash-partitions partial results across the
//!   cluster (or consolidates groupless partials onto the master node) and
//!   holds the partition-count reconciliation barrier;
//! - [`MergeAggregateKernel`] concatenates everything the shuffle deposited
//!   on this node and computes the final aggregation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use gfq_cache::{CacheData, CacheMachine, DEFAULT_CACHE_ID};
use gfq_common::{global_metrics, GfqError, KernelId, Result};
use gfq_compute::{
    aggregate_with_groupby, aggregate_without_groupby, batch_bytes, concat_strings_will_overflow,
    concatenate, empty_like, group_by_parameters_for_merge, groupby_without_aggregations,
    hash_partition, parse_group_by_expression, split, AggregateMode, GroupByParams,
};
use gfq_engine::{Kernel, KernelStatus, QueryContext, QueryGraph, TaskArgs, TaskExecutor, TaskGroup};
use tracing::{debug, error, info, warn};

use crate::shuffle::{PartitionCountTable, ShuffleCoordinator};
use crate::transport::{BatchTransport, MessageRoute};

/// Local partial aggregation: one task per input batch, one partial result
/// batch per task.
pub struct ComputeAggregateKernel {
    id: KernelId,
    params: GroupByParams,
    ctx: Arc<QueryContext>,
    graph: Arc<QueryGraph>,
    input: Arc<CacheMachine>,
    output: Arc<CacheMachine>,
    executor: Arc<TaskExecutor>,
    tasks: TaskGroup,
}

impl ComputeAggregateKernel {
    pub fn new(
        id: KernelId,
        expression: &str,
        ctx: Arc<QueryContext>,
        graph: Arc<QueryGraph>,
        input: Arc<CacheMachine>,
        output: Arc<CacheMachine>,
        executor: Arc<TaskExecutor>,
    ) -> Result<Self> {
        let params = parse_group_by_expression(expression)?;
        Ok(Self {
            id,
            params,
            ctx,
            graph,
            input,
            output,
            executor,
            tasks: TaskGroup::new(),
        })
    }
}

#[async_trait]
impl Kernel for ComputeAggregateKernel {
    fn id(&self) -> KernelId {
        self.id
    }

    fn task_group(&self) -> &TaskGroup {
        &self.tasks
    }

    async fn run(self: Arc<Self>) -> Result<KernelStatus> {
        let started = Instant::now();
        while let Some(data) = self.input.pull_cache_data().await {
            self.executor.add_task(
                vec![data],
                Arc::clone(&self.output),
                Arc::clone(&self) as Arc<dyn Kernel>,
                TaskArgs::new(),
            );
        }
        debug!(
            query_id = %self.ctx.query_id(),
            step = self.ctx.step(),
            substep = self.ctx.substep(),
            kernel_id = %self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compute aggregate tasks created"
        );

        self.tasks.wait_idle().await?;

        debug!(
            query_id = %self.ctx.query_id(),
            step = self.ctx.step(),
            substep = self.ctx.substep(),
            kernel_id = %self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compute aggregate kernel completed"
        );
        Ok(KernelStatus::Proceed)
    }

    async fn do_process(
        self: Arc<Self>,
        inputs: Vec<RecordBatch>,
        output: Arc<CacheMachine>,
        _args: TaskArgs,
    ) -> Result<()> {
        let input = inputs.into_iter().next().ok_or_else(|| {
            GfqError::Execution("compute aggregate task needs one input batch".to_string())
        })?;
        let rows_in = input.num_rows() as u64;

        let columns = if self.params.is_distinct_only() {
            groupby_without_aggregations(&input, &self.params.group_indices)?
        } else if self.params.is_groupless() {
            aggregate_without_groupby(
                &input,
                &self.params.inputs,
                &self.params.kinds,
                &self.params.aliases,
                AggregateMode::Partial,
            )?
        } else {
            aggregate_with_groupby(
                &input,
                &self.params.inputs,
                &self.params.kinds,
                &self.params.aliases,
                &self.params.group_indices,
                AggregateMode::Partial,
            )?
        };

        global_metrics().record_kernel_io(
            &self.ctx.query_id().to_string(),
            self.id.0,
            rows_in,
            columns.num_rows() as u64,
        );
        output
            .add_to_cache(CacheData::Batch(columns), DEFAULT_CACHE_ID, false)
            .await?;
        Ok(())
    }

    fn estimated_output_rows(&self) -> Option<u64> {
        if !self.params.kinds.is_empty() && self.params.group_indices.is_empty() {
            // A groupless aggregation collapses to a single row.
            return Some(1);
        }
        let total_in = self.graph.estimated_input_rows_to_kernel(self.id)?;
        let in_so_far = self.input.num_rows_added();
        if in_so_far == 0 {
            return None;
        }
        let out_so_far = self.output.num_rows_added();
        Some((total_in as f64 * out_so_far as f64 / in_so_far as f64) as u64)
    }
}

/// Routes partial aggregates to the nodes owning their group keys, or
/// consolidates groupless partials onto the master node.
pub struct DistributeAggregateKernel {
    id: KernelId,
    params: GroupByParams,
    columns_to_hash: Vec<usize>,
    ctx: Arc<QueryContext>,
    input: Arc<CacheMachine>,
    output: Arc<CacheMachine>,
    executor: Arc<TaskExecutor>,
    tasks: TaskGroup,
    shuffle: ShuffleCoordinator,
    placeholder_created: AtomicBool,
}

impl DistributeAggregateKernel {
    pub fn new(
        id: KernelId,
        expression: &str,
        ctx: Arc<QueryContext>,
        input: Arc<CacheMachine>,
        output: Arc<CacheMachine>,
        executor: Arc<TaskExecutor>,
        transport: Arc<dyn BatchTransport>,
    ) -> Result<Self> {
        let params = parse_group_by_expression(expression)?;
        let columns_to_hash = params.group_indices.clone();
        let route = MessageRoute::new(ctx.query_id(), id);
        let shuffle = ShuffleCoordinator::new(
            Arc::clone(&ctx),
            route,
            transport,
            PartitionCountTable::new(),
        );
        Ok(Self {
            id,
            params,
            columns_to_hash,
            ctx,
            input,
            output,
            executor,
            tasks: TaskGroup::new(),
            shuffle,
            placeholder_created: AtomicBool::new(false),
        })
    }

    /// Shuffle capability, exposed so graph wiring can register this node's
    /// inbound route (output cache + count table) with the transport.
    pub fn shuffle(&self) -> &ShuffleCoordinator {
        &self.shuffle
    }
}

#[async_trait]
impl Kernel for DistributeAggregateKernel {
    fn id(&self) -> KernelId {
        self.id
    }

    fn task_group(&self) -> &TaskGroup {
        &self.tasks
    }

    async fn run(self: Arc<Self>) -> Result<KernelStatus> {
        let started = Instant::now();
        while let Some(data) = self.input.pull_cache_data().await {
            self.executor.add_task(
                vec![data],
                Arc::clone(&self.output),
                Arc::clone(&self) as Arc<dyn Kernel>,
                TaskArgs::new(),
            );
        }
        debug!(
            query_id = %self.ctx.query_id(),
            step = self.ctx.step(),
            substep = self.ctx.substep(),
            kernel_id = %self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "distribute aggregate tasks created"
        );

        self.tasks.wait_idle().await?;

        // Every local task has routed its batch; reconcile partition counts
        // with the peers, then hold the merge stage back until everything
        // shipped to this node has actually arrived.
        self.shuffle.announce_partition_counts().await?;
        let total = self.shuffle.total_partition_count().await;
        self.output.wait_for_count(total).await;

        debug!(
            query_id = %self.ctx.query_id(),
            step = self.ctx.step(),
            substep = self.ctx.substep(),
            kernel_id = %self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "distribute aggregate kernel completed"
        );
        Ok(KernelStatus::Proceed)
    }

    async fn do_process(
        self: Arc<Self>,
        inputs: Vec<RecordBatch>,
        output: Arc<CacheMachine>,
        _args: TaskArgs,
    ) -> Result<()> {
        let input = inputs.into_iter().next().ok_or_else(|| {
            GfqError::Execution("distribute aggregate task needs one input batch".to_string())
        })?;
        let num_partitions = self.ctx.total_nodes() as usize;

        if self.params.group_indices.is_empty() {
            // Groupless aggregation is global: exactly one node computes it.
            let self_node = self.ctx.self_node();
            if self.ctx.is_master(self_node) {
                let added = output
                    .add_to_cache(CacheData::Batch(input), DEFAULT_CACHE_ID, false)
                    .await?;
                if added {
                    self.shuffle.increment_node_count(self_node).await;
                }
            } else {
                if !self.placeholder_created.swap(true, Ordering::SeqCst) {
                    // Keep one empty batch here so this node's cache is never
                    // empty even though all real data ships to the master.
                    let empty = empty_like(&input);
                    let added = output
                        .add_to_cache(CacheData::Batch(empty), DEFAULT_CACHE_ID, true)
                        .await?;
                    if added {
                        self.shuffle.increment_node_count(self_node).await;
                    }
                }
                self.shuffle
                    .send(input, &[self.ctx.master_node()])
                    .await?;
            }
        } else {
            let partitions = if input.num_rows() > 0 {
                let (reordered, offsets) =
                    hash_partition(&input, &self.columns_to_hash, num_partitions)?;
                // offsets lead with 0, which split must not see
                split(&reordered, &offsets[1..])
            } else {
                (0..num_partitions).map(|_| empty_like(&input)).collect()
            };
            self.shuffle.scatter(partitions, &output).await?;
        }
        Ok(())
    }
}

/// Combines everything the shuffle deposited on this node into one final
/// per-node result. Not streamable: it needs every shuffled partition before
/// producing output.
pub struct MergeAggregateKernel {
    id: KernelId,
    expression: String,
    params: GroupByParams,
    ctx: Arc<QueryContext>,
    input: Arc<CacheMachine>,
    output: Arc<CacheMachine>,
    executor: Arc<TaskExecutor>,
    tasks: TaskGroup,
}

impl MergeAggregateKernel {
    pub fn new(
        id: KernelId,
        expression: &str,
        ctx: Arc<QueryContext>,
        input: Arc<CacheMachine>,
        output: Arc<CacheMachine>,
        executor: Arc<TaskExecutor>,
    ) -> Result<Self> {
        let params = parse_group_by_expression(expression)?;
        Ok(Self {
            id,
            expression: expression.to_string(),
            params,
            ctx,
            input,
            output,
            executor,
            tasks: TaskGroup::new(),
        })
    }
}

#[async_trait]
impl Kernel for MergeAggregateKernel {
    fn id(&self) -> KernelId {
        self.id
    }

    fn task_group(&self) -> &TaskGroup {
        &self.tasks
    }

    async fn run(self: Arc<Self>) -> Result<KernelStatus> {
        let started = Instant::now();

        // Merge needs all of its input before it can produce any output.
        self.input.wait_until_finished().await;

        let mut inputs = Vec::new();
        while self.input.wait_for_next().await {
            if let Some(data) = self.input.pull_cache_data().await {
                inputs.push(data);
            }
        }
        let batch_count = inputs.len();

        self.executor.add_task(
            inputs,
            Arc::clone(&self.output),
            Arc::clone(&self) as Arc<dyn Kernel>,
            TaskArgs::new(),
        );
        debug!(
            query_id = %self.ctx.query_id(),
            step = self.ctx.step(),
            substep = self.ctx.substep(),
            kernel_id = %self.id,
            batch_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merge aggregate task created"
        );

        if let Err(e) = self.tasks.wait_idle().await {
            // TODO(retry): resubmit the merge task instead of failing the
            // query once a retry policy lands.
            error!(
                query_id = %self.ctx.query_id(),
                step = self.ctx.step(),
                substep = self.ctx.substep(),
                kernel_id = %self.id,
                expression = %self.expression,
                error = %e,
                "merge aggregate kernel failed"
            );
            return Err(e);
        }

        debug!(
            query_id = %self.ctx.query_id(),
            step = self.ctx.step(),
            substep = self.ctx.substep(),
            kernel_id = %self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merge aggregate kernel completed"
        );
        Ok(KernelStatus::Proceed)
    }

    async fn do_process(
        self: Arc<Self>,
        inputs: Vec<RecordBatch>,
        output: Arc<CacheMachine>,
        _args: TaskArgs,
    ) -> Result<()> {
        let started = Instant::now();

        if concat_strings_will_overflow(&inputs) {
            // Surfaced, not fatal: downstream results may truncate strings.
            warn!(
                query_id = %self.ctx.query_id(),
                step = self.ctx.step(),
                substep = self.ctx.substep(),
                kernel_id = %self.id,
                "concatenating shuffled partials may overflow string column capacity"
            );
        }
        let concatenated = concatenate(&inputs)?;
        let input_rows = concatenated.num_rows();
        let input_bytes = batch_bytes(&concatenated);

        let merged_names: Vec<String> = concatenated
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let merge_params = group_by_parameters_for_merge(&self.params, &merged_names)?;

        let columns = if self.params.is_distinct_only() {
            groupby_without_aggregations(&concatenated, &merge_params.group_indices)?
        } else if self.params.is_groupless() {
            if self.ctx.is_master(self.ctx.self_node()) {
                aggregate_without_groupby(
                    &concatenated,
                    &merge_params.inputs,
                    &merge_params.kinds,
                    &merge_params.aliases,
                    AggregateMode::Merge,
                )?
            } else {
                // The distribute stage deposited an empty batch with the right
                // schema here; only the master holds real groupless data.
                concatenated
            }
        } else {
            aggregate_with_groupby(
                &concatenated,
                &merge_params.inputs,
                &merge_params.kinds,
                &merge_params.aliases,
                &merge_params.group_indices,
                AggregateMode::Merge,
            )?
        };

        info!(
            node = %self.ctx.self_node(),
            query_id = %self.ctx.query_id(),
            kernel_id = %self.id,
            input_rows,
            input_bytes,
            output_rows = columns.num_rows(),
            output_bytes = batch_bytes(&columns),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merge aggregate computed"
        );
        global_metrics().record_kernel_io(
            &self.ctx.query_id().to_string(),
            self.id.0,
            input_rows as u64,
            columns.num_rows() as u64,
        );
        output
            .add_to_cache(CacheData::Batch(columns), DEFAULT_CACHE_ID, false)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "aggregates_tests.rs"]
mod tests;
