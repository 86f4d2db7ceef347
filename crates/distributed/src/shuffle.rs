//! Shuffle coordination: per-target send tracking and the cross-node
//! partition-count reconciliation barrier.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use gfq_cache::{CacheData, CacheMachine};
use gfq_common::{GfqError, NodeId, Result};
use gfq_engine::QueryContext;
use tokio::sync::{Mutex, Notify};

use crate::transport::{BatchTransport, MessageRoute};

/// Per-sender partition counts for one kernel's shuffle.
///
/// Each peer announces once how many partitions it shipped here; the local
/// node records its own contribution the same way. The barrier resolves when
/// every node of the cluster has reported.
#[derive(Debug, Default)]
pub struct PartitionCountTable {
    counts: Mutex<HashMap<NodeId, u64>>,
    notify: Notify,
}

impl PartitionCountTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record `node`'s announced partition count. A re-announcement from the
    /// same node replaces its previous value.
    pub async fn record(&self, node: NodeId, count: u64) {
        self.counts.lock().await.insert(node, count);
        self.notify.notify_waiters();
    }

    pub async fn reported_nodes(&self) -> usize {
        self.counts.lock().await.len()
    }

    /// Suspend until all `total_nodes` nodes have reported, then return the
    /// summed partition count.
    ///
    /// There is no timeout: a peer that never reports blocks the barrier
    /// forever. Detecting dead peers belongs to cluster membership, not here.
    pub async fn wait_for_all(&self, total_nodes: u32) -> u64 {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            {
                let counts = self.counts.lock().await;
                if counts.len() >= total_nodes as usize {
                    return counts.values().sum();
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

/// Shuffle capability held by a distributing kernel.
///
/// Tracks how many partitions were routed to each target (local appends
/// included), ships batches through the transport, and drives the
/// reconciliation barrier once the kernel's local work has drained.
pub struct ShuffleCoordinator {
    ctx: Arc<QueryContext>,
    route: MessageRoute,
    transport: Arc<dyn BatchTransport>,
    received: Arc<PartitionCountTable>,
    sent: Mutex<HashMap<NodeId, u64>>,
}

impl ShuffleCoordinator {
    pub fn new(
        ctx: Arc<QueryContext>,
        route: MessageRoute,
        transport: Arc<dyn BatchTransport>,
        received: Arc<PartitionCountTable>,
    ) -> Self {
        Self {
            ctx,
            route,
            transport,
            received,
            sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn route(&self) -> &MessageRoute {
        &self.route
    }

    /// Count table peers announce into; register it with the transport under
    /// this coordinator's route.
    pub fn received_counts(&self) -> Arc<PartitionCountTable> {
        Arc::clone(&self.received)
    }

    /// Count one partition appended locally for `node` (normally the self
    /// node, whose shuffle traffic never crosses the transport).
    pub async fn increment_node_count(&self, node: NodeId) {
        *self.sent.lock().await.entry(node).or_insert(0) += 1;
    }

    /// Ship one batch to every listed target.
    pub async fn send(&self, batch: RecordBatch, targets: &[NodeId]) -> Result<()> {
        self.ctx.advance_substep();
        for &target in targets {
            if target == self.ctx.self_node() {
                return Err(GfqError::Communication(
                    "send targets must be peer nodes; local appends go through the output cache"
                        .to_string(),
                ));
            }
            self.increment_node_count(target).await;
            self.transport
                .send_batch(target, &self.route, batch.clone())
                .await?;
        }
        Ok(())
    }

    /// Scatter index-aligned partitions: partition `i` goes to node `i`, the
    /// self node's partition is appended straight to the local output cache.
    pub async fn scatter(
        &self,
        partitions: Vec<RecordBatch>,
        output: &Arc<CacheMachine>,
    ) -> Result<()> {
        if partitions.len() != self.ctx.total_nodes() as usize {
            return Err(GfqError::Execution(format!(
                "scatter needs one partition per node: got {} for {} nodes",
                partitions.len(),
                self.ctx.total_nodes()
            )));
        }
        self.ctx.advance_substep();
        for (idx, partition) in partitions.into_iter().enumerate() {
            let node = NodeId(idx as u32);
            self.increment_node_count(node).await;
            if node == self.ctx.self_node() {
                output
                    .add_to_cache(CacheData::Batch(partition), &self.route.cache_id, false)
                    .await?;
            } else {
                self.transport
                    .send_batch(node, &self.route, partition)
                    .await?;
            }
        }
        Ok(())
    }

    /// Broadcast this node's per-target counts so every peer can resolve its
    /// own barrier; records the local contribution directly.
    pub async fn announce_partition_counts(&self) -> Result<()> {
        self.ctx.advance_substep();
        let sent = self.sent.lock().await.clone();
        for node in self.ctx.nodes() {
            let count = sent.get(&node).copied().unwrap_or(0);
            if node == self.ctx.self_node() {
                self.received.record(node, count).await;
            } else {
                self.transport
                    .send_partition_count(node, &self.route, self.ctx.self_node(), count)
                    .await?;
            }
        }
        Ok(())
    }

    /// Resolve the reconciliation barrier: total partitions this node's
    /// output cache will eventually hold.
    pub async fn total_partition_count(&self) -> u64 {
        self.received.wait_for_all(self.ctx.total_nodes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfq_common::QueryId;
    use std::time::Duration;

    #[tokio::test]
    async fn barrier_resolves_only_after_every_node_reports() {
        let table = PartitionCountTable::new();
        table.record(NodeId(0), 2).await;

        let waiter = Arc::clone(&table);
        let barrier = tokio::spawn(async move { waiter.wait_for_all(3).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!barrier.is_finished(), "barrier must wait for peers");

        table.record(NodeId(1), 0).await;
        table.record(NodeId(2), 5).await;
        assert_eq!(barrier.await.expect("join"), 7);
    }

    #[tokio::test]
    async fn reannouncement_replaces_the_previous_count() {
        let table = PartitionCountTable::new();
        table.record(NodeId(0), 2).await;
        table.record(NodeId(0), 3).await;
        assert_eq!(table.reported_nodes().await, 1);
        assert_eq!(table.wait_for_all(1).await, 3);
    }

    #[tokio::test]
    async fn single_node_announce_resolves_locally() {
        let ctx = Arc::new(QueryContext::single_node(QueryId(9)));
        let transport = crate::transport::InProcessTransport::new();
        let coordinator = ShuffleCoordinator::new(
            ctx,
            MessageRoute::new(QueryId(9), gfq_common::KernelId(1)),
            transport,
            PartitionCountTable::new(),
        );
        coordinator.increment_node_count(NodeId(0)).await;
        coordinator.increment_node_count(NodeId(0)).await;
        coordinator
            .announce_partition_counts()
            .await
            .expect("announce");
        assert_eq!(coordinator.total_partition_count().await, 2);
    }
}
