//! Transport boundary between cluster nodes.
//!
//! The engine never talks to a socket directly: kernels go through
//! [`BatchTransport`], which moves serialized batches and partition-count
//! announcements to a peer node's registered cache/count table. The
//! in-process implementation backs embedded runs and tests; a networked
//! implementation plugs in behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use gfq_cache::{encode_batch_ipc, CacheData, CacheMachine};
use gfq_common::{global_metrics, GfqError, KernelId, NodeId, QueryId, Result};
use tokio::sync::RwLock;

use crate::shuffle::PartitionCountTable;

/// Addressing for one kernel's shuffle traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRoute {
    pub query_id: QueryId,
    pub kernel_id: KernelId,
    pub cache_id: String,
}

impl MessageRoute {
    pub fn new(query_id: QueryId, kernel_id: KernelId) -> Self {
        Self {
            query_id,
            kernel_id,
            cache_id: String::new(),
        }
    }
}

/// Moves batches and partition counts between nodes.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Deliver a batch into the cache registered for `route` on `target`.
    async fn send_batch(
        &self,
        target: NodeId,
        route: &MessageRoute,
        batch: RecordBatch,
    ) -> Result<()>;

    /// Announce to `target` how many partitions `from` has sent it.
    async fn send_partition_count(
        &self,
        target: NodeId,
        route: &MessageRoute,
        from: NodeId,
        count: u64,
    ) -> Result<()>;
}

type CacheRegistry = HashMap<(NodeId, MessageRoute), Arc<CacheMachine>>;
type CountRegistry = HashMap<(NodeId, MessageRoute), Arc<PartitionCountTable>>;

/// Loopback transport routing every node's traffic inside one process.
///
/// Batches still cross an Arrow IPC serialization boundary so the payload
/// path matches what a networked transport would carry.
#[derive(Default)]
pub struct InProcessTransport {
    caches: RwLock<CacheRegistry>,
    count_tables: RwLock<CountRegistry>,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_cache(
        &self,
        node: NodeId,
        route: MessageRoute,
        cache: Arc<CacheMachine>,
    ) {
        self.caches.write().await.insert((node, route), cache);
    }

    pub async fn register_count_table(
        &self,
        node: NodeId,
        route: MessageRoute,
        table: Arc<PartitionCountTable>,
    ) {
        self.count_tables.write().await.insert((node, route), table);
    }
}

#[async_trait]
impl BatchTransport for InProcessTransport {
    async fn send_batch(
        &self,
        target: NodeId,
        route: &MessageRoute,
        batch: RecordBatch,
    ) -> Result<()> {
        let cache = self
            .caches
            .read()
            .await
            .get(&(target, route.clone()))
            .cloned()
            .ok_or_else(|| {
                GfqError::Communication(format!(
                    "no cache registered on node {target} for kernel {}",
                    route.kernel_id
                ))
            })?;

        let payload = encode_batch_ipc(&batch)?;
        let data = CacheData::from_ipc(payload)?;
        cache.add_to_cache(data, &route.cache_id, false).await?;
        let query_id = route.query_id.to_string();
        global_metrics().record_shuffle_sent(&query_id, route.kernel_id.0, 1);
        global_metrics().record_shuffle_received(&query_id, route.kernel_id.0, 1);
        Ok(())
    }

    async fn send_partition_count(
        &self,
        target: NodeId,
        route: &MessageRoute,
        from: NodeId,
        count: u64,
    ) -> Result<()> {
        let table = self
            .count_tables
            .read()
            .await
            .get(&(target, route.clone()))
            .cloned()
            .ok_or_else(|| {
                GfqError::Communication(format!(
                    "no partition count table registered on node {target} for kernel {}",
                    route.kernel_id
                ))
            })?;
        table.record(from, count).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use gfq_cache::DEFAULT_CACHE_ID;

    fn batch(values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
            .expect("batch")
    }

    #[tokio::test]
    async fn delivers_batches_to_the_registered_cache_as_ipc_payloads() {
        let transport = InProcessTransport::new();
        let route = MessageRoute::new(QueryId(1), KernelId(7));
        let cache = Arc::new(CacheMachine::new("remote_in"));
        transport
            .register_cache(NodeId(1), route.clone(), Arc::clone(&cache))
            .await;

        transport
            .send_batch(NodeId(1), &route, batch(&[1, 2, 3]))
            .await
            .expect("send");

        let data = cache.pull_from_cache(DEFAULT_CACHE_ID).await.expect("entry");
        assert!(matches!(&data, CacheData::Ipc { .. }));
        assert_eq!(data.num_rows(), 3);
        assert_eq!(data.materialize().expect("decode"), batch(&[1, 2, 3]));
    }

    #[tokio::test]
    async fn unregistered_targets_are_communication_errors() {
        let transport = InProcessTransport::new();
        let route = MessageRoute::new(QueryId(1), KernelId(7));
        let err = transport
            .send_batch(NodeId(0), &route, batch(&[1]))
            .await
            .expect_err("must fail");
        assert!(matches!(err, GfqError::Communication(_)));
    }
}
