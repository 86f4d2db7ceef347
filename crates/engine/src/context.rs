//! Per-query context shared by every kernel in a graph.

use std::sync::atomic::{AtomicU32, Ordering};

use gfq_common::{GfqError, NodeId, QueryId, Result};

/// Query-wide identity and topology: the query token, step/substep counters,
/// and which cluster node this process is plus which node is the master.
#[derive(Debug)]
pub struct QueryContext {
    query_id: QueryId,
    step: AtomicU32,
    substep: AtomicU32,
    total_nodes: u32,
    self_node: NodeId,
    master_node: NodeId,
}

impl QueryContext {
    pub fn new(
        query_id: QueryId,
        total_nodes: u32,
        self_node: NodeId,
        master_node: NodeId,
    ) -> Result<Self> {
        if total_nodes == 0 {
            return Err(GfqError::InvalidConfig(
                "a query context needs at least one node".to_string(),
            ));
        }
        if self_node.0 >= total_nodes || master_node.0 >= total_nodes {
            return Err(GfqError::InvalidConfig(format!(
                "node indexes (self {self_node}, master {master_node}) must be below the node count {total_nodes}"
            )));
        }
        Ok(Self {
            query_id,
            step: AtomicU32::new(0),
            substep: AtomicU32::new(0),
            total_nodes,
            self_node,
            master_node,
        })
    }

    /// Single-process topology: one node that is its own master.
    pub fn single_node(query_id: QueryId) -> Self {
        Self {
            query_id,
            step: AtomicU32::new(0),
            substep: AtomicU32::new(0),
            total_nodes: 1,
            self_node: NodeId(0),
            master_node: NodeId(0),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn total_nodes(&self) -> u32 {
        self.total_nodes
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> {
        (0..self.total_nodes).map(NodeId)
    }

    pub fn self_node(&self) -> NodeId {
        self.self_node
    }

    pub fn master_node(&self) -> NodeId {
        self.master_node
    }

    pub fn is_master(&self, node: NodeId) -> bool {
        node == self.master_node
    }

    pub fn step(&self) -> u32 {
        self.step.load(Ordering::SeqCst)
    }

    pub fn substep(&self) -> u32 {
        self.substep.load(Ordering::SeqCst)
    }

    pub fn advance_step(&self) -> u32 {
        self.step.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn advance_substep(&self) -> u32 {
        self.substep.fetch_add(1, Ordering::SeqCst) + 1
    }
}
