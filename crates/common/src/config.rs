use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target row count for batches produced by upstream scan stages.
    pub batch_size_rows: usize,
    /// Max concurrent kernel task executions per process.
    pub task_slots: usize,
    /// Batches a cache buffers before pushes suspend the producer.
    pub cache_flow_control_batches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 8192,
            task_slots: 4,
            cache_flow_control_batches: 64,
        }
    }
}
