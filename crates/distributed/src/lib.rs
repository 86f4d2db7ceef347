//! Cross-node shuffle protocol and the distributed aggregation kernels.
//!
//! Architecture role:
//! - [`transport`] is the boundary to the physical network: a trait moving
//!   serialized batches and partition-count announcements, with an
//!   in-process implementation for embedded runs and tests
//! - [`shuffle`] tracks per-target send counts and resolves the cross-node
//!   partition-count reconciliation barrier
//! - [`aggregates`] holds the compute/distribute/merge kernels composing a
//!   distributed GROUP BY

pub mod aggregates;
pub mod shuffle;
pub mod transport;

pub use aggregates::{ComputeAggregateKernel, DistributeAggregateKernel, MergeAggregateKernel};
pub use shuffle::{PartitionCountTable, ShuffleCoordinator};
pub use transport::{BatchTransport, InProcessTransport, MessageRoute};
