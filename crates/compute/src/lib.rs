//! Columnar compute primitives over Arrow record batches.
//!
//! Architecture role:
//! - scalar bridge between Arrow arrays and engine-side group keys
//! - table-level primitives: hash partitioning, split, concatenation,
//!   schema-preserving empty tables
//! - hash aggregation in partial and merge modes
//! - aggregation expression parsing into [`GroupByParams`]
//!
//! Key modules:
//! - [`scalar`]
//! - [`tables`]
//! - [`aggregate`]
//! - [`expressions`]

pub mod aggregate;
pub mod expressions;
pub mod scalar;
pub mod tables;

pub use aggregate::{
    aggregate_with_groupby, aggregate_without_groupby, groupby_without_aggregations, AggregateKind,
    AggregateMode,
};
pub use expressions::{
    group_by_parameters_for_merge, parse_group_by_expression, GroupByParams,
};
pub use scalar::ScalarValue;
pub use tables::{
    batch_bytes, concat_strings_will_overflow, concatenate, empty_like, hash_partition, split,
};
