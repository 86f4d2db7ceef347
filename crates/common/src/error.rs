use thiserror::Error;

/// Canonical GridFlow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`GfqError::InvalidConfig`]: topology/config/cache-wiring contract violations
/// - [`GfqError::Expression`]: aggregation expression strings that fail to parse
/// - [`GfqError::Execution`]: runtime kernel evaluation, decode/encode, or data-shape failures
/// - [`GfqError::Communication`]: batch/count delivery failures between nodes
/// - [`GfqError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum GfqError {
    /// Invalid or inconsistent configuration/topology state.
    ///
    /// Examples:
    /// - self/master node index outside the cluster node range
    /// - scatter called with a partition list not aligned to the node count
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Aggregation expression parse failures.
    ///
    /// Examples:
    /// - missing `group=[{..}]` clause
    /// - unknown aggregate function name
    #[error("expression error: {0}")]
    Expression(String),

    /// Runtime execution failures after kernel construction succeeded.
    ///
    /// Examples:
    /// - column type mismatch while accumulating aggregate state
    /// - IPC decode failures on batches pulled from a cache
    /// - pushing into a cache that was already marked finished
    #[error("execution error: {0}")]
    Execution(String),

    /// Failures delivering batches or partition counts to a peer node.
    #[error("communication error: {0}")]
    Communication(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard GridFlow result alias.
pub type Result<T> = std::result::Result<T, GfqError>;
