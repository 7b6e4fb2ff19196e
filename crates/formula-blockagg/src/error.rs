#![forbid(unsafe_code)]

pub type AggResult<T> = Result<T, AggError>;

/// Recoverable failures surfaced by the operator.
///
/// Planning/compilation bugs (mismatched batch lengths, duplicate slots, spilled key width
/// mismatches) are not represented here; they abort via assertions.
#[derive(Debug, thiserror::Error)]
pub enum AggError {
    #[error("operation interrupted")]
    Interrupted,

    #[error(
        "exceeded memory limit for block_group: estimated {used} bytes, limit {limit} bytes, \
         and disk use is not allowed"
    )]
    MemoryLimitExceeded { used: usize, limit: usize },

    #[cfg(feature = "sqlite")]
    #[error("spill storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("spill io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spill record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt spill record: {0}")]
    CorruptSpillRecord(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("expression error: {0}")]
    Expression(String),
}
