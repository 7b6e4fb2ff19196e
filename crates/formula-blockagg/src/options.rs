#![forbid(unsafe_code)]

use crate::error::AggResult;
use crate::spill::{InMemorySpillLog, SpillLog};
use serde::{Deserialize, Serialize};
#[cfg(feature = "sqlite")]
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashAggOptions {
    /// Estimated group table size above which the table is spilled (default: 100MB).
    pub memory_limit_bytes: usize,
    /// Allow spilling to external storage. When disabled, exceeding the memory limit fails the
    /// query (default: true).
    pub allow_disk_use: bool,
    /// Spill after every input block that leaves the table non-empty. Diagnostic only
    /// (default: false).
    pub force_increased_spilling: bool,
    /// Maximum distinct group-by keys in one block for the block-level accumulation path
    /// (default: 5).
    pub max_partitions_for_tokenized_path: usize,
    /// Maximum rows per output block (default: 128).
    pub block_out_size: usize,
    /// Table entries sampled when estimating memory use (default: 16).
    pub memory_sample_size: usize,
    pub spill_backend: SpillBackend,
}

impl Default for HashAggOptions {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 100 * 1024 * 1024,
            allow_disk_use: true,
            force_increased_spilling: false,
            max_partitions_for_tokenized_path: 5,
            block_out_size: 128,
            memory_sample_size: 16,
            spill_backend: SpillBackend::default(),
        }
    }
}

impl HashAggOptions {
    /// Clamp sizes that must be non-zero.
    pub fn normalized(mut self) -> Self {
        self.block_out_size = self.block_out_size.max(1);
        self.memory_sample_size = self.memory_sample_size.max(1);
        self
    }
}

/// Where spilled group state is written.
///
/// Defaults to a temporary SQLite database when the `sqlite` feature is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpillBackend {
    /// Keeps spilled records in process memory, so spilling does not reduce memory use. For
    /// tests and small inputs.
    InMemory,
    /// Temporary SQLite database under `dir` (system temp dir when unset).
    #[cfg(feature = "sqlite")]
    Sqlite { dir: Option<PathBuf> },
}

impl Default for SpillBackend {
    #[cfg(feature = "sqlite")]
    fn default() -> Self {
        SpillBackend::Sqlite { dir: None }
    }

    #[cfg(not(feature = "sqlite"))]
    fn default() -> Self {
        SpillBackend::InMemory
    }
}

impl SpillBackend {
    pub fn create_log(&self) -> AggResult<Box<dyn SpillLog>> {
        match self {
            SpillBackend::InMemory => Ok(Box::new(InMemorySpillLog::new())),
            #[cfg(feature = "sqlite")]
            SpillBackend::Sqlite { dir } => Ok(Box::new(crate::spill::SqliteSpillLog::create_temp(
                dir.as_deref(),
            )?)),
        }
    }
}
