//! Vectorized block hash aggregation for Formula.
//!
//! This crate focuses on:
//! - Grouping batches of columnar blocks by one or more key columns.
//! - Block-at-a-time accumulation when a batch has few distinct keys, row-at-a-time otherwise.
//! - Bounded memory: the group table spills to an ordered log and is merged back on output.

#![forbid(unsafe_code)]

mod bitmap;
mod block;
mod error;
mod expr;
mod funcs;
mod merge;
mod operator;
mod options;
mod spill;
mod stats;
mod stream;
mod table;
mod tokenize;
mod value;

pub use crate::bitmap::BitVec;
pub use crate::block::{Block, Deblocked, TokenizedBlock};
pub use crate::error::{AggError, AggResult};
pub use crate::expr::{
    AccumulatorSlot, AccumulatorSwitch, AggExpr, BlockRowAccumulators, DataInput, EvalEnv, SlotId,
};
pub use crate::funcs::{AggDef, AggFn, AggForm, BuiltinAgg};
pub use crate::merge::SpillMergeReader;
pub use crate::operator::{BlockHashAgg, BlockHashAggConfig, OperatorState, OutputBatch};
pub use crate::options::{HashAggOptions, SpillBackend};
#[cfg(feature = "sqlite")]
pub use crate::spill::SqliteSpillLog;
pub use crate::spill::{
    decode_record, encode_key, encode_record, InMemorySpillLog, RawRecord, RecordId, SpillCursor,
    SpillLog, SpillManager,
};
pub use crate::stats::{group_counters, CommonStats, GroupCounters, HashAggStats, PlanSummary};
pub use crate::stream::{BatchColumn, BlockStream, InputBatch, InterruptHandle, VecBlockStream};
pub use crate::table::GroupTable;
pub use crate::tokenize::{partition_bitmap, tokenize_group_by, TokenizedKeys};
pub use crate::value::{MaterializedRow, Value};
