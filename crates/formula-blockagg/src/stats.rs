#![forbid(unsafe_code)]

use crate::expr::SlotId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Spill statistics for one operator instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HashAggStats {
    /// Number of spill events (full-table dumps).
    pub spills: u64,
    /// Records appended to the spill log.
    pub spilled_records: u64,
    /// Serialized record bytes appended to the spill log.
    pub spilled_bytes: u64,
    /// Size of the spill log's backing storage once input was exhausted.
    pub spilled_data_storage_size: u64,
}

/// Lifecycle counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommonStats {
    pub opens: u64,
    pub closes: u64,
    pub advances: u64,
    pub is_eof: bool,
}

/// Snapshot of the process-wide group counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupCounters {
    pub spills: u64,
    pub spilled_data_storage_size: u64,
    pub spilled_records: u64,
}

static GROUP_SPILLS: AtomicU64 = AtomicU64::new(0);
static GROUP_SPILLED_STORAGE: AtomicU64 = AtomicU64::new(0);
static GROUP_SPILLED_RECORDS: AtomicU64 = AtomicU64::new(0);

/// Totals accumulated from every operator dropped so far in this process.
pub fn group_counters() -> GroupCounters {
    GroupCounters {
        spills: GROUP_SPILLS.load(Ordering::Relaxed),
        spilled_data_storage_size: GROUP_SPILLED_STORAGE.load(Ordering::Relaxed),
        spilled_records: GROUP_SPILLED_RECORDS.load(Ordering::Relaxed),
    }
}

pub(crate) fn record_group_counters(stats: &HashAggStats) {
    GROUP_SPILLS.fetch_add(stats.spills, Ordering::Relaxed);
    GROUP_SPILLED_STORAGE.fetch_add(stats.spilled_data_storage_size, Ordering::Relaxed);
    GROUP_SPILLED_RECORDS.fetch_add(stats.spilled_records, Ordering::Relaxed);
}

/// Plan shape and runtime statistics for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub stage: &'static str,
    pub bitset_slot: SlotId,
    pub group_by_slots: Vec<SlotId>,
    pub block_expressions: BTreeMap<SlotId, String>,
    pub row_expressions: BTreeMap<SlotId, String>,
    pub accumulator_data_slots: Vec<SlotId>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub merging_expressions: BTreeMap<SlotId, String>,
    pub common: CommonStats,
    pub spill: HashAggStats,
}

impl PlanSummary {
    pub fn to_json(&self) -> serde_json::Value {
        // Only strings, integers and maps with integer keys; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
