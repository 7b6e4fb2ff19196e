#![forbid(unsafe_code)]

use super::{encode_key, encode_record, SpillCursor, SpillLog};
use crate::error::{AggError, AggResult};
use crate::options::HashAggOptions;
use crate::stats::HashAggStats;
use crate::table::GroupTable;
use log::{debug, warn};

/// Decides when to evict the group table and writes it to the spill log.
///
/// The log is created on the first spill. Once anything has been spilled, [`Self::finish`]
/// flushes the remaining table so that all finished state lives in the log.
#[derive(Debug, Default)]
pub struct SpillManager {
    log: Option<Box<dyn SpillLog>>,
    stats: HashAggStats,
}

impl SpillManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_spilled(&self) -> bool {
        self.log.is_some()
    }

    pub fn stats(&self) -> &HashAggStats {
        &self.stats
    }

    /// Run after each accumulated block: spill if forced or if the table is over budget.
    pub fn check_and_spill(
        &mut self,
        table: &mut GroupTable,
        options: &HashAggOptions,
    ) -> AggResult<()> {
        if table.is_empty() {
            return Ok(());
        }
        if options.force_increased_spilling {
            return self.spill(table, options);
        }

        let estimated = table.estimate_memory_bytes(options.memory_sample_size);
        if estimated <= options.memory_limit_bytes {
            return Ok(());
        }
        debug!(
            "block_group table estimated at {estimated} bytes exceeds limit of {} bytes",
            options.memory_limit_bytes
        );
        self.spill(table, options)
    }

    /// Append every table entry to the log, then clear the table.
    ///
    /// Fails with [`AggError::MemoryLimitExceeded`] when disk use is disabled.
    pub fn spill(&mut self, table: &mut GroupTable, options: &HashAggOptions) -> AggResult<()> {
        if !options.allow_disk_use {
            let used = table.estimate_memory_bytes(options.memory_sample_size);
            warn!(
                "block_group needs to spill {used} bytes but disk use is disabled (limit {} bytes)",
                options.memory_limit_bytes
            );
            return Err(AggError::MemoryLimitExceeded {
                used,
                limit: options.memory_limit_bytes,
            });
        }

        let log = match &mut self.log {
            Some(log) => log,
            None => self.log.insert(options.spill_backend.create_log()?),
        };

        let mut bytes = 0u64;
        for (key, accumulators) in table.iter() {
            let key_bytes = encode_key(key.as_slice());
            let data = encode_record(key.as_slice(), accumulators.as_slice())?;
            bytes += (key_bytes.len() + data.len()) as u64;
            log.append(&key_bytes, &data)?;
        }

        let records = table.len() as u64;
        self.stats.spills += 1;
        self.stats.spilled_records += records;
        self.stats.spilled_bytes += bytes;
        debug!(
            "block_group spill #{}: {records} records, {bytes} bytes ({} records in log)",
            self.stats.spills,
            log.record_count()
        );

        table.clear();
        Ok(())
    }

    /// End of input. Returns a cursor over the log if anything was spilled, flushing whatever
    /// is still in the table first.
    pub fn finish(
        &mut self,
        table: &mut GroupTable,
        options: &HashAggOptions,
    ) -> AggResult<Option<Box<dyn SpillCursor>>> {
        if self.log.is_none() {
            return Ok(None);
        }
        if !table.is_empty() {
            self.spill(table, options)?;
        }
        let Some(log) = &self.log else {
            return Ok(None);
        };
        self.stats.spilled_data_storage_size = log.storage_size()?;
        Ok(Some(log.cursor()?))
    }

    /// Forget the log (and its storage). Statistics are kept.
    pub fn reset(&mut self) {
        self.log = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn table_with(keys: &[i64]) -> GroupTable {
        let mut table = GroupTable::new(1);
        for &k in keys {
            table.find_or_insert(&[Value::Int(k)]).as_mut_slice()[0] = Value::Int(1);
        }
        table
    }

    #[test]
    fn forced_spilling_clears_table_every_time() {
        let options = HashAggOptions {
            force_increased_spilling: true,
            ..HashAggOptions::default()
        };
        let mut manager = SpillManager::new();
        let mut table = table_with(&[1, 2]);
        manager.check_and_spill(&mut table, &options).unwrap();
        assert!(table.is_empty());

        let mut table = table_with(&[1]);
        manager.check_and_spill(&mut table, &options).unwrap();
        assert_eq!(manager.stats().spills, 2);
        assert_eq!(manager.stats().spilled_records, 3);
    }

    #[test]
    fn under_budget_keeps_table_in_memory() {
        let mut manager = SpillManager::new();
        let mut table = table_with(&[1, 2, 3]);
        manager
            .check_and_spill(&mut table, &HashAggOptions::default())
            .unwrap();
        assert_eq!(table.len(), 3);
        assert!(!manager.has_spilled());
        assert!(manager
            .finish(&mut table, &HashAggOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn over_budget_without_disk_use_fails() {
        let options = HashAggOptions {
            memory_limit_bytes: 1,
            allow_disk_use: false,
            ..HashAggOptions::default()
        };
        let mut table = table_with(&[1]);
        let err = SpillManager::new()
            .check_and_spill(&mut table, &options)
            .unwrap_err();
        assert!(matches!(err, AggError::MemoryLimitExceeded { limit: 1, .. }));
    }

    #[test]
    fn forced_spilling_without_disk_use_fails() {
        let options = HashAggOptions {
            force_increased_spilling: true,
            allow_disk_use: false,
            ..HashAggOptions::default()
        };
        let mut table = table_with(&[1]);
        let mut manager = SpillManager::new();
        assert!(manager.check_and_spill(&mut table, &options).is_err());
        assert!(!manager.has_spilled());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn finish_flushes_leftovers_after_a_spill() {
        let options = HashAggOptions {
            memory_limit_bytes: 1,
            ..HashAggOptions::default()
        };
        let mut manager = SpillManager::new();
        let mut table = table_with(&[1, 2]);
        manager.check_and_spill(&mut table, &options).unwrap();

        let mut table = table_with(&[3]);
        let relaxed = HashAggOptions::default();
        let mut cursor = manager.finish(&mut table, &relaxed).unwrap().unwrap();
        assert!(table.is_empty());

        let mut count = 0;
        while cursor.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(manager.stats().spilled_data_storage_size > 0);
    }
}
