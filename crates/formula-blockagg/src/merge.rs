#![forbid(unsafe_code)]

use crate::error::AggResult;
use crate::expr::{AccumulatorSlot, AccumulatorSwitch, AggExpr};
use crate::spill::{decode_record, SpillCursor};
use crate::value::MaterializedRow;
use std::mem;

type Recovered = (MaterializedRow, MaterializedRow);

/// Rebuilds fully merged groups from a spill log.
///
/// The cursor yields all partial aggregates of one key contiguously. Since it has no peek
/// operation, the first record of the next key is held in a one-record stash until the
/// following call.
pub struct SpillMergeReader {
    cursor: Box<dyn SpillCursor>,
    key_width: usize,
    merging_exprs: Vec<Box<dyn AggExpr>>,
    stash: Option<Recovered>,
    scratch: MaterializedRow,
    switch: AccumulatorSwitch,
    records_read: u64,
    stashes: u64,
}

impl std::fmt::Debug for SpillMergeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillMergeReader")
            .field("key_width", &self.key_width)
            .field("merging_exprs", &self.merging_exprs)
            .field("stash", &self.stash)
            .field("records_read", &self.records_read)
            .finish_non_exhaustive()
    }
}

impl SpillMergeReader {
    pub fn new(
        cursor: Box<dyn SpillCursor>,
        key_width: usize,
        merging_exprs: Vec<Box<dyn AggExpr>>,
    ) -> Self {
        let switch = AccumulatorSwitch::new(AccumulatorSlot::Scratch);
        let scratch = MaterializedRow::new(merging_exprs.len());
        Self {
            cursor,
            key_width,
            merging_exprs,
            stash: None,
            scratch,
            switch,
            records_read: 0,
            stashes: 0,
        }
    }

    /// Records consumed from the cursor so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// How many times a record was stashed at a key boundary.
    pub fn stash_count(&self) -> u64 {
        self.stashes
    }

    /// The next merged `(key, accumulators)` group, or `None` once the log is exhausted.
    pub fn next_group(&mut self) -> AggResult<Option<Recovered>> {
        self.scratch = MaterializedRow::new(self.merging_exprs.len());

        let (key, first) = match self.stash.take() {
            Some(stashed) => stashed,
            None => match self.read()? {
                Some(recovered) => recovered,
                None => return Ok(None),
            },
        };
        self.merge_partial(&first)?;

        while let Some((next_key, partial)) = self.read()? {
            if next_key != key {
                self.stash = Some((next_key, partial));
                self.stashes += 1;
                break;
            }
            self.merge_partial(&partial)?;
        }

        let accumulators = mem::take(&mut self.scratch);
        Ok(Some((key, accumulators)))
    }

    fn read(&mut self) -> AggResult<Option<Recovered>> {
        let Some(record) = self.cursor.next()? else {
            return Ok(None);
        };
        self.records_read += 1;
        decode_record(&record.data, self.key_width).map(Some)
    }

    fn merge_partial(&mut self, partial: &MaterializedRow) -> AggResult<()> {
        assert_eq!(
            partial.len(),
            self.merging_exprs.len(),
            "spilled accumulator row does not match the merging expressions"
        );
        self.switch.update(
            &mut [],
            self.scratch.as_mut_slice(),
            self.merging_exprs.iter(),
            None,
            &[],
            Some(partial.as_slice()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funcs::AggFn;
    use crate::spill::{encode_key, encode_record, InMemorySpillLog, SpillLog};
    use crate::value::Value;

    fn append(log: &mut InMemorySpillLog, key: &[Value], accs: &[Value]) {
        log.append(&encode_key(key), &encode_record(key, accs).unwrap()).unwrap();
    }

    #[test]
    fn empty_log_yields_no_group() {
        let log = InMemorySpillLog::new();
        let mut reader =
            SpillMergeReader::new(log.cursor().unwrap(), 1, vec![AggFn::Sum.merging_expr()]);
        assert!(reader.next_group().unwrap().is_none());
        assert!(reader.next_group().unwrap().is_none());
    }

    #[test]
    fn singleton_group_is_returned_at_end_of_log() {
        let mut log = InMemorySpillLog::new();
        append(&mut log, &[Value::Int(1)], &[Value::Int(7)]);
        let mut reader =
            SpillMergeReader::new(log.cursor().unwrap(), 1, vec![AggFn::Sum.merging_expr()]);

        let (key, accs) = reader.next_group().unwrap().unwrap();
        assert_eq!(key.as_slice(), &[Value::Int(1)]);
        assert_eq!(accs.as_slice(), &[Value::Int(7)]);
        assert!(reader.next_group().unwrap().is_none());
        assert_eq!(reader.stash_count(), 0);
    }

    #[test]
    fn merges_multiple_accumulators() {
        let mut log = InMemorySpillLog::new();
        let key = [Value::string("k")];
        append(&mut log, &key, &[Value::Int(2), Value::Int(5)]);
        append(&mut log, &key, &[Value::Int(3), Value::Int(1)]);
        let mut reader = SpillMergeReader::new(
            log.cursor().unwrap(),
            1,
            vec![AggFn::Sum.merging_expr(), AggFn::Min.merging_expr()],
        );
        let (_, accs) = reader.next_group().unwrap().unwrap();
        assert_eq!(accs.as_slice(), &[Value::Int(5), Value::Int(1)]);
    }
}
