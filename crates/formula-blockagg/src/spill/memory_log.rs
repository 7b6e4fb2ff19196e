#![forbid(unsafe_code)]

use super::{RawRecord, RecordId, SpillCursor, SpillLog};
use crate::error::AggResult;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

type Records = BTreeMap<(Vec<u8>, u64), Vec<u8>>;

/// Spill log held in process memory. Useful for tests and for small spill volumes.
#[derive(Debug, Default, Clone)]
pub struct InMemorySpillLog {
    records: Arc<Mutex<Records>>,
    next_seq: u64,
}

impl InMemorySpillLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpillLog for InMemorySpillLog {
    fn append(&mut self, key: &[u8], data: &[u8]) -> AggResult<RecordId> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut records = self.records.lock().expect("spill log mutex poisoned");
        records.insert((key.to_vec(), seq), data.to_vec());
        Ok(RecordId(seq))
    }

    fn cursor(&self) -> AggResult<Box<dyn SpillCursor>> {
        Ok(Box::new(InMemoryCursor {
            records: Arc::clone(&self.records),
            last: None,
        }))
    }

    fn storage_size(&self) -> AggResult<u64> {
        let records = self.records.lock().expect("spill log mutex poisoned");
        Ok(records
            .iter()
            .map(|((key, _), data)| (key.len() + data.len() + 8) as u64)
            .sum())
    }

    fn record_count(&self) -> u64 {
        self.next_seq
    }
}

struct InMemoryCursor {
    records: Arc<Mutex<Records>>,
    last: Option<(Vec<u8>, u64)>,
}

impl SpillCursor for InMemoryCursor {
    fn next(&mut self) -> AggResult<Option<RawRecord>> {
        let records = self.records.lock().expect("spill log mutex poisoned");
        let lower = match &self.last {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Unbounded,
        };
        let Some(((key, seq), data)) = records.range((lower, Bound::Unbounded)).next() else {
            return Ok(None);
        };
        self.last = Some((key.clone(), *seq));
        Ok(Some(RawRecord {
            id: RecordId(*seq),
            key: key.clone(),
            data: data.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_groups_equal_keys_in_append_order() {
        let mut log = InMemorySpillLog::new();
        log.append(b"b", b"1").unwrap();
        log.append(b"a", b"2").unwrap();
        log.append(b"b", b"3").unwrap();
        log.append(b"a", b"4").unwrap();

        let mut cursor = log.cursor().unwrap();
        let mut seen = Vec::new();
        while let Some(record) = cursor.next().unwrap() {
            seen.push((record.key, record.data));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"2".to_vec()),
                (b"a".to_vec(), b"4".to_vec()),
                (b"b".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"3".to_vec()),
            ]
        );
        assert!(cursor.next().unwrap().is_none());
        assert_eq!(log.record_count(), 4);
        assert!(log.storage_size().unwrap() > 0);
    }
}
