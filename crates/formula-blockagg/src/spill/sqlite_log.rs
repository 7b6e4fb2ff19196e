#![forbid(unsafe_code)]

use super::{RawRecord, RecordId, SpillCursor, SpillLog};
use crate::error::AggResult;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Rows fetched per cursor round-trip.
const CURSOR_BATCH_ROWS: i64 = 256;

fn init(conn: &Connection) -> rusqlite::Result<()> {
    // Spill data never outlives the query; durability is not needed.
    conn.pragma_update_and_check(None, "journal_mode", "OFF", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "OFF")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS spill_records (
          key BLOB NOT NULL,
          seq INTEGER NOT NULL,
          data BLOB NOT NULL,
          PRIMARY KEY (key, seq)
        ) WITHOUT ROWID;
        "#,
    )
}

/// Spill log stored in a temporary SQLite database, removed when the log is dropped.
#[derive(Debug)]
pub struct SqliteSpillLog {
    // Declared before `_file` so the connection closes before the file is removed.
    conn: Arc<Mutex<Connection>>,
    _file: Option<NamedTempFile>,
    next_seq: i64,
}

impl SqliteSpillLog {
    /// Create a log in a fresh temporary file under `dir` (or the system temp dir).
    pub fn create_temp(dir: Option<&Path>) -> AggResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("formula-blockagg-spill-").suffix(".sqlite");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let conn = Connection::open(file.path())?;
        Self::from_connection(conn, Some(file))
    }

    pub fn open_in_memory() -> AggResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, file: Option<NamedTempFile>) -> AggResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            _file: file,
            next_seq: 0,
        })
    }
}

impl SpillLog for SqliteSpillLog {
    fn append(&mut self, key: &[u8], data: &[u8]) -> AggResult<RecordId> {
        let seq = self.next_seq;
        let conn = self.conn.lock().expect("spill log mutex poisoned");
        conn.prepare_cached("INSERT INTO spill_records (key, seq, data) VALUES (?1, ?2, ?3)")?
            .execute(params![key, seq, data])?;
        self.next_seq += 1;
        Ok(RecordId(seq as u64))
    }

    fn cursor(&self) -> AggResult<Box<dyn SpillCursor>> {
        Ok(Box::new(SqliteCursor {
            conn: Arc::clone(&self.conn),
            last: None,
            buffered: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn storage_size(&self) -> AggResult<u64> {
        let conn = self.conn.lock().expect("spill log mutex poisoned");
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok((page_count.max(0) as u64).saturating_mul(page_size.max(0) as u64))
    }

    fn record_count(&self) -> u64 {
        self.next_seq as u64
    }
}

struct SqliteCursor {
    conn: Arc<Mutex<Connection>>,
    last: Option<(Vec<u8>, i64)>,
    buffered: VecDeque<RawRecord>,
    exhausted: bool,
}

impl SqliteCursor {
    fn fill(&mut self) -> AggResult<()> {
        let conn = self.conn.lock().expect("spill log mutex poisoned");
        let map_row = |r: &rusqlite::Row<'_>| {
            let key: Vec<u8> = r.get(0)?;
            let seq: i64 = r.get(1)?;
            let data: Vec<u8> = r.get(2)?;
            Ok(RawRecord {
                id: RecordId(seq as u64),
                key,
                data,
            })
        };

        let rows: Vec<RawRecord> = match &self.last {
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT key, seq, data FROM spill_records ORDER BY key, seq LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![CURSOR_BATCH_ROWS], map_row)?
                    .collect::<rusqlite::Result<_>>()?;
                rows
            }
            Some((key, seq)) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT key, seq, data FROM spill_records \
                     WHERE key > ?1 OR (key = ?1 AND seq > ?2) \
                     ORDER BY key, seq LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![key, seq, CURSOR_BATCH_ROWS], map_row)?
                    .collect::<rusqlite::Result<_>>()?;
                rows
            }
        };

        if (rows.len() as i64) < CURSOR_BATCH_ROWS {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.last = Some((last.key.clone(), last.id.0 as i64));
        }
        self.buffered.extend(rows);
        Ok(())
    }
}

impl SpillCursor for SqliteCursor {
    fn next(&mut self) -> AggResult<Option<RawRecord>> {
        if self.buffered.is_empty() && !self.exhausted {
            self.fill()?;
        }
        Ok(self.buffered.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_pages_through_ordered_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SqliteSpillLog::create_temp(Some(dir.path())).unwrap();
        let total = (CURSOR_BATCH_ROWS as usize) * 2 + 7;
        for i in 0..total {
            let key = [(i % 3) as u8];
            log.append(&key, &(i as u32).to_be_bytes()).unwrap();
        }
        assert_eq!(log.record_count(), total as u64);
        assert!(log.storage_size().unwrap() > 0);

        let mut cursor = log.cursor().unwrap();
        let mut previous: Option<(Vec<u8>, u64)> = None;
        let mut count = 0;
        while let Some(record) = cursor.next().unwrap() {
            let current = (record.key.clone(), record.id.0);
            if let Some(prev) = &previous {
                assert!(prev < &current, "records must come back in (key, seq) order");
            }
            previous = Some(current);
            count += 1;
        }
        assert_eq!(count, total);
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn temp_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteSpillLog::create_temp(Some(dir.path())).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        drop(log);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
