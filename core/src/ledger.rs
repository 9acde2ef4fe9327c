use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::record::{DownloadRecord, HistoryRecord, RecordId};

#[cfg(feature = "sqlite")]
use rusqlite::{params, OptionalExtension};

/// Durable store of in-progress downloads and completed-download history.
///
/// Every call is atomic on its own and no implementation holds a lock across
/// network or file I/O, so callers for different urls only contend for the
/// length of a single row operation. Same-url writers are serialized by the
/// fetcher's advisory lock, not here.
pub trait Ledger: Send + Sync {
    fn get_record(&self, url: &str) -> CoreResult<Option<DownloadRecord>>;
    fn get_history(&self, url: &str) -> CoreResult<Option<HistoryRecord>>;
    fn save(&self, record: &DownloadRecord) -> CoreResult<RecordId>;
    /// Overwrites sizes and saved file of the row for `record.url`. No-op if absent.
    fn update(&self, record: &DownloadRecord) -> CoreResult<()>;
    fn delete(&self, url: &str) -> CoreResult<()>;
    fn save_history(&self, record: &HistoryRecord) -> CoreResult<RecordId>;
    fn delete_history(&self, url: &str) -> CoreResult<()>;
    fn list_records(&self) -> CoreResult<Vec<DownloadRecord>>;
    fn list_history(&self) -> CoreResult<Vec<HistoryRecord>>;
}

/// Returns the id to reuse when `existing` is an identical row.
fn check_save(
    existing: Option<&DownloadRecord>,
    record: &DownloadRecord,
) -> CoreResult<Option<RecordId>> {
    if record.url.is_empty() {
        return Err(CoreError::Conflict("record without url".to_string()));
    }
    if record.downloaded_size > record.total_size {
        return Err(CoreError::Conflict(format!(
            "{}: downloaded {} exceeds total {}",
            record.url, record.downloaded_size, record.total_size
        )));
    }
    match existing {
        None => Ok(None),
        Some(row) if row.total_size == record.total_size && row.saved_file == record.saved_file => {
            Ok(row.id)
        }
        Some(row) => Err(CoreError::Conflict(format!(
            "{} already recorded with total {} at {}",
            row.url,
            row.total_size,
            row.saved_file.display()
        ))),
    }
}

#[derive(Default)]
struct MemoryTables {
    records: HashMap<String, DownloadRecord>,
    history: Vec<HistoryRecord>,
    next_id: RecordId,
}

impl MemoryTables {
    fn next_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    tables: Mutex<MemoryTables>,
}

impl MemoryLedger {
    fn tables(&self) -> CoreResult<std::sync::MutexGuard<'_, MemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| CoreError::Storage("ledger lock poisoned".to_string()))
    }
}

impl Ledger for MemoryLedger {
    fn get_record(&self, url: &str) -> CoreResult<Option<DownloadRecord>> {
        Ok(self.tables()?.records.get(url).cloned())
    }

    fn get_history(&self, url: &str) -> CoreResult<Option<HistoryRecord>> {
        Ok(self
            .tables()?
            .history
            .iter()
            .rev()
            .find(|row| row.url == url)
            .cloned())
    }

    fn save(&self, record: &DownloadRecord) -> CoreResult<RecordId> {
        let mut tables = self.tables()?;
        if let Some(id) = check_save(tables.records.get(&record.url), record)? {
            let mut row = record.clone();
            row.id = Some(id);
            tables.records.insert(row.url.clone(), row);
            return Ok(id);
        }
        let id = tables.next_id();
        let mut row = record.clone();
        row.id = Some(id);
        tables.records.insert(row.url.clone(), row);
        Ok(id)
    }

    fn update(&self, record: &DownloadRecord) -> CoreResult<()> {
        let mut tables = self.tables()?;
        if let Some(row) = tables.records.get_mut(&record.url) {
            row.downloaded_size = record.downloaded_size;
            row.total_size = record.total_size;
            row.saved_file = record.saved_file.clone();
        }
        Ok(())
    }

    fn delete(&self, url: &str) -> CoreResult<()> {
        self.tables()?.records.remove(url);
        Ok(())
    }

    fn save_history(&self, record: &HistoryRecord) -> CoreResult<RecordId> {
        let mut tables = self.tables()?;
        if let Some(id) = tables
            .history
            .iter()
            .find(|row| row.same_download(record))
            .and_then(|row| row.id)
        {
            return Ok(id);
        }
        let id = tables.next_id();
        let mut row = record.clone();
        row.id = Some(id);
        tables.history.push(row);
        Ok(id)
    }

    fn delete_history(&self, url: &str) -> CoreResult<()> {
        self.tables()?.history.retain(|row| row.url != url);
        Ok(())
    }

    fn list_records(&self) -> CoreResult<Vec<DownloadRecord>> {
        let mut rows: Vec<DownloadRecord> = self.tables()?.records.values().cloned().collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    fn list_history(&self) -> CoreResult<Vec<HistoryRecord>> {
        Ok(self.tables()?.history.clone())
    }
}

#[cfg(feature = "sqlite")]
pub struct SqliteLedger {
    pub path: String,
}

#[cfg(feature = "sqlite")]
impl SqliteLedger {
    pub fn new(path: impl Into<String>) -> CoreResult<Self> {
        let ledger = Self { path: path.into() };
        ledger.init()?;
        Ok(ledger)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        let conn = rusqlite::Connection::open(&self.path)
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(conn)
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS download_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                downloaded_size INTEGER NOT NULL DEFAULT 0,
                total_size INTEGER NOT NULL DEFAULT 0,
                saved_file TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS download_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                total_size INTEGER NOT NULL DEFAULT 0,
                finished_time INTEGER NOT NULL,
                saved_file TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_download_history_url ON download_history(url);
            ",
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        debug!(path = %self.path, "ledger schema ready");
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRecord> {
    Ok(DownloadRecord {
        id: Some(row.get(0)?),
        url: row.get(1)?,
        downloaded_size: row.get::<_, i64>(2)? as u64,
        total_size: row.get::<_, i64>(3)? as u64,
        saved_file: row.get::<_, String>(4)?.into(),
    })
}

#[cfg(feature = "sqlite")]
fn history_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: Some(row.get(0)?),
        url: row.get(1)?,
        total_size: row.get::<_, i64>(2)? as u64,
        finished_time: row.get::<_, i64>(3)? as u64,
        saved_file: row.get::<_, String>(4)?.into(),
    })
}

#[cfg(feature = "sqlite")]
impl Ledger for SqliteLedger {
    fn get_record(&self, url: &str) -> CoreResult<Option<DownloadRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, url, downloaded_size, total_size, saved_file FROM download_log WHERE url = ?1",
            params![url],
            record_from_row,
        )
        .optional()
        .map_err(|err| CoreError::Storage(err.to_string()))
    }

    fn get_history(&self, url: &str) -> CoreResult<Option<HistoryRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "
            SELECT id, url, total_size, finished_time, saved_file
            FROM download_history WHERE url = ?1 ORDER BY id DESC LIMIT 1
            ",
            params![url],
            history_from_row,
        )
        .optional()
        .map_err(|err| CoreError::Storage(err.to_string()))
    }

    fn save(&self, record: &DownloadRecord) -> CoreResult<RecordId> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let existing = tx
            .query_row(
                "SELECT id, url, downloaded_size, total_size, saved_file FROM download_log WHERE url = ?1",
                params![record.url.as_str()],
                record_from_row,
            )
            .optional()
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        let id = match check_save(existing.as_ref(), record)? {
            Some(id) => {
                tx.execute(
                    "UPDATE download_log SET downloaded_size = ?1 WHERE id = ?2",
                    params![record.downloaded_size as i64, id],
                )
                .map_err(|err| CoreError::Storage(err.to_string()))?;
                id
            }
            None => {
                tx.execute(
                    "
                    INSERT INTO download_log (url, downloaded_size, total_size, saved_file)
                    VALUES (?1, ?2, ?3, ?4)
                    ",
                    params![
                        record.url.as_str(),
                        record.downloaded_size as i64,
                        record.total_size as i64,
                        record.saved_file.to_string_lossy(),
                    ],
                )
                .map_err(|err| CoreError::Storage(err.to_string()))?;
                tx.last_insert_rowid()
            }
        };
        tx.commit()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(id)
    }

    fn update(&self, record: &DownloadRecord) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "
            UPDATE download_log SET downloaded_size = ?1, total_size = ?2, saved_file = ?3
            WHERE url = ?4
            ",
            params![
                record.downloaded_size as i64,
                record.total_size as i64,
                record.saved_file.to_string_lossy(),
                record.url.as_str(),
            ],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn delete(&self, url: &str) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM download_log WHERE url = ?1", params![url])
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn save_history(&self, record: &HistoryRecord) -> CoreResult<RecordId> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let saved_file = record.saved_file.to_string_lossy();
        let existing: Option<RecordId> = tx
            .query_row(
                "
                SELECT id FROM download_history
                WHERE url = ?1 AND total_size = ?2 AND saved_file = ?3
                ",
                params![record.url.as_str(), record.total_size as i64, saved_file],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let id = match existing {
            Some(id) => id,
            None => {
                tx.execute(
                    "
                    INSERT INTO download_history (url, total_size, finished_time, saved_file)
                    VALUES (?1, ?2, ?3, ?4)
                    ",
                    params![
                        record.url.as_str(),
                        record.total_size as i64,
                        record.finished_time as i64,
                        saved_file,
                    ],
                )
                .map_err(|err| CoreError::Storage(err.to_string()))?;
                tx.last_insert_rowid()
            }
        };
        tx.commit()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(id)
    }

    fn delete_history(&self, url: &str) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM download_history WHERE url = ?1", params![url])
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn list_records(&self) -> CoreResult<Vec<DownloadRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, url, downloaded_size, total_size, saved_file FROM download_log ORDER BY id ASC",
            )
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map([], record_from_row)
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|err| CoreError::Storage(err.to_string()))?);
        }
        Ok(records)
    }

    fn list_history(&self) -> CoreResult<Vec<HistoryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT id, url, total_size, finished_time, saved_file
                FROM download_history ORDER BY id ASC
                ",
            )
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map([], history_from_row)
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let mut history = Vec::new();
        for row in rows {
            history.push(row.map_err(|err| CoreError::Storage(err.to_string()))?);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, total: u64) -> DownloadRecord {
        DownloadRecord::new(url.to_string(), total, format!("/tmp/{}", total).into())
    }

    fn exercise(ledger: &dyn Ledger) {
        let url = "https://example.com/video.mp4";
        assert!(ledger.get_record(url).unwrap().is_none());

        let id = ledger.save(&record(url, 100)).unwrap();
        assert_eq!(ledger.save(&record(url, 100)).unwrap(), id);
        assert!(matches!(
            ledger.save(&record(url, 200)),
            Err(CoreError::Conflict(_))
        ));

        let mut row = ledger.get_record(url).unwrap().unwrap();
        assert_eq!(row.id, Some(id));
        row.downloaded_size = 40;
        ledger.update(&row).unwrap();
        assert_eq!(ledger.get_record(url).unwrap().unwrap().downloaded_size, 40);

        // update of an absent url is a no-op
        ledger.update(&record("https://example.com/other", 5)).unwrap();
        assert!(ledger.get_record("https://example.com/other").unwrap().is_none());

        let history = row.to_history();
        ledger.delete(url).unwrap();
        assert!(ledger.get_record(url).unwrap().is_none());

        let first = ledger.save_history(&history).unwrap();
        assert_eq!(ledger.save_history(&history).unwrap(), first);
        assert_eq!(ledger.list_history().unwrap().len(), 1);
        assert_eq!(ledger.get_history(url).unwrap().unwrap().total_size, 100);

        ledger.delete_history(url).unwrap();
        assert!(ledger.get_history(url).unwrap().is_none());
    }

    #[test]
    fn memory_ledger_lifecycle() {
        exercise(&MemoryLedger::default());
    }

    #[test]
    fn save_rejects_downloaded_past_total() {
        let ledger = MemoryLedger::default();
        let mut row = record("https://example.com/a", 10);
        row.downloaded_size = 11;
        assert!(matches!(ledger.save(&row), Err(CoreError::Conflict(_))));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_ledger_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let ledger = SqliteLedger::new(path.to_string_lossy()).unwrap();
        exercise(&ledger);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db").to_string_lossy().to_string();
        let url = "https://example.com/resume.mp4";
        {
            let ledger = SqliteLedger::new(path.clone()).unwrap();
            let mut row = record(url, 1000);
            row.downloaded_size = 300;
            ledger.save(&row).unwrap();
        }
        let ledger = SqliteLedger::new(path).unwrap();
        let row = ledger.get_record(url).unwrap().unwrap();
        assert_eq!(row.downloaded_size, 300);
        assert_eq!(ledger.list_records().unwrap().len(), 1);
    }
}
