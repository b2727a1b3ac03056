use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};
use sync_lib::{DeviceId, FileRecord, FileSet, SyncError, SyncResult};

const WITH_HAVE_PAGE_SIZE: usize = 256;

/// File records per device, one row per (device, name), the record kept as json.
pub struct LocalFileSetDB {
    db_path: String,
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> SyncError {
    SyncError::DbError(e.to_string())
}

impl LocalFileSetDB {
    pub fn open(db_path: String) -> SyncResult<Self> {
        debug!("LocalFileSetDB: open db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("LocalFileSetDB: open db failed! {}", e.to_string());
            db_err(e)
        })?;
        Self::init(db_path, conn)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(":memory:".to_string(), conn)
    }

    fn init(db_path: String, conn: Connection) -> SyncResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS files (
                device TEXT NOT NULL,
                name TEXT NOT NULL,
                record TEXT NOT NULL,
                update_time INTEGER NOT NULL,
                PRIMARY KEY (device, name)
            )",
            [],
        )
        .map_err(|e| {
            warn!(
                "LocalFileSetDB: create table files failed! {}",
                e.to_string()
            );
            db_err(e)
        })?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::InvalidState("file set db lock poisoned".to_string()))
    }

    fn parse_record(name: &str, record_str: &str) -> SyncResult<FileRecord> {
        serde_json::from_str(record_str).map_err(|e| {
            warn!("LocalFileSetDB: decode record {} failed! {}", name, e);
            SyncError::InvalidData(format!("decode record {}: {}", name, e))
        })
    }

    // Holds the connection only for the duration of one page.
    fn load_page(&self, device: &str, after: Option<&str>) -> SyncResult<Vec<FileRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT name, record FROM files
                 WHERE device = ?1 AND (?2 IS NULL OR name > ?2)
                 ORDER BY name LIMIT ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![device, after, WITH_HAVE_PAGE_SIZE as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(db_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (name, record_str) = row.map_err(db_err)?;
            records.push(Self::parse_record(&name, &record_str)?);
        }
        Ok(records)
    }

    pub fn count(&self, device: &DeviceId) -> SyncResult<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM files WHERE device = ?1",
                params![device.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

impl FileSet for LocalFileSetDB {
    fn with_have(
        &self,
        device: &DeviceId,
        visit: &mut dyn FnMut(&FileRecord) -> bool,
    ) -> SyncResult<()> {
        let device = device.to_string();
        let mut last_name: Option<String> = None;
        loop {
            let page = self.load_page(&device, last_name.as_deref())?;
            let full_page = page.len() == WITH_HAVE_PAGE_SIZE;
            for record in page.iter() {
                if !visit(record) {
                    return Ok(());
                }
            }
            if !full_page {
                return Ok(());
            }
            last_name = page.last().map(|r| r.name.clone());
        }
    }

    fn get(&self, device: &DeviceId, name: &str) -> SyncResult<Option<FileRecord>> {
        let conn = self.lock_conn()?;
        let record_str: Option<String> = conn
            .query_row(
                "SELECT record FROM files WHERE device = ?1 AND name = ?2",
                params![device.to_string(), name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match record_str {
            Some(s) => Ok(Some(Self::parse_record(name, &s)?)),
            None => Ok(None),
        }
    }

    fn update(&self, device: &DeviceId, records: &[FileRecord]) -> SyncResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let device = device.to_string();

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO files (device, name, record, update_time)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(device, name) DO UPDATE SET
                        record = excluded.record,
                        update_time = excluded.update_time",
                )
                .map_err(db_err)?;
            for record in records {
                let record_str = serde_json::to_string(record)?;
                stmt.execute(params![device, record.name, record_str, now])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        debug!("LocalFileSetDB: updated {} records", records.len());
        Ok(())
    }
}
