//! SQLite-backed durable mock storage.
//!
//! Every call opens its own connection, so the store is cheap to share across
//! blocking tasks. The `qa_api` table is created on first open, and tables left by
//! older deployments (no `headers` or timestamp columns) are upgraded in place.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::{
    params, Connection, ErrorCode, OpenFlags, Params, Row, Transaction, TransactionBehavior,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::storage::{
    Headers, MockRecord, MockStore, MockSummary, MockUpdate, StorageError, Upserted,
};

const SCHEMA_VERSION: i32 = 1;

/// Virtual machine steps between deadline checks.
const PROGRESS_STEPS: i32 = 1_000;

const RECORD_COLUMNS: &str = "id, uri, uri_pattern, http_method, status_code, response_body, \
                              headers, created_at, updated_at";

/// Durable storage for mock records in a SQLite database file.
///
/// Each call is bounded by `call_timeout`: lock waits give up after half of it, running
/// statements are interrupted once it has passed, and a transaction that overran it is
/// rolled back instead of committed.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    call_timeout: Duration,
}

impl SqliteStore {
    /// Open the database, creating or migrating the `qa_api` table.
    ///
    /// # Parameters
    ///
    /// - `db_path` - Database file; its parent directory must exist
    /// - `call_timeout` - Upper bound on each call, lock waits included
    ///
    /// # Returns
    ///
    /// Returns the store once the schema is usable.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file cannot be opened or the schema cannot be migrated.
    pub fn open(db_path: impl Into<PathBuf>, call_timeout: Duration) -> Result<Self, StorageError> {
        let store = Self { db_path: db_path.into(), call_timeout };
        let mut conn = store.connect()?;
        migrate(&mut conn)?;
        Ok(store)
    }

    /// Path of the database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.db_path, flags)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(self.call_timeout / 2)?;

        Ok(conn)
    }

    /// Run `op` on a fresh connection whose statements stop at the call deadline.
    fn bounded<T>(
        &self,
        op: impl FnOnce(&mut Connection, Instant) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let deadline = Instant::now() + self.call_timeout;
        let mut conn = self.connect()?;
        conn.progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));

        op(&mut conn, deadline).map_err(|err| match err {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::OperationInterrupted =>
            {
                StorageError::Timeout(self.call_timeout)
            }
            other => other,
        })
    }

    /// Commit unless the deadline has passed; an overrun transaction is rolled back.
    fn commit(&self, tx: Transaction<'_>, deadline: Instant) -> Result<(), StorageError> {
        if Instant::now() >= deadline {
            tx.rollback()?;
            return Err(StorageError::Timeout(self.call_timeout));
        }
        tx.progress_handler(0, None::<fn() -> bool>);
        tx.commit()?;
        Ok(())
    }
}

impl MockStore for SqliteStore {
    fn ping(&self) -> Result<(), StorageError> {
        self.bounded(|conn, _| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    fn upsert(&self, candidate: MockRecord, update: &MockUpdate) -> Result<Upserted, StorageError> {
        self.bounded(|conn, deadline| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing = select_records(
                &tx,
                "WHERE uri = ?1 AND http_method = ?2 ORDER BY rowid LIMIT 1",
                params![candidate.uri, candidate.http_method],
            )?
            .into_iter()
            .next();

            let outcome = match existing {
                Some(mut record) => {
                    record.apply(update);
                    write_record(&tx, &record)?;
                    Upserted { id: record.id, created: false }
                }
                None => {
                    insert_record(&tx, &candidate)?;
                    Upserted { id: candidate.id, created: true }
                }
            };

            self.commit(tx, deadline)?;
            Ok(outcome)
        })
    }

    fn get(&self, id: &str) -> Result<Option<MockRecord>, StorageError> {
        self.bounded(|conn, _| {
            Ok(select_records(conn, "WHERE id = ?1", params![id])?.into_iter().next())
        })
    }

    fn list(&self) -> Result<Vec<MockRecord>, StorageError> {
        self.bounded(|conn, _| select_records(conn, "ORDER BY rowid", []))
    }

    fn list_by_method(&self, method: &str) -> Result<Vec<MockRecord>, StorageError> {
        self.bounded(|conn, _| {
            select_records(conn, "WHERE http_method = ?1 ORDER BY rowid", params![method])
        })
    }

    fn summaries(&self) -> Result<Vec<MockSummary>, StorageError> {
        self.bounded(|conn, _| {
            let mut stmt = conn
                .prepare("SELECT id, uri, http_method, status_code FROM qa_api ORDER BY rowid")?;
            let rows = stmt.query_map([], |row| {
                Ok(MockSummary {
                    id: row.get(0)?,
                    uri: row.get(1)?,
                    http_method: row.get(2)?,
                    status_code: row.get(3)?,
                })
            })?;
            let summaries = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(summaries)
        })
    }

    fn update(&self, id: &str, update: &MockUpdate) -> Result<bool, StorageError> {
        self.bounded(|conn, deadline| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(mut record) =
                select_records(&tx, "WHERE id = ?1", params![id])?.into_iter().next()
            else {
                return Ok(false);
            };

            if !update.is_empty() {
                record.apply(update);
                let owner = select_records(
                    &tx,
                    "WHERE uri = ?1 AND http_method = ?2 AND id <> ?3 LIMIT 1",
                    params![record.uri, record.http_method, record.id],
                )?
                .into_iter()
                .next();
                if let Some(owner) = owner {
                    return Err(StorageError::RouteTaken {
                        uri: record.uri,
                        http_method: record.http_method,
                        owner: owner.id,
                    });
                }
                write_record(&tx, &record)?;
            }

            self.commit(tx, deadline)?;
            Ok(true)
        })
    }

    fn delete(&self, id: &str) -> Result<bool, StorageError> {
        self.bounded(|conn, _| {
            let removed = conn.execute("DELETE FROM qa_api WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
    }

    fn delete_all(&self) -> Result<(), StorageError> {
        self.bounded(|conn, _| {
            conn.execute("DELETE FROM qa_api", [])?;
            Ok(())
        })
    }

    fn exists(&self, id: &str) -> Result<bool, StorageError> {
        self.bounded(|conn, _| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM qa_api WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    fn count(&self) -> Result<usize, StorageError> {
        self.bounded(|conn, _| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM qa_api", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }
}

/// Raw column values of one `qa_api` row.
struct StoredRow {
    id: String,
    uri: String,
    uri_pattern: String,
    http_method: String,
    status_code: u16,
    response_body: String,
    headers: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uri: row.get(1)?,
            uri_pattern: row.get(2)?,
            http_method: row.get(3)?,
            status_code: row.get(4)?,
            response_body: row.get(5)?,
            headers: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<MockRecord, StorageError> {
        let headers: Headers = match self.headers.as_deref() {
            None | Some("") => Headers::new(),
            Some(json) => serde_json::from_str(json)?,
        };

        Ok(MockRecord {
            id: self.id,
            uri: self.uri,
            uri_pattern: self.uri_pattern,
            http_method: self.http_method,
            status_code: self.status_code,
            response_body: serde_json::from_str(&self.response_body)?,
            headers,
            created_at: parse_timestamp(self.created_at.as_deref()),
            updated_at: parse_timestamp(self.updated_at.as_deref()),
        })
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<OffsetDateTime> {
    value.and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

fn select_records<P: Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<MockRecord>, StorageError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM qa_api {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, StoredRow::from_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

fn insert_record(conn: &Connection, record: &MockRecord) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO qa_api (id, uri, uri_pattern, http_method, status_code, response_body,
            headers, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
            strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
        params![
            record.id,
            record.uri,
            record.uri_pattern,
            record.http_method,
            record.status_code,
            serde_json::to_string(&record.response_body)?,
            serde_json::to_string(&record.headers)?,
        ],
    )?;
    Ok(())
}

fn write_record(conn: &Connection, record: &MockRecord) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE qa_api
         SET uri = ?1, uri_pattern = ?2, http_method = ?3, status_code = ?4,
             response_body = ?5, headers = ?6,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?7",
        params![
            record.uri,
            record.uri_pattern,
            record.http_method,
            record.status_code,
            serde_json::to_string(&record.response_body)?,
            serde_json::to_string(&record.headers)?,
            record.id,
        ],
    )?;
    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<(), StorageError> {
    let user_version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;

    match user_version {
        0 => {
            let tx = conn.transaction()?;
            if table_exists(&tx)? {
                upgrade_legacy_table(&tx)?;
            } else {
                tx.execute_batch(
                    r#"
                    CREATE TABLE qa_api (
                      id TEXT PRIMARY KEY,
                      uri TEXT NOT NULL,
                      http_method TEXT NOT NULL,
                      status_code INTEGER NOT NULL,
                      response_body TEXT NOT NULL,
                      uri_pattern TEXT NOT NULL,
                      headers TEXT NOT NULL DEFAULT '{}',
                      created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                      updated_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                    );
                    "#,
                )?;
            }
            tx.execute_batch(
                "CREATE INDEX IF NOT EXISTS ix_qa_api_method_uri ON qa_api(http_method, uri);",
            )?;
            tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            tx.commit()?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => Err(StorageError::Schema(format!(
            "unsupported qa_api schema version {user_version} (expected {SCHEMA_VERSION})"
        ))),
    }
}

fn table_exists(conn: &Connection) -> Result<bool, StorageError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'qa_api')",
        [],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Bring a table created before headers and timestamps existed up to date.
fn upgrade_legacy_table(conn: &Connection) -> Result<(), StorageError> {
    let mut stmt = conn.prepare("PRAGMA table_info(qa_api)")?;
    let columns =
        stmt.query_map([], |row| row.get::<_, String>(1))?.collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    let has = |name: &str| columns.iter().any(|c| c == name);

    if !has("headers") {
        conn.execute_batch("ALTER TABLE qa_api ADD COLUMN headers TEXT NOT NULL DEFAULT '{}';")?;
    }
    // ADD COLUMN only accepts constant defaults; timestamps are backfilled below.
    if !has("created_at") {
        conn.execute_batch("ALTER TABLE qa_api ADD COLUMN created_at TEXT;")?;
    }
    if !has("updated_at") {
        conn.execute_batch("ALTER TABLE qa_api ADD COLUMN updated_at TEXT;")?;
    }

    conn.execute_batch(
        r#"
        UPDATE qa_api SET headers = '{}' WHERE headers IS NULL OR headers = '';
        UPDATE qa_api SET created_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE created_at IS NULL;
        UPDATE qa_api SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE updated_at IS NULL;
        "#,
    )?;
    Ok(())
}
