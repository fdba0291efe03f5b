//! Relational mirror of applied transformers (event sourcing light).
//!
//! Every applied request gets one row in `event_sourcing_light` whose
//! autoincrement id is its ESL version. Deployments, releases, commit events and
//! the application list are mirrored alongside so the log can serve reads.

use crate::StoreError;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EslEvent {
    pub esl_version: i64,
    pub created: String,
    pub event_type: String,
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEventRow {
    pub uuid: String,
    pub timestamp: String,
    pub commit_hash: String,
    pub event_type: String,
    pub json: String,
    pub transformer_esl_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRow {
    pub environment: String,
    pub application: String,
    pub version: Option<u64>,
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRow {
    pub application: String,
    pub version: u64,
    pub metadata: String,
    pub deleted: bool,
}

fn is_busy(e: &StoreError) -> bool {
    matches!(
        e,
        StoreError::Database(rusqlite::Error::SqliteFailure(f, _))
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

/// Queries shared by the log, its transactions and their savepoints.
///
/// Writes are refused unless the implementor is writable.
pub trait EventStore {
    fn conn(&self) -> &Connection;

    fn writable(&self) -> bool;

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.writable() {
            Ok(())
        } else {
            Err(StoreError::ReadOnly)
        }
    }

    /// Append one ESL row and return its version.
    fn insert_esl(&self, created: &str, event_type: &str, json: &str) -> Result<i64, StoreError> {
        self.ensure_writable()?;
        self.conn().execute(
            "INSERT INTO event_sourcing_light (created, event_type, json) VALUES (?1, ?2, ?3)",
            params![created, event_type, json],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    fn insert_commit_event(&self, row: &CommitEventRow) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.conn().execute(
            "INSERT INTO commit_events (uuid, timestamp, commit_hash, event_type, json, transformer_esl_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.uuid,
                row.timestamp,
                row.commit_hash,
                row.event_type,
                row.json,
                row.transformer_esl_version,
            ],
        )?;
        Ok(())
    }

    fn insert_deployment(
        &self,
        created: &str,
        row: &DeploymentRow,
        esl_version: Option<i64>,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.conn().execute(
            "INSERT INTO deployments (created, envname, appname, releaseversion, metadata, transformer_esl_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                created,
                row.environment,
                row.application,
                row.version.map(|v| v as i64),
                row.metadata,
                esl_version,
            ],
        )?;
        Ok(())
    }

    fn insert_release(
        &self,
        created: &str,
        row: &ReleaseRow,
        esl_version: Option<i64>,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.conn().execute(
            "INSERT INTO releases (created, appname, releaseversion, metadata, deleted, transformer_esl_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                created,
                row.application,
                row.version as i64,
                row.metadata,
                row.deleted,
                esl_version,
            ],
        )?;
        Ok(())
    }

    fn insert_all_apps(&self, created: &str, apps: &[String]) -> Result<i64, StoreError> {
        self.ensure_writable()?;
        let json = serde_json::to_string(apps)?;
        self.conn().execute(
            "INSERT INTO all_apps (created, json) VALUES (?1, ?2)",
            params![created, json],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    fn latest_esl_version(&self) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn()
            .query_row("SELECT MAX(eslversion) FROM event_sourcing_light", [], |row| {
                row.get::<_, Option<i64>>(0)
            })?)
    }

    fn esl_events_after(&self, after: i64, limit: u32) -> Result<Vec<EslEvent>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT eslversion, created, event_type, json FROM event_sourcing_light
             WHERE eslversion > ?1 ORDER BY eslversion ASC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![after, limit], |row| {
                Ok(EslEvent {
                    esl_version: row.get(0)?,
                    created: row.get(1)?,
                    event_type: row.get(2)?,
                    json: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn deployed_version(&self, env: &str, app: &str) -> Result<Option<u64>, StoreError> {
        let version = self
            .conn()
            .query_row(
                "SELECT releaseversion FROM deployments WHERE envname = ?1 AND appname = ?2
                 ORDER BY eslversion DESC LIMIT 1",
                params![env, app],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(version.flatten().map(|v| v as u64))
    }

    /// Latest deployed version of every application in `env`.
    fn deployed_versions(&self, env: &str) -> Result<BTreeMap<String, u64>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT d.appname, d.releaseversion FROM deployments d
             WHERE d.envname = ?1 AND d.eslversion = (
                 SELECT MAX(eslversion) FROM deployments
                 WHERE envname = d.envname AND appname = d.appname)",
        )?;
        let rows = stmt
            .query_map(params![env], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(app, v)| v.map(|v| (app, v as u64)))
            .collect())
    }

    fn commit_events(&self, commit_hash: &str) -> Result<Vec<CommitEventRow>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT uuid, timestamp, commit_hash, event_type, json, transformer_esl_version
             FROM commit_events WHERE commit_hash = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![commit_hash], |row| {
                Ok(CommitEventRow {
                    uuid: row.get(0)?,
                    timestamp: row.get(1)?,
                    commit_hash: row.get(2)?,
                    event_type: row.get(3)?,
                    json: row.get(4)?,
                    transformer_esl_version: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn releases(&self, app: &str) -> Result<Vec<ReleaseRow>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT appname, releaseversion, metadata, deleted FROM releases r
             WHERE appname = ?1 AND eslversion = (
                 SELECT MAX(eslversion) FROM releases
                 WHERE appname = r.appname AND releaseversion = r.releaseversion)
             ORDER BY releaseversion ASC",
        )?;
        let rows = stmt
            .query_map(params![app], |row| {
                Ok(ReleaseRow {
                    application: row.get(0)?,
                    version: row.get::<_, i64>(1)? as u64,
                    metadata: row.get(2)?,
                    deleted: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn latest_all_apps(&self) -> Result<Option<Vec<String>>, StoreError> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT json FROM all_apps ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }
}

/// Connection to the relational event log.
///
/// Reads through the log itself run in autocommit mode; writes need an
/// [`EventTx`].
pub struct EventLog {
    conn: Connection,
    tx_retries: u32,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.conn.path())
            .field("tx_retries", &self.tx_retries)
            .finish()
    }
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>, tx_retries: u32) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("opened event log {} (journal mode {mode})", path.display());
        Self::initialize(conn, tx_retries)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?, 0)
    }

    fn initialize(conn: Connection, tx_retries: u32) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn, tx_retries })
    }

    /// Begin a transaction, retrying up to `tx_retries` times while the
    /// database is busy.
    ///
    /// Read-write transactions take the write lock up front so contention
    /// shows up here and not halfway through a batch.
    pub fn transaction(&mut self, mode: TxMode) -> Result<EventTx<'_>, StoreError> {
        let begin = match mode {
            TxMode::ReadOnly => "BEGIN DEFERRED",
            TxMode::ReadWrite => "BEGIN IMMEDIATE",
        };
        let mut attempt = 0;
        loop {
            match self.conn.execute_batch(begin) {
                Ok(()) => break,
                Err(e) => {
                    let e = StoreError::from(e);
                    if attempt >= self.tx_retries || !is_busy(&e) {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!("event log busy, retrying ({attempt}/{})", self.tx_retries);
                }
            }
        }
        Ok(EventTx {
            conn: &self.conn,
            mode,
            done: false,
            savepoints: Cell::new(0),
        })
    }

    /// Run `f` inside a transaction. Read-write transactions commit when `f`
    /// succeeds; everything else rolls back.
    pub fn with_transaction<T>(
        &mut self,
        mode: TxMode,
        f: impl FnOnce(&EventTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let tx = self.transaction(mode)?;
        let value = f(&tx)?;
        match mode {
            TxMode::ReadWrite => tx.commit()?,
            TxMode::ReadOnly => tx.rollback()?,
        }
        Ok(value)
    }
}

impl EventStore for EventLog {
    fn conn(&self) -> &Connection {
        &self.conn
    }

    fn writable(&self) -> bool {
        false
    }
}

/// An open transaction. Dropping it without committing rolls back.
pub struct EventTx<'c> {
    conn: &'c Connection,
    mode: TxMode,
    done: bool,
    savepoints: Cell<u32>,
}

impl EventTx<'_> {
    pub fn mode(&self) -> TxMode {
        self.mode
    }

    /// Open a savepoint so one request's rows can be discarded without
    /// losing the rest of the batch.
    pub fn savepoint(&self) -> Result<EventSavepoint<'_>, StoreError> {
        let n = self.savepoints.get() + 1;
        self.savepoints.set(n);
        let name = format!("request_{n}");
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(EventSavepoint {
            conn: self.conn,
            name,
            writable: self.mode == TxMode::ReadWrite,
            done: false,
        })
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.done = true;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.done = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl EventStore for EventTx<'_> {
    fn conn(&self) -> &Connection {
        self.conn
    }

    fn writable(&self) -> bool {
        self.mode == TxMode::ReadWrite
    }
}

impl Drop for EventTx<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("failed to roll back event log transaction: {e}");
            }
        }
    }
}

/// A savepoint inside an [`EventTx`]. Dropping it without releasing rolls the
/// savepoint back.
pub struct EventSavepoint<'t> {
    conn: &'t Connection,
    name: String,
    writable: bool,
    done: bool,
}

impl EventSavepoint<'_> {
    pub fn release(mut self) -> Result<(), StoreError> {
        self.done = true;
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.done = true;
        self.conn
            .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name))?;
        Ok(())
    }
}

impl EventStore for EventSavepoint<'_> {
    fn conn(&self) -> &Connection {
        self.conn
    }

    fn writable(&self) -> bool {
        self.writable
    }
}

impl Drop for EventSavepoint<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self
                .conn
                .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name))
            {
                warn!("failed to roll back savepoint {}: {e}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: &str = "2026-01-01T00:00:00Z";

    fn deployment(env: &str, app: &str, version: Option<u64>) -> DeploymentRow {
        DeploymentRow {
            environment: env.to_owned(),
            application: app.to_owned(),
            version,
            metadata: "{}".to_owned(),
        }
    }

    #[test]
    fn esl_versions_are_monotonic() {
        let mut log = EventLog::in_memory().unwrap();
        let tx = log.transaction(TxMode::ReadWrite).unwrap();
        let a = tx.insert_esl(NOW, "CreateEnvironment", "{}").unwrap();
        let b = tx.insert_esl(NOW, "CreateApplicationVersion", "{}").unwrap();
        tx.commit().unwrap();
        assert!(b > a);
        assert_eq!(log.latest_esl_version().unwrap(), Some(b));

        let after = log.esl_events_after(a, 10).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].event_type, "CreateApplicationVersion");
    }

    #[test]
    fn empty_log_has_no_version() {
        let log = EventLog::in_memory().unwrap();
        assert_eq!(log.latest_esl_version().unwrap(), None);
        assert_eq!(log.latest_all_apps().unwrap(), None);
        assert_eq!(log.deployed_version("dev", "app").unwrap(), None);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let mut log = EventLog::in_memory().unwrap();
        {
            let tx = log.transaction(TxMode::ReadWrite).unwrap();
            tx.insert_esl(NOW, "CreateEnvironment", "{}").unwrap();
        }
        assert_eq!(log.latest_esl_version().unwrap(), None);
    }

    #[test]
    fn read_only_transaction_refuses_writes() {
        let mut log = EventLog::in_memory().unwrap();
        let tx = log.transaction(TxMode::ReadOnly).unwrap();
        assert!(matches!(
            tx.insert_esl(NOW, "x", "{}"),
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(
            tx.insert_all_apps(NOW, &[]),
            Err(StoreError::ReadOnly)
        ));
        drop(tx);
        assert!(matches!(
            log.insert_esl(NOW, "x", "{}"),
            Err(StoreError::ReadOnly)
        ));
    }

    #[test]
    fn savepoint_rollback_keeps_earlier_rows() {
        let mut log = EventLog::in_memory().unwrap();
        let tx = log.transaction(TxMode::ReadWrite).unwrap();

        let sp = tx.savepoint().unwrap();
        sp.insert_deployment(NOW, &deployment("dev", "app", Some(1)), None)
            .unwrap();
        sp.release().unwrap();

        let sp = tx.savepoint().unwrap();
        sp.insert_deployment(NOW, &deployment("dev", "app", Some(2)), None)
            .unwrap();
        sp.rollback().unwrap();

        tx.commit().unwrap();
        assert_eq!(log.deployed_version("dev", "app").unwrap(), Some(1));
    }

    #[test]
    fn latest_deployment_wins() {
        let mut log = EventLog::in_memory().unwrap();
        log.with_transaction(TxMode::ReadWrite, |tx| {
            tx.insert_deployment(NOW, &deployment("dev", "a", Some(1)), Some(1))?;
            tx.insert_deployment(NOW, &deployment("dev", "b", Some(4)), Some(1))?;
            tx.insert_deployment(NOW, &deployment("dev", "a", Some(3)), Some(2))?;
            tx.insert_deployment(NOW, &deployment("dev", "b", None), Some(3))?;
            tx.insert_deployment(NOW, &deployment("prod", "a", Some(1)), Some(3))
        })
        .unwrap();

        assert_eq!(log.deployed_version("dev", "a").unwrap(), Some(3));
        assert_eq!(log.deployed_version("dev", "b").unwrap(), None);
        let dev = log.deployed_versions("dev").unwrap();
        assert_eq!(dev.len(), 1);
        assert_eq!(dev.get("a"), Some(&3));
    }

    #[test]
    fn releases_report_latest_row_per_version() {
        let mut log = EventLog::in_memory().unwrap();
        let release = |version, deleted| ReleaseRow {
            application: "app".to_owned(),
            version,
            metadata: "{}".to_owned(),
            deleted,
        };
        log.with_transaction(TxMode::ReadWrite, |tx| {
            tx.insert_release(NOW, &release(1, false), None)?;
            tx.insert_release(NOW, &release(2, false), None)?;
            tx.insert_release(NOW, &release(1, true), None)
        })
        .unwrap();

        let rows = log.releases("app").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].deleted);
        assert!(!rows[1].deleted);
    }

    #[test]
    fn commit_events_by_hash() {
        let mut log = EventLog::in_memory().unwrap();
        let hash = "a".repeat(40);
        log.with_transaction(TxMode::ReadWrite, |tx| {
            for (i, kind) in ["new-release", "deployment"].iter().enumerate() {
                tx.insert_commit_event(&CommitEventRow {
                    uuid: format!("uuid-{i}"),
                    timestamp: NOW.to_owned(),
                    commit_hash: hash.clone(),
                    event_type: (*kind).to_owned(),
                    json: "{}".to_owned(),
                    transformer_esl_version: Some(1),
                })?;
            }
            Ok(())
        })
        .unwrap();

        let rows = log.commit_events(&hash).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].event_type, "new-release");
        assert!(log.commit_events(&"b".repeat(40)).unwrap().is_empty());
    }

    #[test]
    fn all_apps_snapshot() {
        let mut log = EventLog::in_memory().unwrap();
        log.with_transaction(TxMode::ReadWrite, |tx| {
            tx.insert_all_apps(NOW, &["a".to_owned()])?;
            tx.insert_all_apps(NOW, &["a".to_owned(), "b".to_owned()])
        })
        .unwrap();
        assert_eq!(
            log.latest_all_apps().unwrap(),
            Some(vec!["a".to_owned(), "b".to_owned()])
        );
    }

    #[test]
    fn file_backed_log_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sqlite");
        {
            let mut log = EventLog::open(&path, 3).unwrap();
            log.with_transaction(TxMode::ReadWrite, |tx| {
                tx.insert_esl(NOW, "CreateEnvironment", "{}")
            })
            .unwrap();
        }
        let log = EventLog::open(&path, 3).unwrap();
        assert_eq!(log.latest_esl_version().unwrap(), Some(1));
    }
}
