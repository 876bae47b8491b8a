use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use site_notice_core::{MarkerStore, NoticeError};
use time::OffsetDateTime;

/// File name of the durable marker database inside a state directory.
pub const DURABLE_DB_FILE: &str = "durable.sqlite3";

/// File name of the session-scoped marker database inside a state
/// directory. Cleared when a new session begins; the durable file never is.
pub const SESSION_DB_FILE: &str = "session.sqlite3";

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS markers (
  key TEXT PRIMARY KEY,
  marked_at TEXT NOT NULL
);
";

/// File-backed presence store. The two dismissal scopes are two instances
/// of this one type on independently-lifecycled database files.
pub struct SqliteMarkerStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteMarkerStore {
    /// Open a SQLite-backed marker store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Remove every marker. Session-end primitive for the ephemeral file;
    /// never called on the durable file by this subsystem.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM markers", []).context("failed to clear markers")?;
        Ok(())
    }

    /// Number of markers currently present.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn len(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM markers", [], |row| row.get::<_, i64>(0))
            .context("failed to count markers")?;
        usize::try_from(count).context("marker count out of range")
    }

    /// True when no markers are present.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All marker keys in lexicographic order, for diagnostics.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM markers ORDER BY key ASC")
            .context("failed to prepare marker listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

impl MarkerStore for SqliteMarkerStore {
    fn contains(&self, key: &str) -> Result<bool, NoticeError> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM markers WHERE key = ?1)",
                params![key],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|err| NoticeError::Storage(format!("marker read failed: {err}")))?;
        Ok(exists == 1)
    }

    fn put(&mut self, key: &str) -> Result<(), NoticeError> {
        let marked_at = now_rfc3339()
            .map_err(|err| NoticeError::Storage(format!("marker timestamp failed: {err}")))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO markers(key, marked_at) VALUES (?1, ?2)",
                params![key, marked_at],
            )
            .map_err(|err| NoticeError::Storage(format!("marker write failed: {err}")))?;
        Ok(())
    }
}

/// Open and migrate the durable marker store inside a state directory.
///
/// # Errors
/// Returns an error when the directory cannot be created or the database
/// cannot be opened or migrated.
pub fn open_durable(state_dir: &Path) -> Result<SqliteMarkerStore> {
    open_in_dir(state_dir, DURABLE_DB_FILE)
}

/// Open and migrate the session-scoped marker store inside a state
/// directory.
///
/// # Errors
/// Returns an error when the directory cannot be created or the database
/// cannot be opened or migrated.
pub fn open_session(state_dir: &Path) -> Result<SqliteMarkerStore> {
    open_in_dir(state_dir, SESSION_DB_FILE)
}

fn open_in_dir(state_dir: &Path, file_name: &str) -> Result<SqliteMarkerStore> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state directory {}", state_dir.display()))?;
    let mut store = SqliteMarkerStore::open(&state_dir.join(file_name))?;
    store.migrate()?;
    Ok(store)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use site_notice_core::{dismissal_key, DismissalLedger, DismissalScope, MessageId};

    use super::*;

    fn open_memory_store() -> SqliteMarkerStore {
        match SqliteMarkerStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("in-memory store should open: {err}"),
        }
    }

    fn unique_temp_dir(prefix: &str) -> std::path::PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
        fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
        dir
    }

    #[test]
    fn migrate_reaches_latest_version_and_is_idempotent() {
        let mut store = open_memory_store();

        let before = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should be readable: {err}"),
        };
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }
        if let Err(err) = store.migrate() {
            panic!("repeated migration should be a no-op: {err}");
        }

        let after = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should be readable: {err}"),
        };
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
    }

    #[test]
    fn put_is_idempotent_and_visible_to_contains() {
        let mut store = open_memory_store();
        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }

        let key = dismissal_key(&MessageId::from("x"));
        if let Err(err) = store.put(&key) {
            panic!("first marker write should succeed: {err}");
        }
        if let Err(err) = store.put(&key) {
            panic!("second marker write should be a no-op, not an error: {err}");
        }

        assert_eq!(store.contains(&key), Ok(true));
        assert_eq!(store.len().ok(), Some(1));
        assert_eq!(store.list_keys().ok(), Some(vec![key]));
    }

    #[test]
    fn clear_empties_the_store() {
        let mut store = open_memory_store();
        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }
        if let Err(err) = store.put("siteNoticeKey-a") {
            panic!("marker write should succeed: {err}");
        }

        if let Err(err) = store.clear() {
            panic!("clear should succeed: {err}");
        }
        assert_eq!(store.contains("siteNoticeKey-a"), Ok(false));
        assert_eq!(store.len().ok(), Some(0));
    }

    #[test]
    fn durable_markers_survive_reopen_and_session_markers_do_not_survive_clear() {
        let state_dir = unique_temp_dir("site-notice-store");
        let id = MessageId::from("x");

        {
            let mut durable = match open_durable(&state_dir) {
                Ok(store) => store,
                Err(err) => panic!("durable store should open: {err}"),
            };
            if let Err(err) = durable.put(&dismissal_key(&id)) {
                panic!("durable marker write should succeed: {err}");
            }
        }

        let mut session = match open_session(&state_dir) {
            Ok(store) => store,
            Err(err) => panic!("session store should open: {err}"),
        };
        if let Err(err) = session.put(&dismissal_key(&id)) {
            panic!("session marker write should succeed: {err}");
        }
        if let Err(err) = session.clear() {
            panic!("session clear should succeed: {err}");
        }

        let durable = match open_durable(&state_dir) {
            Ok(store) => store,
            Err(err) => panic!("durable store should reopen: {err}"),
        };
        let ledger = DismissalLedger::new(durable, session);
        assert!(ledger.has_been_acted_on(DismissalScope::Durable, &id));
        assert!(!ledger.has_been_acted_on(DismissalScope::Session, &id));
    }

    #[test]
    fn unmigrated_store_reads_degrade_to_not_dismissed_through_the_ledger() {
        // No migrate(): the markers table does not exist, so reads error at
        // the store level and the ledger falls back to "no record found".
        let store = open_memory_store();
        let key = dismissal_key(&MessageId::from("x"));
        assert!(store.contains(&key).is_err());

        let ledger = DismissalLedger::new(store, open_memory_store());
        assert!(!ledger.has_been_acted_on(DismissalScope::Durable, &MessageId::from("x")));
    }
}
