use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::schema;

/// Thread-safe SQLite connection wrapper.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Send).
/// Opened once and shared; every logical operation opens its own
/// transaction scope through [`Database::with_tx`].
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at the given path, migrating the schema
    /// forward if the persisted version is older than [`schema::SCHEMA_VERSION`].
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        initialize(&conn)?;

        info!(path = %path.display(), "message store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        initialize(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure inside one transaction: commit on Ok, roll back
    /// on Err with no partially-visible state.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Database(format!("begin: {e}")))?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| StoreError::Database(format!("commit: {e}")))?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls back; do it explicitly so
                // the failure path reads clearly.
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            path: self.path.clone(),
        }
    }
}

fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(schema::PRAGMAS)
        .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;

    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    match version {
        None => {
            apply_migrations(conn, 1)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }
        Some(v) if v < schema::SCHEMA_VERSION => {
            apply_migrations(conn, v)?;
            conn.execute(
                "UPDATE schema_version SET version = ?1",
                [schema::SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
            info!(from = v, to = schema::SCHEMA_VERSION, "schema migrated");
        }
        Some(v) if v > schema::SCHEMA_VERSION => {
            warn!(
                persisted = v,
                supported = schema::SCHEMA_VERSION,
                "database is newer than this client"
            );
        }
        Some(_) => {}
    }

    Ok(())
}

fn apply_migrations(conn: &Connection, from: u32) -> Result<(), StoreError> {
    for migration in schema::MIGRATIONS {
        if migration.version > from {
            conn.execute_batch(migration.sql)
                .map_err(|e| StoreError::Database(format!("migration v{}: {e}", migration.version)))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
    }

    #[test]
    fn schema_version_set() {
        let db = Database::in_memory().unwrap();
        let version: u32 = db
            .with_conn(|conn| {
                conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
                    .map_err(|e| StoreError::Database(e.to_string()))
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn all_indexes_created_on_fresh_open() {
        let db = Database::in_memory().unwrap();
        let indexes = index_names(&db);
        assert!(indexes.contains(&"idx_messages_ts".to_string()));
        assert!(indexes.contains(&"idx_messages_target".to_string()));
        assert!(indexes.contains(&"idx_messages_ts_target".to_string()));
    }

    #[test]
    fn v1_database_migrates_without_touching_rows() {
        let dir =
            std::env::temp_dir().join(format!("robust-store-test-{}", uuid::Uuid::now_v7()));
        let path = dir.join("migrate.db");
        std::fs::create_dir_all(&dir).unwrap();

        // Build a version-1 database by hand: table + ts index only.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(schema::CREATE_TABLES).unwrap();
            conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])
                .unwrap();
            conn.execute(
                "INSERT INTO messages (id, body, ts, target, sender) VALUES ('m1', 'old', 7, '#general', '{}')",
                [],
            )
            .unwrap();
        }

        let db = Database::open(&path).unwrap();

        let version: u32 = db
            .with_conn(|conn| {
                conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
                    .map_err(|e| StoreError::Database(e.to_string()))
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);

        let indexes = index_names(&db);
        assert!(indexes.contains(&"idx_messages_target".to_string()));
        assert!(indexes.contains(&"idx_messages_ts_target".to_string()));

        // Existing rows survive untouched.
        let body: String = db
            .with_conn(|conn| {
                conn.query_row("SELECT body FROM messages WHERE id = 'm1'", [], |row| {
                    row.get(0)
                })
                .map_err(|e| StoreError::Database(e.to_string()))
            })
            .unwrap();
        assert_eq!(body, "old");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reopen_at_current_version_is_idempotent() {
        let dir =
            std::env::temp_dir().join(format!("robust-store-test-{}", uuid::Uuid::now_v7()));
        let path = dir.join("reopen.db");
        let db = Database::open(&path).unwrap();
        drop(db);
        let db2 = Database::open(&path).unwrap();
        let indexes = index_names(&db2);
        assert!(indexes.contains(&"idx_messages_ts_target".to_string()));
        drop(db2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        let result: Result<(), StoreError> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO messages (id, body, ts, target, sender) VALUES ('m1', 'x', 1, '#a', '{}')",
                [],
            )?;
            Err(StoreError::Database("injected".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
                    .map_err(|e| StoreError::Database(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    fn index_names(db: &Database) -> Vec<String> {
        db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='index' ORDER BY name")
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let names = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| StoreError::Database(e.to_string()))?
                .collect::<Result<Vec<String>, _>>()
                .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(names)
        })
        .unwrap()
    }
}
