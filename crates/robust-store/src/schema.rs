/// SQL DDL for the message cache.
/// WAL mode + busy timeout applied at connection time.
pub const SCHEMA_VERSION: u32 = 2;

/// Baseline (version 1) schema: the keyed messages collection plus the
/// timestamp index.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    ts INTEGER NOT NULL,
    target TEXT NOT NULL,
    sender TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

pub struct Migration {
    pub version: u32,
    pub sql: &'static str,
}

/// Index-only migrations. Each statement is idempotent, so replaying a
/// migration against an already-upgraded database is harmless and no
/// existing rows are ever touched.
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 2,
    sql: r#"
CREATE INDEX IF NOT EXISTS idx_messages_target ON messages(target);
CREATE INDEX IF NOT EXISTS idx_messages_ts_target ON messages(ts, target);
"#,
}];
