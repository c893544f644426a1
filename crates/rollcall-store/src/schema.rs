//! Table creation and additive migrations.
//!
//! Older databases may lack the optional `users` columns; they are added in
//! place and read back as unset.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 2;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS face_encodings (
    encoding_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    encoding    BLOB NOT NULL,
    created_at  TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS attendance_records (
    record_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    timestamp   TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_face_enc_user ON face_encodings(user_id);
CREATE INDEX IF NOT EXISTS idx_att_user_time ON attendance_records(user_id, timestamp);
";

/// Optional person columns, in the order they were introduced.
/// `created_at` cannot use a non-constant default in `ALTER TABLE`, so
/// inserts set it explicitly.
const OPTIONAL_USER_COLUMNS: &[(&str, &str)] = &[
    ("email", "TEXT"),
    ("proxy", "TEXT"),
    ("salary", "REAL"),
    ("department", "TEXT"),
    ("created_at", "TIMESTAMP"),
];

/// Create missing tables and columns. Returns the names of added columns.
pub fn migrate(conn: &Connection) -> rusqlite::Result<Vec<&'static str>> {
    conn.execute_batch(CREATE_TABLES)?;

    let existing = user_columns(conn)?;
    let mut added = Vec::new();
    for (column, sql_type) in OPTIONAL_USER_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            conn.execute_batch(&format!("ALTER TABLE users ADD COLUMN {column} {sql_type};"))?;
            added.push(*column);
        }
    }
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);")?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    if added.is_empty() {
        tracing::debug!("schema up to date");
    } else {
        tracing::info!(columns = ?added, "schema migrated: added user columns");
    }
    Ok(added)
}

fn user_columns(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA table_info(users)")?;
    let names = stmt.query_map([], |row| row.get::<_, String>("name"))?;
    names.collect()
}
