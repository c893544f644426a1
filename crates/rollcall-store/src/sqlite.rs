//! SQLite-backed store.
//!
//! One writer connection sits behind a gate with a bounded wait. Every read
//! opens its own read-only connection; with WAL journaling a read never
//! blocks on a writer and always sees a committed snapshot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};

use rollcall_core::{
    AttendanceLedger, EventId, KnownFace, PersonId, StoreError, Template, TemplateId,
    TemplateSource,
};

use crate::model::{AttendanceRecord, AttendanceSummary, DateFilter, NewPerson, Person, PersonPatch};
use crate::schema;

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Longest a write waits for the writer gate before reporting `Busy`.
    pub write_timeout: Duration,
    /// SQLite's own busy handler timeout, per connection.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(2000),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

pub struct SqliteStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    config: StoreConfig,
}

const PERSON_COLUMNS: &str = "user_id, name, email, proxy, salary, department, created_at";

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(map_err)?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %mode, "database did not switch to WAL journaling");
        }
        conn.busy_timeout(config.busy_timeout).map_err(map_err)?;
        conn.pragma_update(None, "foreign_keys", true).map_err(map_err)?;
        schema::migrate(&conn).map_err(map_err)?;

        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(Self {
            path,
            writer: Mutex::new(conn),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.writer
            .try_lock_for(self.config.write_timeout)
            .ok_or(StoreError::Busy)
    }

    fn read_conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.path.display())))?;
        conn.busy_timeout(self.config.busy_timeout).map_err(map_err)?;
        Ok(conn)
    }

    // ── People ───────────────────────────────────────────────────────────

    pub fn create_person(&self, person: &NewPerson) -> Result<PersonId, StoreError> {
        let conn = self.write_conn()?;
        insert_person(&conn, person)
    }

    pub fn get_person(&self, id: PersonId) -> Result<Option<Person>, StoreError> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!("SELECT {PERSON_COLUMNS} FROM users WHERE user_id = ?1"),
            params![id],
            person_from_row,
        )
        .optional()
        .map_err(map_err)
    }

    pub fn list_people(&self) -> Result<Vec<Person>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {PERSON_COLUMNS} FROM users ORDER BY user_id"))
            .map_err(map_err)?;
        let rows = stmt.query_map([], person_from_row).map_err(map_err)?;
        rows.collect::<Result<_, _>>().map_err(map_err)
    }

    /// Apply `patch`. Returns `false` when no such person exists.
    pub fn update_person(&self, id: PersonId, patch: &PersonPatch) -> Result<bool, StoreError> {
        let conn = self.write_conn()?;
        let changed = conn
            .execute(
                "UPDATE users SET
                    name       = COALESCE(?2, name),
                    email      = COALESCE(?3, email),
                    proxy      = COALESCE(?4, proxy),
                    salary     = COALESCE(?5, salary),
                    department = COALESCE(?6, department)
                 WHERE user_id = ?1",
                params![id, patch.name, patch.email, patch.proxy, patch.salary, patch.department],
            )
            .map_err(map_err)?;
        Ok(changed > 0)
    }

    /// Delete a person with their templates and attendance history.
    pub fn delete_person(&self, id: PersonId) -> Result<bool, StoreError> {
        let conn = self.write_conn()?;
        let removed = conn
            .execute("DELETE FROM users WHERE user_id = ?1", params![id])
            .map_err(map_err)?;
        if removed > 0 {
            tracing::info!(person_id = id, "person deleted");
        }
        Ok(removed > 0)
    }

    // ── Templates ────────────────────────────────────────────────────────

    pub fn add_template(&self, person: PersonId, template: &Template) -> Result<TemplateId, StoreError> {
        let conn = self.write_conn()?;
        if !person_exists(&conn, person)? {
            return Err(StoreError::PersonNotFound(person));
        }
        insert_template(&conn, person, template)
    }

    /// Create a person and their first template atomically.
    pub fn enroll(&self, person: &NewPerson, template: &Template) -> Result<(PersonId, TemplateId), StoreError> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction().map_err(map_err)?;
        let person_id = insert_person(&tx, person)?;
        let template_id = insert_template(&tx, person_id, template)?;
        tx.commit().map_err(map_err)?;
        tracing::info!(person_id, template_id, name = %person.name, "person enrolled");
        Ok((person_id, template_id))
    }

    /// Replace every template of `person` with `template`.
    pub fn replace_templates(&self, person: PersonId, template: &Template) -> Result<TemplateId, StoreError> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction().map_err(map_err)?;
        if !person_exists(&tx, person)? {
            return Err(StoreError::PersonNotFound(person));
        }
        tx.execute("DELETE FROM face_encodings WHERE user_id = ?1", params![person])
            .map_err(map_err)?;
        let template_id = insert_template(&tx, person, template)?;
        tx.commit().map_err(map_err)?;
        tracing::info!(person_id = person, template_id, "templates replaced");
        Ok(template_id)
    }

    /// Every decodable template with its owner, in store order.
    pub fn list_all_templates(&self) -> Result<Vec<KnownFace>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT f.encoding_id, f.user_id, u.name, f.encoding
                 FROM face_encodings f JOIN users u ON u.user_id = f.user_id
                 ORDER BY f.encoding_id",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, TemplateId>(0)?,
                    row.get::<_, PersonId>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(map_err)?;

        let mut faces = Vec::new();
        for row in rows {
            let (template_id, person_id, name, blob) = row.map_err(map_err)?;
            match Template::from_bytes(&blob) {
                Ok(template) => faces.push(KnownFace { template_id, person_id, name, template }),
                Err(e) => {
                    let err = StoreError::CorruptTemplate { template_id, reason: e.to_string() };
                    tracing::warn!(person_id, error = %err, "skipping stored template");
                }
            }
        }
        Ok(faces)
    }

    // ── Attendance ───────────────────────────────────────────────────────

    pub fn record_attendance(&self, person: PersonId, at: NaiveDateTime) -> Result<EventId, StoreError> {
        let conn = self.write_conn()?;
        let inserted = conn.execute(
            "INSERT INTO attendance_records (user_id, timestamp) VALUES (?1, ?2)",
            params![person, at],
        );
        match inserted {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::PersonNotFound(person))
            }
            Err(e) => Err(map_err(e)),
        }
    }

    pub fn attendance_on_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.attendance(DateFilter::On(date))
    }

    /// Events between `from` and `to` inclusive, newest first.
    pub fn attendance_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.attendance(DateFilter::Between(from, to))
    }

    pub fn attendance(&self, filter: DateFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let (from, to) = match filter {
            DateFilter::On(d) => (d, d),
            DateFilter::Between(a, b) if a <= b => (a, b),
            DateFilter::Between(a, b) => (b, a),
        };
        let conn = self.read_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT a.record_id, a.user_id, u.name, a.timestamp
                 FROM attendance_records a JOIN users u ON u.user_id = a.user_id
                 WHERE date(a.timestamp) BETWEEN ?1 AND ?2
                 ORDER BY a.timestamp DESC, a.record_id DESC",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![from, to], |row| {
                Ok(AttendanceRecord {
                    event_id: row.get(0)?,
                    person_id: row.get(1)?,
                    name: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })
            .map_err(map_err)?;
        rows.collect::<Result<_, _>>().map_err(map_err)
    }

    /// Event count per person, over all time or a single day. People with no
    /// events are listed with a zero count.
    pub fn attendance_summary(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceSummary>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT u.user_id, u.name, COUNT(a.record_id)
                 FROM users u
                 LEFT JOIN attendance_records a
                   ON a.user_id = u.user_id AND (?1 IS NULL OR date(a.timestamp) = ?1)
                 GROUP BY u.user_id, u.name
                 ORDER BY u.user_id",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![date], |row| {
                Ok(AttendanceSummary {
                    person_id: row.get(0)?,
                    name: row.get(1)?,
                    count: row.get(2)?,
                })
            })
            .map_err(map_err)?;
        rows.collect::<Result<_, _>>().map_err(map_err)
    }

    /// People with no attendance event on `date`.
    pub fn absentees_on(&self, date: NaiveDate) -> Result<Vec<Person>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PERSON_COLUMNS} FROM users u
                 WHERE NOT EXISTS (
                   SELECT 1 FROM attendance_records a
                   WHERE a.user_id = u.user_id AND date(a.timestamp) = ?1
                 )
                 ORDER BY u.user_id"
            ))
            .map_err(map_err)?;
        let rows = stmt.query_map(params![date], person_from_row).map_err(map_err)?;
        rows.collect::<Result<_, _>>().map_err(map_err)
    }
}

impl TemplateSource for SqliteStore {
    fn load_known_faces(&self) -> Result<Vec<KnownFace>, StoreError> {
        self.list_all_templates()
    }
}

impl AttendanceLedger for SqliteStore {
    fn record_attendance(&self, person: PersonId, at: NaiveDateTime) -> Result<EventId, StoreError> {
        SqliteStore::record_attendance(self, person, at)
    }
}

fn insert_person(conn: &Connection, person: &NewPerson) -> Result<PersonId, StoreError> {
    conn.execute(
        "INSERT INTO users (name, email, proxy, salary, department, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            person.name,
            person.email,
            person.proxy,
            person.salary,
            person.department,
            Local::now().naive_local(),
        ],
    )
    .map_err(map_err)?;
    Ok(conn.last_insert_rowid())
}

fn insert_template(conn: &Connection, person: PersonId, template: &Template) -> Result<TemplateId, StoreError> {
    conn.execute(
        "INSERT INTO face_encodings (user_id, encoding) VALUES (?1, ?2)",
        params![person, template.to_bytes()],
    )
    .map_err(map_err)?;
    Ok(conn.last_insert_rowid())
}

fn person_exists(conn: &Connection, person: PersonId) -> Result<bool, StoreError> {
    conn.prepare_cached("SELECT 1 FROM users WHERE user_id = ?1")
        .and_then(|mut stmt| stmt.exists(params![person]))
        .map_err(map_err)
}

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        proxy: row.get(3)?,
        salary: salary_from(row.get(4)?),
        department: row.get(5)?,
        // Legacy rows may hold NULL or a timestamp in an unexpected format.
        created_at: row.get::<_, Option<NaiveDateTime>>(6).ok().flatten(),
    })
}

/// Older databases stored the raw form field, so `salary` may hold text.
fn salary_from(value: Value) -> Option<f64> {
    match value {
        Value::Real(v) => Some(v),
        Value::Integer(v) => Some(v as f64),
        Value::Text(v) => v.trim().parse().ok(),
        Value::Null | Value::Blob(_) => None,
    }
}

fn map_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Busy,
            ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        },
        _ => StoreError::Database(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("attendance.db"), StoreConfig::default()).unwrap();
        (dir, store)
    }

    fn template(seed: f32) -> Template {
        Template::new(vec![seed, seed + 1.0, seed + 2.0, seed + 3.0])
    }

    fn at(date: NaiveDate, h: u32) -> NaiveDateTime {
        date.and_time(NaiveTime::from_hms_opt(h, 0, 0).unwrap())
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_enroll_and_list_templates() {
        let (_dir, store) = open_temp();
        let (alice, _) = store.enroll(&NewPerson::named("alice"), &template(0.0)).unwrap();
        let bob = store.create_person(&NewPerson::named("bob")).unwrap();
        store.add_template(bob, &template(5.0)).unwrap();

        let faces = store.list_all_templates().unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].person_id, alice);
        assert_eq!(faces[0].name, "alice");
        assert_eq!(faces[0].template, template(0.0));
        assert_eq!(faces[1].person_id, bob);
    }

    #[test]
    fn test_add_template_for_missing_person() {
        let (_dir, store) = open_temp();
        assert_eq!(store.add_template(42, &template(0.0)), Err(StoreError::PersonNotFound(42)));
    }

    #[test]
    fn test_corrupt_template_is_skipped() {
        let (_dir, store) = open_temp();
        let (alice, _) = store.enroll(&NewPerson::named("alice"), &template(0.0)).unwrap();
        store
            .writer
            .lock()
            .execute(
                "INSERT INTO face_encodings (user_id, encoding) VALUES (?1, ?2)",
                params![alice, vec![1u8, 2, 3]],
            )
            .unwrap();

        let faces = store.list_all_templates().unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].template, template(0.0));
    }

    #[test]
    fn test_replace_templates_drops_old_ones() {
        let (_dir, store) = open_temp();
        let (alice, _) = store.enroll(&NewPerson::named("alice"), &template(0.0)).unwrap();
        store.add_template(alice, &template(1.0)).unwrap();
        store.replace_templates(alice, &template(9.0)).unwrap();

        let faces = store.list_all_templates().unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].template, template(9.0));
        assert_eq!(store.replace_templates(99, &template(0.0)), Err(StoreError::PersonNotFound(99)));
    }

    #[test]
    fn test_update_person_patches_only_given_fields() {
        let (_dir, store) = open_temp();
        let id = store
            .create_person(&NewPerson {
                name: "carol".into(),
                email: Some("c@example.com".into()),
                ..NewPerson::default()
            })
            .unwrap();
        let patch = PersonPatch { department: Some("ops".into()), ..PersonPatch::default() };
        assert!(store.update_person(id, &patch).unwrap());
        assert!(!store.update_person(id + 1, &patch).unwrap());

        let carol = store.get_person(id).unwrap().unwrap();
        assert_eq!(carol.email.as_deref(), Some("c@example.com"));
        assert_eq!(carol.department.as_deref(), Some("ops"));
        assert!(carol.created_at.is_some());
    }

    #[test]
    fn test_delete_person_cascades() {
        let (_dir, store) = open_temp();
        let (alice, _) = store.enroll(&NewPerson::named("alice"), &template(0.0)).unwrap();
        store.record_attendance(alice, at(day(1), 9)).unwrap();

        assert!(store.delete_person(alice).unwrap());
        assert!(!store.delete_person(alice).unwrap());
        assert!(store.list_all_templates().unwrap().is_empty());
        assert!(store.attendance_on_date(day(1)).unwrap().is_empty());
        assert!(store.get_person(alice).unwrap().is_none());
    }

    #[test]
    fn test_attendance_queries() {
        let (_dir, store) = open_temp();
        let alice = store.create_person(&NewPerson::named("alice")).unwrap();
        let bob = store.create_person(&NewPerson::named("bob")).unwrap();
        store.record_attendance(alice, at(day(1), 9)).unwrap();
        store.record_attendance(bob, at(day(1), 10)).unwrap();
        store.record_attendance(alice, at(day(2), 9)).unwrap();

        let first = store.attendance_on_date(day(1)).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "bob");
        assert_eq!(first[0].timestamp, at(day(1), 10));

        let range = store.attendance_between(day(1), day(2)).unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].timestamp, at(day(2), 9));
        assert_eq!(store.attendance_between(day(2), day(1)).unwrap().len(), 3);

        let summary = store.attendance_summary(None).unwrap();
        assert_eq!(summary.iter().find(|s| s.person_id == alice).unwrap().count, 2);
        let on_two = store.attendance_summary(Some(day(2))).unwrap();
        assert_eq!(on_two.iter().find(|s| s.person_id == bob).unwrap().count, 0);

        let absent = store.absentees_on(day(2)).unwrap();
        assert_eq!(absent.len(), 1);
        assert_eq!(absent[0].id, bob);
    }

    #[test]
    fn test_attendance_for_unknown_person() {
        let (_dir, store) = open_temp();
        assert_eq!(
            store.record_attendance(7, at(day(1), 9)),
            Err(StoreError::PersonNotFound(7))
        );
    }

    #[test]
    fn test_write_gate_times_out_as_busy() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            write_timeout: Duration::from_millis(20),
            ..StoreConfig::default()
        };
        let store = SqliteStore::open(dir.path().join("a.db"), config).unwrap();
        let _held = store.writer.lock();
        assert_eq!(store.create_person(&NewPerson::named("x")), Err(StoreError::Busy));
    }

    #[test]
    fn test_read_sees_committed_data_while_writer_held() {
        let (_dir, store) = open_temp();
        store.create_person(&NewPerson::named("alice")).unwrap();
        let _held = store.writer.lock();
        assert_eq!(store.list_people().unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_legacy_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE users (user_id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, salary TEXT);
                 INSERT INTO users (name, salary) VALUES ('old-timer', NULL);
                 INSERT INTO users (name, salary) VALUES ('blank-pay', '');
                 INSERT INTO users (name, salary) VALUES ('text-pay', '4200.5');",
            )
            .unwrap();
        }
        let store = SqliteStore::open(&path, StoreConfig::default()).unwrap();
        let people = store.list_people().unwrap();
        assert_eq!(people.len(), 3);
        assert_eq!(people[0].name, "old-timer");
        assert_eq!(people[0].salary, None);
        assert_eq!(people[0].created_at, None);
        assert_eq!(people[1].salary, None);
        assert_eq!(people[2].salary, Some(4200.5));

        let blank = store.get_person(people[1].id).unwrap().unwrap();
        assert_eq!(blank.name, "blank-pay");
        assert_eq!(store.absentees_on(day(4)).unwrap().len(), 3);
    }

    #[test]
    fn test_unopenable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let err = SqliteStore::open(blocker.join("a.db"), StoreConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
