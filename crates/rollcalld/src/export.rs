//! Absentee CSV export.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;

use rollcall_core::StoreError;
use rollcall_store::SqliteStore;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Write `absentees_<date>.csv` into `dir` and return its path.
///
/// Each export writes its own temp file beside the final name and persists
/// it over that name, so readers never see a partial file and concurrent
/// exports never share a temp path.
pub fn write_absentees(store: &SqliteStore, dir: &Path, date: NaiveDate) -> Result<PathBuf, ExportError> {
    let absentees = store.absentees_on(date)?;
    std::fs::create_dir_all(dir)?;

    let path = dir.join(format!("absentees_{date}.csv"));
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".absentees_{date}."))
        .suffix(".csv.tmp")
        .tempfile_in(dir)?;
    {
        let mut out = std::io::BufWriter::new(&mut tmp);
        writeln!(out, "date,user_id,name,reason")?;
        for person in &absentees {
            writeln!(out, "{date},{},{},Absent", person.id, csv_field(&person.name))?;
        }
        out.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;

    tracing::info!(path = %path.display(), absentees = absentees.len(), "absentee list exported");
    Ok(path)
}

fn csv_field(value: &str) -> String {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use rollcall_store::{NewPerson, StoreConfig};

    #[test]
    fn test_export_lists_only_absentees() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("a.db"), StoreConfig::default()).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let present = store.create_person(&NewPerson::named("present")).unwrap();
        store.create_person(&NewPerson::named("Doe, Jane")).unwrap();
        store
            .record_attendance(present, date.and_time(NaiveTime::from_hms_opt(9, 0, 0).unwrap()))
            .unwrap();

        let out_dir = dir.path().join("exports");
        let path = write_absentees(&store, &out_dir, date).unwrap();
        assert_eq!(path, out_dir.join("absentees_2024-05-06.csv"));

        let csv = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "date,user_id,name,reason");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(",\"Doe, Jane\",Absent"));
        let leftovers = std::fs::read_dir(&out_dir).unwrap().count();
        assert_eq!(leftovers, 1, "temp files must not be left behind");
    }

    #[test]
    fn test_concurrent_exports_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            SqliteStore::open(dir.path().join("a.db"), StoreConfig::default()).unwrap(),
        );
        for i in 0..100 {
            store.create_person(&NewPerson::named(format!("person-{i}"))).unwrap();
        }
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let out_dir = dir.path().join("exports");

        for _ in 0..5 {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = std::sync::Arc::clone(&store);
                    let out_dir = out_dir.clone();
                    std::thread::spawn(move || write_absentees(&store, &out_dir, date))
                })
                .collect();
            for h in handles {
                let path = h.join().unwrap().unwrap();
                assert!(path.exists());
            }
        }

        let csv = std::fs::read_to_string(out_dir.join("absentees_2024-05-06.csv")).unwrap();
        assert_eq!(csv.lines().count(), 101);
        assert!(csv.lines().skip(1).all(|l| l.starts_with("2024-05-06,") && l.ends_with(",Absent")));
        assert_eq!(std::fs::read_dir(&out_dir).unwrap().count(), 1);
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
