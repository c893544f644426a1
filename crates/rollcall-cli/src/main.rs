use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};

use rollcall_core::PersonId;
use rollcall_store::{DateFilter, SqliteStore, StoreConfig};

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Rollcall attendance administration")]
struct Cli {
    /// SQLite database (default: $ROLLCALL_DB_PATH or $XDG_DATA_HOME/rollcall/attendance.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered people
    People,
    /// Remove a person with their templates and attendance history
    Remove {
        /// Person ID to remove
        id: PersonId,
    },
    /// Attendance events for a day or a date range
    Report {
        /// Single day (YYYY-MM-DD, default today)
        #[arg(long, conflicts_with_all = ["from", "to"])]
        date: Option<NaiveDate>,
        /// Range start (YYYY-MM-DD)
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        /// Range end (YYYY-MM-DD)
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Event count per person, overall or on one day
    Summary {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// People with no attendance on a day
    Absentees {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db = cli.db.clone().unwrap_or_else(default_db_path);
    if !db.exists() {
        bail!("no attendance database at {}", db.display());
    }
    let store = SqliteStore::open(&db, StoreConfig::default())
        .with_context(|| format!("opening {}", db.display()))?;
    tracing::debug!(db = %db.display(), "store opened");

    match cli.command {
        Commands::People => {
            let people = store.list_people()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&people)?);
            } else if people.is_empty() {
                println!("No people registered");
            } else {
                println!("{:<6} {:<24} {:<28} {}", "ID", "NAME", "EMAIL", "DEPARTMENT");
                for p in &people {
                    println!(
                        "{:<6} {:<24} {:<28} {}",
                        p.id,
                        p.name,
                        p.email.as_deref().unwrap_or("-"),
                        p.department.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
        Commands::Remove { id } => {
            if !store.delete_person(id)? {
                bail!("person {id} not found");
            }
            println!("Removed person {id}");
        }
        Commands::Report { date, from, to } => {
            let filter = match (from, to) {
                (Some(from), Some(to)) => DateFilter::Between(from, to),
                _ => DateFilter::On(date.unwrap_or_else(today)),
            };
            let records = store.attendance(filter)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No attendance recorded");
            } else {
                println!("{:<20} {:<6} {}", "TIMESTAMP", "ID", "NAME");
                for r in &records {
                    println!("{:<20} {:<6} {}", r.timestamp.format("%Y-%m-%d %H:%M:%S"), r.person_id, r.name);
                }
            }
        }
        Commands::Summary { date } => {
            let summary = store.attendance_summary(date)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{:<6} {:<24} {}", "ID", "NAME", "COUNT");
                for s in &summary {
                    println!("{:<6} {:<24} {}", s.person_id, s.name, s.count);
                }
            }
        }
        Commands::Absentees { date } => {
            let date = date.unwrap_or_else(today);
            let absent = store.absentees_on(date)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&absent)?);
            } else if absent.is_empty() {
                println!("Everyone attended on {date}");
            } else {
                println!("Absent on {date}:");
                for p in &absent {
                    println!("  {:<6} {}", p.id, p.name);
                }
            }
        }
    }

    Ok(())
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/attendance.db")
}
