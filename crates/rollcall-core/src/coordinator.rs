//! Per-day attendance deduplication and marking.
//!
//! The coordinator is the only component that decides whether a person has
//! been marked today. Both the ingestion loop and the on-demand path submit
//! candidates here.
//!
//! A batch runs in three steps:
//! 1. triage under the live lock (reset on a new day, split candidates into
//!    already-marked and pending);
//! 2. store writes with no live lock held;
//! 3. publish recorded people into the marked set under the live lock.
//!
//! Batches are serialized by their own gate, so a person can never be
//! written twice by two overlapping batches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::live::SharedLive;
use crate::store::{AttendanceLedger, StoreError};
use crate::types::{EventId, PersonId};

const BUSY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarkOutcome {
    Marked,
    AlreadyMarked,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkEntry {
    pub person_id: PersonId,
    pub name: String,
    pub result: MarkOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-candidate outcomes, in submission order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub entries: Vec<MarkEntry>,
}

impl BatchReport {
    pub fn outcome(&self, person: PersonId) -> Option<MarkOutcome> {
        self.entries
            .iter()
            .find(|e| e.person_id == person)
            .map(|e| e.result)
    }

    pub fn count(&self, outcome: MarkOutcome) -> usize {
        self.entries.iter().filter(|e| e.result == outcome).count()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarkError {
    #[error("attendance store unreachable: {0}")]
    StoreUnavailable(String),
}

pub struct MarkingCoordinator {
    ledger: Arc<dyn AttendanceLedger>,
    live: SharedLive,
    batch_gate: Mutex<()>,
    busy_retries: u32,
}

impl MarkingCoordinator {
    pub fn new(ledger: Arc<dyn AttendanceLedger>, live: SharedLive, busy_retries: u32) -> Self {
        Self {
            ledger,
            live,
            batch_gate: Mutex::new(()),
            busy_retries,
        }
    }

    /// Mark every candidate not yet marked today, timestamped now.
    pub fn mark_batch(&self, candidates: &[(PersonId, String)]) -> Result<BatchReport, MarkError> {
        self.mark_batch_at(candidates, Local::now().naive_local())
    }

    /// As [`mark_batch`](Self::mark_batch) with an explicit timestamp; the
    /// calendar day is taken from `at`.
    pub fn mark_batch_at(
        &self,
        candidates: &[(PersonId, String)],
        at: NaiveDateTime,
    ) -> Result<BatchReport, MarkError> {
        let _batch = self.batch_gate.lock();
        let day = at.date();

        let mut entries: Vec<MarkEntry> = Vec::with_capacity(candidates.len());
        let mut pending: Vec<usize> = Vec::new();
        {
            let mut live = self.live.lock();
            live.marked.reset_if_new_day(day);

            let mut seen = HashSet::new();
            for (person_id, name) in candidates {
                if !seen.insert(*person_id) {
                    continue;
                }
                let already = live.marked.contains(*person_id);
                if !already {
                    pending.push(entries.len());
                }
                entries.push(MarkEntry {
                    person_id: *person_id,
                    name: name.clone(),
                    result: if already {
                        MarkOutcome::AlreadyMarked
                    } else {
                        MarkOutcome::Failed
                    },
                    event_id: None,
                    reason: None,
                });
            }
            if !pending.is_empty() {
                live.marked.begin_batch();
            }
        }

        if pending.is_empty() {
            return Ok(BatchReport { entries });
        }

        let mut recorded = Vec::with_capacity(pending.len());
        let mut unreachable: Option<String> = None;
        let mut unreachable_count = 0usize;

        for &idx in &pending {
            let entry = &mut entries[idx];
            match self.record_with_retry(entry.person_id, at) {
                Ok(event_id) => {
                    tracing::info!(person_id = entry.person_id, name = %entry.name, "attendance marked");
                    entry.result = MarkOutcome::Marked;
                    entry.event_id = Some(event_id);
                    recorded.push(entry.person_id);
                }
                Err(e) => {
                    tracing::warn!(person_id = entry.person_id, error = %e, "attendance write failed");
                    if let StoreError::Unavailable(msg) = &e {
                        unreachable_count += 1;
                        unreachable = Some(msg.clone());
                    }
                    entry.reason = Some(e.to_string());
                }
            }
        }

        self.live.lock().marked.finish_batch(day, &recorded);

        if unreachable_count == pending.len() {
            if let Some(msg) = unreachable {
                return Err(MarkError::StoreUnavailable(msg));
            }
        }
        Ok(BatchReport { entries })
    }

    /// Clear the marked set if `today` is a new day.
    pub fn reset_if_new_day(&self, today: NaiveDate) -> bool {
        self.live.lock().marked.reset_if_new_day(today)
    }

    pub fn is_marked(&self, person: PersonId) -> bool {
        self.live.lock().marked.contains(person)
    }

    /// Prime the marked set with people the store already has for `date`.
    pub fn seed(&self, date: NaiveDate, people: impl IntoIterator<Item = PersonId>) {
        let mut live = self.live.lock();
        live.marked.seed(date, people);
        tracing::info!(date = %date, marked = live.marked.len(), "marked set seeded from store");
    }

    fn record_with_retry(&self, person: PersonId, at: NaiveDateTime) -> Result<EventId, StoreError> {
        let mut attempt = 0;
        loop {
            match self.ledger.record_attendance(person, at) {
                Err(e) if e.is_transient() && attempt < self.busy_retries => {
                    attempt += 1;
                    tracing::debug!(person_id = person, attempt, "store busy; retrying");
                    std::thread::sleep(BUSY_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }
}
