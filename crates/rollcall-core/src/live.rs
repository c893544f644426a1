//! State shared between the ingestion loop and request handlers.
//!
//! Everything here lives behind one mutex ([`SharedLive`]). Holders must not
//! perform blocking I/O while the guard is alive.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate};
use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{BoundingBox, PersonId};

pub type SharedLive = Arc<Mutex<LiveState>>;

/// Box and label drawn for one detected face.
#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: String,
    pub person_id: Option<PersonId>,
    pub matched: bool,
    pub confidence: f32,
}

/// Most recent full-resolution frame plus what was drawn on it.
#[derive(Debug, Clone)]
pub struct SharedFrame {
    pub image: RgbImage,
    pub annotations: Vec<Annotation>,
    pub sequence: u64,
    pub captured_at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DayPhase {
    /// Accepting marks for the tracked day.
    Open,
    /// The day advanced while a batch for the previous day was still writing.
    Rolled,
}

/// People already confirmed present on `date`.
#[derive(Debug, Clone)]
pub struct DailyMarkedSet {
    date: NaiveDate,
    marked: HashSet<PersonId>,
    phase: DayPhase,
    in_flight: usize,
}

impl DailyMarkedSet {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            marked: HashSet::new(),
            phase: DayPhase::Open,
            in_flight: 0,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn phase(&self) -> DayPhase {
        self.phase
    }

    pub fn contains(&self, person: PersonId) -> bool {
        self.marked.contains(&person)
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    /// Clear the set if `today` differs from the tracked date.
    pub fn reset_if_new_day(&mut self, today: NaiveDate) -> bool {
        if self.date == today {
            return false;
        }
        tracing::info!(
            from = %self.date,
            to = %today,
            cleared = self.marked.len(),
            "day rolled over; clearing marked set"
        );
        self.marked.clear();
        self.date = today;
        if self.in_flight > 0 {
            self.phase = DayPhase::Rolled;
        }
        true
    }

    /// Replace the contents with people already recorded for `date`.
    pub fn seed(&mut self, date: NaiveDate, people: impl IntoIterator<Item = PersonId>) {
        self.date = date;
        self.marked = people.into_iter().collect();
    }

    pub(crate) fn begin_batch(&mut self) {
        self.in_flight += 1;
    }

    /// Publish the people a batch for `day` recorded. Completions for a day
    /// that has since rolled over are dropped.
    pub(crate) fn finish_batch(&mut self, day: NaiveDate, recorded: &[PersonId]) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if day == self.date {
            self.marked.extend(recorded.iter().copied());
        } else if !recorded.is_empty() {
            tracing::debug!(
                batch_day = %day,
                current = %self.date,
                dropped = recorded.len(),
                "batch finished after rollover"
            );
        }
        if self.in_flight == 0 {
            self.phase = DayPhase::Open;
        }
    }
}

/// Everything guarded by the live-state lock.
#[derive(Debug)]
pub struct LiveState {
    pub frame: Option<SharedFrame>,
    pub marked: DailyMarkedSet,
    /// Set once the ingestion loop has ended; no new frames will arrive.
    pub feed_closed: bool,
}

impl LiveState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            frame: None,
            marked: DailyMarkedSet::new(today),
            feed_closed: false,
        }
    }

    pub fn shared(today: NaiveDate) -> SharedLive {
        Arc::new(Mutex::new(Self::new(today)))
    }
}
