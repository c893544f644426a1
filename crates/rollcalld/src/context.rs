//! Process-wide state shared by the ingestion thread and request handlers.

use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tokio_util::sync::CancellationToken;

use rollcall_core::{
    AttendanceLedger, FaceEncoder, KnownFaceCache, LiveState, MarkingCoordinator, SharedLive,
    StoreError, TemplateSource,
};
use rollcall_store::SqliteStore;

use crate::config::Config;

pub struct AppContext {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub cache: KnownFaceCache,
    pub coordinator: MarkingCoordinator,
    pub live: SharedLive,
    pub encoder: Arc<dyn FaceEncoder>,
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(
        config: Config,
        store: Arc<SqliteStore>,
        encoder: Arc<dyn FaceEncoder>,
        cancel: CancellationToken,
    ) -> Self {
        let live = LiveState::shared(today());
        let cache = KnownFaceCache::new(Arc::clone(&store) as Arc<dyn TemplateSource>);
        let coordinator = MarkingCoordinator::new(
            Arc::clone(&store) as Arc<dyn AttendanceLedger>,
            Arc::clone(&live),
            config.store_busy_retries,
        );
        Self {
            config,
            store,
            cache,
            coordinator,
            live,
            encoder,
            cancel,
        }
    }

    /// Seed today's marked set from stored events so a restart does not
    /// mark anyone twice. Returns the number of people seeded.
    pub fn seed_today(&self) -> Result<usize, StoreError> {
        let date = today();
        let records = self.store.attendance_on_date(date)?;
        let people: std::collections::HashSet<_> = records.iter().map(|r| r.person_id).collect();
        let count = people.len();
        self.coordinator.seed(date, people);
        Ok(count)
    }
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}
