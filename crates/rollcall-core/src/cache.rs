//! Known-face cache: an atomically swapped snapshot of every stored template.
//!
//! Readers load the current snapshot without locking. Every invalidation
//! bumps a generation counter; a snapshot is only served while its
//! generation is current, so a reload that raced with an invalidation is
//! discarded on the next `get()` instead of hiding a fresh registration.
//!
//! A snapshot that has merely aged past its window stays servable: one
//! caller reloads it while everyone else keeps reading the old one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::store::{StoreError, TemplateSource};
use crate::types::KnownFace;

/// Default refresh window for [`KnownFaceCache::invalidate_if_stale`].
pub const DEFAULT_CACHE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Immutable point-in-time copy of all known templates.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    faces: Vec<KnownFace>,
    captured_at: DateTime<Utc>,
    generation: u64,
}

impl CacheSnapshot {
    pub fn new(faces: Vec<KnownFace>, captured_at: DateTime<Utc>, generation: u64) -> Self {
        Self {
            faces,
            captured_at,
            generation,
        }
    }

    pub fn faces(&self) -> &[KnownFace] {
        &self.faces
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct KnownFaceCache {
    source: Arc<dyn TemplateSource>,
    current: ArcSwapOption<CacheSnapshot>,
    generation: AtomicU64,
    /// Set when the current snapshot outlived its window.
    refresh: AtomicBool,
    /// Serializes reloads so one invalidation causes one storage read.
    reload: Mutex<()>,
}

impl KnownFaceCache {
    pub fn new(source: Arc<dyn TemplateSource>) -> Self {
        Self {
            source,
            current: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            refresh: AtomicBool::new(false),
            reload: Mutex::new(()),
        }
    }

    /// Return the current snapshot, loading it from the store if there is
    /// none or it has been invalidated. A stale snapshot is refreshed by
    /// whichever caller gets the reload lock first; the others get the
    /// stale one without waiting.
    pub fn get(&self) -> Result<Arc<CacheSnapshot>, StoreError> {
        if let Some(snapshot) = self.current_snapshot() {
            if !self.refresh.load(Ordering::Acquire) {
                return Ok(snapshot);
            }
            let Some(_reload) = self.reload.try_lock() else {
                return Ok(snapshot);
            };
            if !self.refresh.load(Ordering::Acquire) {
                return Ok(self.current_snapshot().unwrap_or(snapshot));
            }
            return match self.load() {
                Ok(fresh) => Ok(fresh),
                Err(e) => {
                    self.refresh.store(true, Ordering::Release);
                    tracing::warn!(error = %e, "known-face refresh failed; serving previous snapshot");
                    Ok(snapshot)
                }
            };
        }

        let _reload = self.reload.lock();
        // Another caller may have finished the reload while we waited.
        if let Some(snapshot) = self.current_snapshot() {
            return Ok(snapshot);
        }
        self.load().map_err(|e| {
            self.current.store(None);
            e
        })
    }

    /// Force the next [`get`](Self::get) to reload from the store.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.current.store(None);
        tracing::debug!("known-face cache invalidated");
    }

    /// Mark the snapshot for refresh if it is older than `window`. Unlike
    /// [`invalidate`](Self::invalidate) the old snapshot stays servable
    /// until its replacement is swapped in. Returns `true` if marked.
    pub fn invalidate_if_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Some(snapshot) = self.current.load_full() else {
            return false;
        };
        let age = (now - snapshot.captured_at).to_std().unwrap_or(Duration::ZERO);
        if age > window {
            if !self.refresh.swap(true, Ordering::AcqRel) {
                tracing::info!(age_secs = age.as_secs(), "known-face cache is stale; refreshing");
            }
            true
        } else {
            false
        }
    }

    /// When the current snapshot was loaded, if one is loaded.
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.current_snapshot().map(|s| s.captured_at)
    }

    /// Caller holds `reload`.
    fn load(&self) -> Result<Arc<CacheSnapshot>, StoreError> {
        let generation = self.generation.load(Ordering::Acquire);
        self.refresh.store(false, Ordering::Release);
        let faces = self.source.load_known_faces()?;
        let snapshot = Arc::new(CacheSnapshot::new(faces, Utc::now(), generation));
        self.current.store(Some(Arc::clone(&snapshot)));

        tracing::info!(
            templates = snapshot.len(),
            generation,
            "known-face cache loaded"
        );
        Ok(snapshot)
    }

    fn current_snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        let snapshot = self.current.load_full()?;
        (snapshot.generation == self.generation.load(Ordering::Acquire)).then_some(snapshot)
    }
}
