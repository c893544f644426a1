//! Frame ingestion loop.
//!
//! Runs on a dedicated OS thread: read a frame, detect and match faces,
//! publish the annotated frame, then hand newly seen people to the
//! coordinator. The live-state lock is only taken for matching and the
//! in-memory updates; capture, detection and store writes happen outside it.

use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{Local, Utc};

use rollcall_core::{CacheSnapshot, MarkOutcome, SharedFrame, SharedLive};
use rollcall_hw::{CameraError, Frame, FrameSource};

use crate::context::{today, AppContext};
use crate::recognize;

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    CameraUnavailable(String),
}

/// Spawn the ingestion loop on the `rollcall-ingest` thread.
///
/// The source is opened on that thread so it never has to cross threads.
pub fn spawn<S, F>(ctx: Arc<AppContext>, open_source: F) -> std::io::Result<JoinHandle<LoopExit>>
where
    S: FrameSource + 'static,
    F: FnOnce() -> Result<S, CameraError> + Send + 'static,
{
    std::thread::Builder::new()
        .name("rollcall-ingest".into())
        .spawn(move || {
            tracing::info!("ingestion thread started");
            let exit = match open_source() {
                Ok(source) => run(&ctx, source),
                Err(e) => {
                    tracing::error!(error = %e, "video source unavailable; live feed disabled");
                    ctx.live.lock().feed_closed = true;
                    LoopExit::CameraUnavailable(e.to_string())
                }
            };
            tracing::info!(?exit, "ingestion thread exiting");
            exit
        })
}

/// Owns the frame source for the lifetime of the loop. Dropping it, on any
/// exit path including a panic, releases the source and closes the feed.
struct SourceGuard<S: FrameSource> {
    source: S,
    live: SharedLive,
}

impl<S: FrameSource> SourceGuard<S> {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.source.read_frame()
    }
}

impl<S: FrameSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        self.live.lock().feed_closed = true;
        tracing::info!(source = %self.source.describe(), "video source released");
    }
}

/// Run the loop until cancellation or a capture failure.
pub fn run<S: FrameSource>(ctx: &AppContext, source: S) -> LoopExit {
    tracing::info!(source = %source.describe(), stride = ctx.config.frame_stride, "ingestion loop running");
    let mut guard = SourceGuard {
        source,
        live: Arc::clone(&ctx.live),
    };
    let stride = u64::from(ctx.config.frame_stride.max(1));
    let mut counter: u64 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            return LoopExit::Cancelled;
        }

        let frame = match guard.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "frame capture failed; stopping ingestion");
                return LoopExit::CameraUnavailable(e.to_string());
            }
        };

        counter += 1;
        if counter % stride != 0 {
            continue;
        }
        process_frame(ctx, frame, counter);
    }
}

fn process_frame(ctx: &AppContext, frame: Frame, sequence: u64) {
    ctx.coordinator.reset_if_new_day(today());
    ctx.cache.invalidate_if_stale(Utc::now(), ctx.config.cache_window);

    let faces = match recognize::encode_scaled(ctx.encoder.as_ref(), &frame.image, ctx.config.detect_scale) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::warn!(sequence, error = %e, "face encoding failed; skipping frame");
            return;
        }
    };

    let snapshot = ctx.cache.get().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "known-face cache unavailable; matching against nothing");
        Arc::new(CacheSnapshot::new(Vec::new(), Utc::now(), 0))
    });

    let candidates = {
        let mut live = ctx.live.lock();
        let recognized = recognize::match_all(&faces, &snapshot, ctx.config.match_threshold);
        let candidates = recognize::pending_people(&recognized, &live.marked);
        live.frame = Some(SharedFrame {
            image: frame.image,
            annotations: recognize::annotations(&recognized),
            sequence,
            captured_at: Local::now(),
        });
        candidates
    };

    if candidates.is_empty() {
        return;
    }
    match ctx.coordinator.mark_batch(&candidates) {
        Ok(report) => {
            for entry in report.entries.iter().filter(|e| e.result == MarkOutcome::Failed) {
                tracing::warn!(
                    person_id = entry.person_id,
                    reason = entry.reason.as_deref().unwrap_or(""),
                    "automatic mark failed"
                );
            }
            tracing::debug!(
                sequence,
                marked = report.count(MarkOutcome::Marked),
                already = report.count(MarkOutcome::AlreadyMarked),
                "frame batch processed"
            );
        }
        Err(e) => tracing::warn!(sequence, error = %e, "automatic marking failed"),
    }
}
