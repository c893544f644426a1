//! rollcall-core — recognition and marking engine.
//!
//! Face encoding (SCRFD detection + ArcFace templates via ONNX Runtime),
//! template matching, the known-face cache and the per-day marking
//! coordinator. Storage is reached through the traits in [`store`].

pub mod cache;
pub mod coordinator;
pub mod detector;
pub mod encoder;
pub mod live;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod template;
pub mod types;

pub use cache::{CacheSnapshot, KnownFaceCache, DEFAULT_CACHE_WINDOW};
pub use coordinator::{BatchReport, MarkEntry, MarkError, MarkOutcome, MarkingCoordinator};
pub use encoder::{default_model_dir, EncoderError, FaceEncoder, OnnxFaceEncoder};
pub use live::{Annotation, DailyMarkedSet, DayPhase, LiveState, SharedFrame, SharedLive};
pub use matcher::{match_face, EuclideanMatcher, MatchResult, Matcher};
pub use store::{AttendanceLedger, StoreError, TemplateSource};
pub use template::{Template, TemplateError};
pub use types::{BoundingBox, DetectedFace, EventId, KnownFace, PersonId, TemplateId};
