//! Request-level operations: on-demand marking, registration and people
//! administration. All functions block; HTTP handlers call them through
//! `spawn_blocking`.

use std::path::PathBuf;

use chrono::{NaiveDate, Utc};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

use rollcall_core::{
    Annotation, EncoderError, MarkEntry, MarkError, MarkOutcome, PersonId, StoreError, Template,
    TemplateId,
};
use rollcall_store::{NewPerson, Person, PersonPatch};

use crate::context::{today, AppContext};
use crate::export;
use crate::recognize;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("no frame available yet")]
    NoFrame,
    #[error("camera unavailable")]
    CameraUnavailable,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("no people are enrolled")]
    NoEnrolledPeople,
    #[error("no face matched an enrolled person")]
    NoMatch,
    #[error("person {0} not found")]
    PersonNotFound(PersonId),
    #[error("{0}")]
    InvalidInput(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("marking: {0}")]
    Mark(#[from] MarkError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

#[derive(Debug, Serialize)]
pub struct MarkSummary {
    pub results: Vec<MarkEntry>,
    pub unrecognized: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absentees_export_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct LiveStatus {
    pub date: NaiveDate,
    pub marked_today: usize,
    pub feed_closed: bool,
    pub sequence: Option<u64>,
    pub annotations: Vec<Annotation>,
}

/// Run detection, matching and marking on the current live frame.
pub fn mark_now(ctx: &AppContext) -> Result<MarkSummary, ServiceError> {
    let image = {
        let live = ctx.live.lock();
        // The last frame of a closed feed is frozen; it says nothing about now.
        if live.feed_closed {
            return Err(ServiceError::CameraUnavailable);
        }
        match &live.frame {
            Some(frame) => frame.image.clone(),
            None => return Err(ServiceError::NoFrame),
        }
    };

    let date = today();
    ctx.coordinator.reset_if_new_day(date);
    ctx.cache.invalidate_if_stale(Utc::now(), ctx.config.cache_window);

    let faces = recognize::encode_scaled(ctx.encoder.as_ref(), &image, ctx.config.detect_scale)?;
    if faces.is_empty() {
        return Err(ServiceError::NoFaceDetected);
    }

    let snapshot = ctx.cache.get()?;
    if snapshot.is_empty() {
        return Err(ServiceError::NoEnrolledPeople);
    }

    let recognized = recognize::match_all(&faces, &snapshot, ctx.config.match_threshold);
    let unrecognized = recognized.iter().filter(|f| !f.result.found).count();
    let candidates = recognize::matched_people(&recognized);
    if candidates.is_empty() {
        return Err(ServiceError::NoMatch);
    }

    let report = ctx.coordinator.mark_batch(&candidates)?;
    tracing::info!(
        marked = report.count(MarkOutcome::Marked),
        already = report.count(MarkOutcome::AlreadyMarked),
        failed = report.count(MarkOutcome::Failed),
        unrecognized,
        "on-demand mark"
    );

    let absentees_export_path = ctx.config.export_dir.as_deref().and_then(|dir| {
        export::write_absentees(&ctx.store, dir, date)
            .map_err(|e| tracing::warn!(error = %e, "absentee export failed"))
            .ok()
    });

    Ok(MarkSummary {
        results: report.entries,
        unrecognized,
        absentees_export_path,
    })
}

/// Register a new person from a photo. The most confident face is used.
pub fn register(ctx: &AppContext, person: NewPerson, image: &RgbImage) -> Result<PersonId, ServiceError> {
    if person.name.trim().is_empty() {
        return Err(ServiceError::InvalidInput("name is required".into()));
    }
    let template = best_template(ctx, image)?;
    let (person_id, _) = ctx.store.enroll(&person, &template)?;
    ctx.cache.invalidate();
    Ok(person_id)
}

/// Replace a person's templates with one taken from a new photo.
pub fn reenroll(ctx: &AppContext, person: PersonId, image: &RgbImage) -> Result<TemplateId, ServiceError> {
    let template = best_template(ctx, image)?;
    let template_id = ctx.store.replace_templates(person, &template).map_err(not_found)?;
    ctx.cache.invalidate();
    Ok(template_id)
}

fn best_template(ctx: &AppContext, image: &RgbImage) -> Result<Template, ServiceError> {
    let faces = ctx.encoder.encode(image)?;
    let best = faces
        .into_iter()
        .max_by(|a, b| a.bbox.confidence.total_cmp(&b.bbox.confidence))
        .ok_or(ServiceError::NoFaceDetected)?;
    Ok(best.template)
}

pub fn get_person(ctx: &AppContext, id: PersonId) -> Result<Person, ServiceError> {
    ctx.store.get_person(id)?.ok_or(ServiceError::PersonNotFound(id))
}

pub fn update_person(ctx: &AppContext, id: PersonId, patch: &PersonPatch) -> Result<Person, ServiceError> {
    if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ServiceError::InvalidInput("name cannot be empty".into()));
    }
    if !ctx.store.update_person(id, patch)? {
        return Err(ServiceError::PersonNotFound(id));
    }
    if patch.name.is_some() {
        // Snapshots carry names.
        ctx.cache.invalidate();
    }
    get_person(ctx, id)
}

pub fn delete_person(ctx: &AppContext, id: PersonId) -> Result<(), ServiceError> {
    if !ctx.store.delete_person(id)? {
        return Err(ServiceError::PersonNotFound(id));
    }
    ctx.cache.invalidate();
    Ok(())
}

pub fn live_status(ctx: &AppContext) -> LiveStatus {
    let live = ctx.live.lock();
    LiveStatus {
        date: live.marked.date(),
        marked_today: live.marked.len(),
        feed_closed: live.feed_closed,
        sequence: live.frame.as_ref().map(|f| f.sequence),
        annotations: live.frame.as_ref().map(|f| f.annotations.clone()).unwrap_or_default(),
    }
}

fn not_found(e: StoreError) -> ServiceError {
    match e {
        StoreError::PersonNotFound(id) => ServiceError::PersonNotFound(id),
        other => ServiceError::Store(other),
    }
}
