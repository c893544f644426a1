//! HTTP surface: live MJPEG feed, on-demand marking, registration and
//! people/attendance administration.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Local, NaiveDate};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use rollcall_core::{Annotation, MarkError, PersonId, StoreError};
use rollcall_store::{DateFilter, NewPerson, PersonPatch};

use crate::context::{today, AppContext};
use crate::recognize;
use crate::service::{self, ServiceError};

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const STREAM_JPEG_QUALITY: u8 = 80;

type Ctx = State<Arc<AppContext>>;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/video_feed", get(video_feed))
        .route("/mark_attendance", get(mark_attendance).post(mark_attendance))
        .route("/register", post(register))
        .route("/api/live", get(live))
        .route("/api/users", get(list_users))
        .route("/api/users/{id}", get(get_user).put(update_user).delete(delete_user))
        .route("/api/users/{id}/templates", post(reenroll))
        .route("/api/attendance", get(attendance))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(ctx)
}

/// Bind `listen_addr` and serve until the context is cancelled.
pub async fn serve(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(ctx.config.listen_addr.as_str()).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");
    let shutdown = ctx.cancel.clone().cancelled_owned();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("HTTP server stopped");
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

fn status_for(e: &ServiceError) -> StatusCode {
    match e {
        ServiceError::NoFrame
        | ServiceError::NoFaceDetected
        | ServiceError::NoEnrolledPeople
        | ServiceError::NoMatch
        | ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ServiceError::PersonNotFound(_) | ServiceError::Store(StoreError::PersonNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        ServiceError::CameraUnavailable
        | ServiceError::Store(StoreError::Busy | StoreError::Unavailable(_))
        | ServiceError::Mark(MarkError::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let status = status_for(&e);
        if status.is_server_error() {
            tracing::error!(error = %e, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %e, status = status.as_u16(), "request rejected");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "status": "error", "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct Success<T: Serialize> {
    status: &'static str,
    #[serde(flatten)]
    body: T,
}

fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        status: "success",
        body,
    })
}

/// Run blocking work (detection, SQLite) off the async runtime.
async fn blocking<T, F>(ctx: Arc<AppContext>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppContext) -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&ctx))
        .await
        .map_err(|e| ApiError::internal(format!("worker failed: {e}")))?
        .map_err(ApiError::from)
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn index() -> &'static str {
    concat!("rollcall ", env!("CARGO_PKG_VERSION"), "\n")
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Local::now().to_rfc3339(),
    }))
}

async fn mark_attendance(State(ctx): Ctx) -> Result<impl IntoResponse, ApiError> {
    let summary = blocking(ctx, service::mark_now).await?;
    Ok(success(summary))
}

#[derive(Serialize)]
struct Registered {
    person_id: PersonId,
}

async fn register(State(ctx): Ctx, multipart: Multipart) -> Result<impl IntoResponse, ApiError> {
    let form = RegisterForm::read(multipart).await?;
    let image_bytes = form.image.ok_or_else(|| ApiError::bad_request("image is required"))?;
    let person = form.person;
    if person.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }

    let person_id = blocking(ctx, move |ctx| {
        let image = decode_image(&image_bytes)?;
        service::register(ctx, person, &image)
    })
    .await?;
    tracing::info!(person_id, "person registered");
    Ok(success(Registered { person_id }))
}

async fn reenroll(
    State(ctx): Ctx,
    Path(id): Path<PersonId>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let form = RegisterForm::read(multipart).await?;
    let image_bytes = form.image.ok_or_else(|| ApiError::bad_request("image is required"))?;
    let template_id = blocking(ctx, move |ctx| {
        let image = decode_image(&image_bytes)?;
        service::reenroll(ctx, id, &image)
    })
    .await?;
    Ok(success(serde_json::json!({ "person_id": id, "template_id": template_id })))
}

async fn live(State(ctx): Ctx) -> Json<service::LiveStatus> {
    Json(service::live_status(&ctx))
}

async fn list_users(State(ctx): Ctx) -> Result<impl IntoResponse, ApiError> {
    let people = blocking(ctx, |ctx| Ok(ctx.store.list_people()?)).await?;
    Ok(Json(people))
}

async fn get_user(State(ctx): Ctx, Path(id): Path<PersonId>) -> Result<impl IntoResponse, ApiError> {
    let person = blocking(ctx, move |ctx| service::get_person(ctx, id)).await?;
    Ok(Json(person))
}

async fn update_user(
    State(ctx): Ctx,
    Path(id): Path<PersonId>,
    Json(patch): Json<PersonPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let person = blocking(ctx, move |ctx| service::update_person(ctx, id, &patch)).await?;
    Ok(Json(person))
}

async fn delete_user(State(ctx): Ctx, Path(id): Path<PersonId>) -> Result<impl IntoResponse, ApiError> {
    blocking(ctx, move |ctx| service::delete_person(ctx, id)).await?;
    Ok(success(serde_json::json!({ "person_id": id })))
}

#[derive(Debug, Default, Deserialize)]
struct AttendanceQuery {
    filter_type: Option<String>,
    date: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

impl AttendanceQuery {
    fn filter(&self) -> Result<DateFilter, ApiError> {
        match self.filter_type.as_deref() {
            None | Some("") => Ok(DateFilter::On(today())),
            Some("single") => Ok(DateFilter::On(match &self.date {
                Some(d) => parse_date(d)?,
                None => today(),
            })),
            Some("range") => {
                let (Some(start), Some(end)) = (&self.start_date, &self.end_date) else {
                    return Err(ApiError::bad_request("range filter needs start_date and end_date"));
                };
                Ok(DateFilter::Between(parse_date(start)?, parse_date(end)?))
            }
            Some(other) => Err(ApiError::bad_request(format!("unknown filter_type: {other}"))),
        }
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid date (want YYYY-MM-DD): {value}")))
}

async fn attendance(State(ctx): Ctx, Query(query): Query<AttendanceQuery>) -> Result<impl IntoResponse, ApiError> {
    let filter = query.filter()?;
    let records = blocking(ctx, move |ctx| Ok(ctx.store.attendance(filter)?)).await?;
    Ok(Json(records))
}

// ── Multipart ────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegisterForm {
    person: NewPerson,
    image: Option<Vec<u8>>,
}

impl RegisterForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("malformed form: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "image" {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("image upload failed: {e}")))?;
                form.image = Some(bytes.to_vec());
                continue;
            }

            let text = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("field {name}: {e}")))?;
            let value = Some(text.trim().to_string()).filter(|v| !v.is_empty());
            match name.as_str() {
                "name" => form.person.name = value.unwrap_or_default(),
                "email" => form.person.email = value,
                "proxy" => form.person.proxy = value,
                "department" => form.person.department = value,
                "salary" => {
                    form.person.salary = value
                        .map(|v| v.parse::<f64>())
                        .transpose()
                        .map_err(|_| ApiError::bad_request("salary must be a number"))?;
                }
                other => tracing::debug!(field = other, "ignoring unknown form field"),
            }
        }
        Ok(form)
    }
}

fn decode_image(bytes: &[u8]) -> Result<RgbImage, ServiceError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| ServiceError::InvalidInput(format!("unreadable image: {e}")))
}

// ── MJPEG feed ───────────────────────────────────────────────────────────

enum FeedPoll {
    Ready(u64, RgbImage, Vec<Annotation>),
    Pending,
    Closed,
}

fn poll_frame(ctx: &AppContext, last_sent: Option<u64>) -> FeedPoll {
    let live = ctx.live.lock();
    match &live.frame {
        Some(frame) if Some(frame.sequence) != last_sent => {
            FeedPoll::Ready(frame.sequence, frame.image.clone(), frame.annotations.clone())
        }
        _ if live.feed_closed => FeedPoll::Closed,
        _ => FeedPoll::Pending,
    }
}

struct FeedState {
    ctx: Arc<AppContext>,
    last_sent: Option<u64>,
}

fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    )
    .into_bytes();
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

async fn next_part(mut state: FeedState) -> Option<(Result<Vec<u8>, Infallible>, FeedState)> {
    loop {
        if state.ctx.cancel.is_cancelled() {
            return None;
        }
        match poll_frame(&state.ctx, state.last_sent) {
            FeedPoll::Closed => return None,
            FeedPoll::Pending => {
                tokio::select! {
                    _ = state.ctx.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(state.ctx.config.stream_interval) => {}
                }
            }
            FeedPoll::Ready(sequence, mut image, annotations) => {
                state.last_sent = Some(sequence);
                let encoded = tokio::task::spawn_blocking(move || {
                    recognize::draw_annotations(&mut image, &annotations);
                    rollcall_hw::frame::encode_jpeg(&image, STREAM_JPEG_QUALITY)
                })
                .await;
                match encoded {
                    Ok(Ok(jpeg)) => return Some((Ok(multipart_part(&jpeg)), state)),
                    Ok(Err(e)) => tracing::warn!(sequence, error = %e, "frame encode failed"),
                    Err(e) => {
                        tracing::warn!(error = %e, "frame encoder task failed; ending stream");
                        return None;
                    }
                }
            }
        }
    }
}

async fn video_feed(State(ctx): Ctx) -> Response {
    tracing::debug!("video feed client connected");
    let stream = futures::stream::unfold(FeedState { ctx, last_sent: None }, next_part);
    (
        [
            (header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use axum::http::Request;
    use rollcall_core::SharedFrame;
    use tower::ServiceExt;

    const BOUNDARY: &str = "rollcall-test-boundary";

    fn jpeg_bytes() -> Vec<u8> {
        rollcall_hw::frame::encode_jpeg(&RgbImage::new(8, 8), 90).unwrap()
    }

    fn multipart_body(fields: &[(&str, &str)], image: Option<&[u8]>) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                    .as_bytes(),
            );
        }
        if let Some(bytes) = image {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"face.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    fn post_form(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(body)
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_of(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn publish_frame(ctx: &AppContext) {
        ctx.live.lock().frame = Some(SharedFrame {
            image: RgbImage::new(16, 16),
            annotations: Vec::new(),
            sequence: 7,
            captured_at: Local::now(),
        });
    }

    #[tokio::test]
    async fn test_health() {
        let t = test_context();
        let response = router(Arc::clone(&t.ctx)).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_mark_without_frame_is_client_error() {
        let t = test_context();
        let request = Request::builder()
            .method("POST")
            .uri("/mark_attendance")
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(&t.ctx)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_of(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "no frame available yet");
    }

    #[tokio::test]
    async fn test_register_then_mark_twice() {
        let t = test_context();
        publish_frame(&t.ctx);
        t.encoder.set(vec![face(&template(1.0), 0.9)]);
        let app = router(Arc::clone(&t.ctx));

        let form = multipart_body(&[("name", "alice"), ("department", "eng")], Some(&jpeg_bytes()));
        let response = app.clone().oneshot(post_form("/register", form)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let registered = json_of(response).await;
        assert_eq!(registered["status"], "success");
        let person_id = registered["person_id"].as_i64().unwrap();

        let response = app.clone().oneshot(get("/mark_attendance")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = json_of(response).await;
        assert_eq!(first["status"], "success");
        assert_eq!(first["results"][0]["person_id"], person_id);
        assert_eq!(first["results"][0]["result"], "Marked");
        assert_eq!(first["unrecognized"], 0);

        let second = json_of(app.clone().oneshot(get("/mark_attendance")).await.unwrap()).await;
        assert_eq!(second["results"][0]["result"], "AlreadyMarked");

        let user = json_of(app.oneshot(get(&format!("/api/users/{person_id}"))).await.unwrap()).await;
        assert_eq!(user["name"], "alice");
        assert_eq!(user["department"], "eng");
    }

    #[tokio::test]
    async fn test_register_validation() {
        let t = test_context();
        let app = router(Arc::clone(&t.ctx));

        let no_image = multipart_body(&[("name", "bob")], None);
        let response = app.clone().oneshot(post_form("/register", no_image)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let no_face = multipart_body(&[("name", "bob")], Some(&jpeg_bytes()));
        let response = app.clone().oneshot(post_form("/register", no_face)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["message"], "no face detected");

        t.encoder.set(vec![face(&template(1.0), 0.9)]);
        let garbage = multipart_body(&[("name", "bob")], Some(b"not an image"));
        let response = app.clone().oneshot(post_form("/register", garbage)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bad_salary = multipart_body(&[("name", "bob"), ("salary", "lots")], Some(&jpeg_bytes()));
        let response = app.oneshot(post_form("/register", bad_salary)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_user_admin_routes() {
        let t = test_context();
        let id = t.ctx.store.create_person(&NewPerson::named("carol")).unwrap();
        let app = router(Arc::clone(&t.ctx));

        let listed = json_of(app.clone().oneshot(get("/api/users")).await.unwrap()).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let update = Request::builder()
            .method("PUT")
            .uri(format!("/api/users/{id}"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"email":"carol@example.com"}"#))
            .unwrap();
        let updated = json_of(app.clone().oneshot(update).await.unwrap()).await;
        assert_eq!(updated["email"], "carol@example.com");

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/users/{id}"))
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(app.clone().oneshot(delete()).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.clone().oneshot(delete()).await.unwrap().status(), StatusCode::NOT_FOUND);
        let missing = app.oneshot(get(&format!("/api/users/{id}"))).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_attendance_filters() {
        let t = test_context();
        let id = t.ctx.store.create_person(&NewPerson::named("dana")).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        t.ctx
            .store
            .record_attendance(id, day.and_hms_opt(8, 30, 0).unwrap())
            .unwrap();
        let app = router(Arc::clone(&t.ctx));

        let single = json_of(
            app.clone()
                .oneshot(get("/api/attendance?filter_type=single&date=2024-02-10"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(single.as_array().unwrap().len(), 1);
        assert_eq!(single[0]["name"], "dana");

        let range = json_of(
            app.clone()
                .oneshot(get("/api/attendance?filter_type=range&start_date=2024-02-01&end_date=2024-02-05"))
                .await
                .unwrap(),
        )
        .await;
        assert!(range.as_array().unwrap().is_empty());

        let bad = app
            .oneshot(get("/api/attendance?filter_type=single&date=10/02/2024"))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_video_feed_ends_when_feed_closes() {
        let t = test_context();
        publish_frame(&t.ctx);
        t.ctx.live.lock().feed_closed = true;

        let response = router(Arc::clone(&t.ctx)).oneshot(get("/video_feed")).await.unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
        assert_eq!(body.windows(7).filter(|w| w == b"--frame").count(), 1);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&ServiceError::NoMatch), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&ServiceError::PersonNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&ServiceError::Store(StoreError::Busy)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&ServiceError::Mark(MarkError::StoreUnavailable("down".into()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&ServiceError::CameraUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&ServiceError::Store(StoreError::Database("boom".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
