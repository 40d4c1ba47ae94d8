use crate::config::Config;
use crate::engine::EngineHandle;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use rollcall_core::index::sanitize_name;
use rollcall_core::{Ledger, MarkOutcome, Recognition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const UPLOAD_HTML: &str = include_str!("../assets/upload.html");
const SCRIPT_JS: &str = include_str!("../assets/script.js");

const NOT_RECOGNIZED: &str = "Face not recognized.";
const NO_IMAGE: &str = "No image data received.";

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub ledger: Arc<Ledger>,
    pub config: Arc<Config>,
}

/// Errors surfaced to HTTP callers as `{ "message": ... }`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Server error: {0}")]
    Internal(String),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct MessageBody {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        match &self {
            ApiError::Internal(e) => tracing::error!(error = %e, "request failed"),
            ApiError::BadRequest(e) => tracing::debug!(error = %e, "rejected request"),
        }
        (status, Json(MessageBody { message: self.to_string() })).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RecognizeRequest {
    image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecognizeResponse {
    pub message: String,
    pub outcome: &'static str,
}

impl From<MarkOutcome> for RecognizeResponse {
    fn from(outcome: MarkOutcome) -> Self {
        Self {
            message: outcome.message(),
            outcome: outcome.code(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub faces_dir: String,
    pub ledger_path: String,
    pub index_policy: String,
    pub match_threshold: f32,
    pub known_faces: usize,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/", get(|| async { Html(INDEX_HTML) }))
        .route("/admin", get(|| async { Html(UPLOAD_HTML) }))
        .route("/static/script.js", get(script))
        .route("/status", get(status))
        .route("/recognize", post(recognize))
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript")], SCRIPT_JS)
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let known_faces = state.engine.known_faces().await.map_err(ApiError::internal)?;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        faces_dir: state.config.faces_dir.display().to_string(),
        ledger_path: state.ledger.path().display().to_string(),
        index_policy: state.config.index_policy.to_string(),
        match_threshold: state.config.match_threshold,
        known_faces: known_faces.len(),
    }))
}

/// Body is parsed as JSON regardless of its content type.
async fn recognize(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let request: RecognizeRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request(NO_IMAGE))?;
    let data_url = request
        .image
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request(NO_IMAGE))?;

    let bytes = decode_data_url(&data_url)?;
    let frame = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(ApiError::internal)?
        .map_err(|e| ApiError::bad_request(format!("Invalid image: {e}")))?
        .to_rgb8();

    let name = match state.engine.recognize(frame).await.map_err(ApiError::internal)? {
        Recognition::Matched { name, .. } => name,
        Recognition::NoMatch { .. } => return Ok(not_recognized("no_match")),
        Recognition::NoFace => return Ok(not_recognized("no_face")),
    };

    let ledger = Arc::clone(&state.ledger);
    let outcome = tokio::task::spawn_blocking(move || ledger.mark_attendance(&name))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    tracing::info!(code = outcome.code(), "{outcome}");
    Ok(Json(outcome.into()))
}

fn not_recognized(outcome: &'static str) -> Json<RecognizeResponse> {
    Json(RecognizeResponse {
        message: NOT_RECOGNIZED.to_string(),
        outcome,
    })
}

/// Decode `data:<mime>;base64,<payload>`; a bare base64 payload is accepted too.
fn decode_data_url(data_url: &str) -> Result<Vec<u8>, ApiError> {
    let payload = match data_url.split_once(',') {
        Some((_, payload)) => payload,
        None => data_url,
    };
    let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if payload.is_empty() {
        return Err(ApiError::bad_request(NO_IMAGE));
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| ApiError::bad_request(format!("Invalid base64 image data: {e}")))
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<MessageBody>, ApiError> {
    let mut name = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid form data: {e}")))?
    {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("name") => {
                name = Some(field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?)
            }
            Some("file") => {
                file = Some(field.bytes().await.map_err(|e| ApiError::bad_request(e.to_string()))?)
            }
            _ => {}
        }
    }

    let (Some(name), Some(file)) = (name, file) else {
        return Err(ApiError::bad_request("Missing name or file"));
    };
    if file.is_empty() {
        return Err(ApiError::bad_request("Invalid input"));
    }

    let faces_dir = state.config.faces_dir.clone();
    let file_name = tokio::task::spawn_blocking(move || save_known_face(&faces_dir, &name, &file))
        .await
        .map_err(ApiError::internal)??;

    state
        .engine
        .invalidate_index()
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(MessageBody {
        message: format!("Uploaded successfully as {file_name}."),
    }))
}

/// Validate the image and write it as `<sanitized name>.jpg`.
fn save_known_face(faces_dir: &Path, name: &str, bytes: &[u8]) -> Result<String, ApiError> {
    let stem = sanitize_name(name).ok_or_else(|| ApiError::bad_request("Invalid input"))?;
    image::load_from_memory(bytes).map_err(|e| ApiError::bad_request(format!("Invalid image: {e}")))?;

    let file_name = format!("{stem}.jpg");
    std::fs::create_dir_all(faces_dir).map_err(ApiError::internal)?;
    let path = faces_dir.join(&file_name);
    std::fs::write(&path, bytes).map_err(ApiError::internal)?;

    tracing::info!(path = %path.display(), "known face stored");
    Ok(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use axum::body::Body;
    use axum::extract::{FromRequest, Request};
    use base64::Engine as _;
    use image::{Rgb, RgbImage};
    use rollcall_core::{
        EncoderError, Embedding, EuclideanMatcher, FaceEncoder, FaceMatcher, IndexCache, IndexPolicy,
    };

    /// The top-left pixel is the face; black means none.
    struct CornerPixel;

    impl FaceEncoder for CornerPixel {
        fn encode(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, EncoderError> {
            let p = image.get_pixel(0, 0).0;
            if p == [0, 0, 0] {
                return Ok(Vec::new());
            }
            Ok(vec![Embedding::new(p.iter().map(|&v| v as f32).collect())])
        }
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        RgbImage::from_pixel(4, 4, Rgb(color))
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn data_url(color: [u8; 3]) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png(color));
        format!("data:image/png;base64,{encoded}")
    }

    fn state_in(dir: &Path) -> AppState {
        state_with_policy(dir, IndexPolicy::Rebuild)
    }

    fn state_with_policy(dir: &Path, policy: IndexPolicy) -> AppState {
        let config = Config {
            faces_dir: dir.join("faces"),
            ledger_path: dir.join("Attendance.csv"),
            ..Config::default()
        };
        std::fs::create_dir_all(&config.faces_dir).unwrap();
        let engine = spawn_engine(
            CornerPixel,
            IndexCache::new(&config.faces_dir, policy),
            FaceMatcher::new(EuclideanMatcher { max_distance: 1.0 }),
        )
        .unwrap();
        AppState {
            engine,
            ledger: Arc::new(Ledger::new(&config.ledger_path)),
            config: Arc::new(config),
        }
    }

    fn body(image: &str) -> Bytes {
        Bytes::from(serde_json::json!({ "image": image }).to_string())
    }

    const BOUNDARY: &str = "rollcall-test-boundary";

    /// A `multipart/form-data` body; parts with a file name are sent as files.
    fn form(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, file_name, data) in parts {
            out.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        out
    }

    async fn post_upload(state: &AppState, parts: &[(&str, Option<&str>, &[u8])]) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(form(parts)))
            .unwrap();
        let multipart = Multipart::from_request(request, &()).await.unwrap();
        upload(State(state.clone()), multipart).await.into_response()
    }

    #[test]
    fn test_decode_data_url() {
        assert_eq!(decode_data_url("data:image/png;base64,aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_data_url("aGVsbG8=").unwrap(), b"hello");
        assert!(matches!(decode_data_url("data:image/png;base64,"), Err(ApiError::BadRequest(_))));
        assert!(matches!(decode_data_url("data:,!!!"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_save_known_face_sanitizes_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let stored = save_known_face(dir.path(), "Jane Doe", &png([1, 2, 3])).unwrap();
        assert_eq!(stored, "Jane_Doe.jpg");
        assert!(dir.path().join("Jane_Doe.jpg").is_file());

        assert!(matches!(
            save_known_face(dir.path(), "Bob", b"not an image"),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            save_known_face(dir.path(), "   ", &png([1, 2, 3])),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_internal_error_message_prefix() {
        assert_eq!(ApiError::internal("disk full").to_string(), "Server error: disk full");
    }

    #[tokio::test]
    async fn test_recognize_checks_in_then_grace() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        save_known_face(&state.config.faces_dir, "Alice", &png([10, 20, 30])).unwrap();

        let Json(first) = recognize(State(state.clone()), body(&data_url([10, 20, 30])))
            .await
            .unwrap();
        assert_eq!(first.outcome, "checked_in");
        assert!(first.message.starts_with("Welcome Alice"));

        let Json(second) = recognize(State(state.clone()), body(&data_url([10, 20, 30])))
            .await
            .unwrap();
        assert_eq!(second.outcome, "grace");
        assert_eq!(state.ledger.records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recognize_unknown_and_faceless_frames() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let Json(no_face) = recognize(State(state.clone()), body(&data_url([0, 0, 0])))
            .await
            .unwrap();
        assert_eq!(no_face.outcome, "no_face");
        assert_eq!(no_face.message, NOT_RECOGNIZED);

        let Json(no_match) = recognize(State(state.clone()), body(&data_url([90, 90, 90])))
            .await
            .unwrap();
        assert_eq!(no_match.outcome, "no_match");
        assert!(!state.ledger.path().exists());
    }

    #[tokio::test]
    async fn test_status_counts_known_faces() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        save_known_face(&state.config.faces_dir, "Alice", &png([10, 20, 30])).unwrap();

        let Json(status) = status(State(state)).await.unwrap();
        assert_eq!(status.known_faces, 1);
        assert_eq!(status.index_policy, "rebuild");
    }

    #[tokio::test]
    async fn test_recognize_rejects_bad_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        for payload in [
            Bytes::from_static(b"not json"),
            Bytes::from_static(b"{}"),
            body("data:image/png;base64,@@@"),
            body("data:image/png;base64,aGVsbG8="),
        ] {
            let result = recognize(State(state.clone()), payload).await;
            assert!(matches!(result, Err(ApiError::BadRequest(_))));
        }
    }

    #[tokio::test]
    async fn test_upload_requires_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let response = post_upload(&state, &[("name", None, b"Alice")]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = post_upload(&state, &[("name", None, b"Alice"), ("file", Some("a.png"), b"")]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(std::fs::read_dir(&state.config.faces_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_non_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let response = post_upload(
            &state,
            &[("name", None, b"Alice"), ("file", Some("a.png"), b"not an image")],
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!state.config.faces_dir.join("Alice.jpg").exists());
    }

    #[tokio::test]
    async fn test_uploaded_face_is_recognized_with_cached_index() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_policy(dir.path(), IndexPolicy::OnChange);

        let Json(before) = recognize(State(state.clone()), body(&data_url([10, 20, 30])))
            .await
            .unwrap();
        assert_eq!(before.outcome, "no_match");

        let image = png([10, 20, 30]);
        let response = post_upload(
            &state,
            &[("name", None, b"Alice Smith"), ("file", Some("alice.png"), &image)],
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.config.faces_dir.join("Alice_Smith.jpg").is_file());

        let Json(after) = recognize(State(state.clone()), body(&data_url([10, 20, 30])))
            .await
            .unwrap();
        assert_eq!(after.outcome, "checked_in");
        assert!(after.message.starts_with("Welcome Alice_Smith"));
    }
}
