//! # API REST
//!
//! REST API implementation for pvfll.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON bodies, status codes, CORS, Server-Sent Events)
//!
//! Uses `api-shared` for request/response types and `pvfll-core` for every box operation.

#![warn(rust_2018_idioms)]

mod error;

pub use error::{ApiError, ApiResult};

use api_shared::{
    BoxStatusRes, DeviceHealthRes, DownloadUrlRes, ErrorRes, GardenBox, GardenRes, HealthRes,
    HealthService, HeartbeatReq, LegacyPresignReq, PresignRes, PresignUploadReq, SuccessRes,
    TriggerEventReq, UploadRes,
};
use axum::{
    body::{Body, Bytes},
    extract::{
        rejection::{BytesRejection, JsonRejection},
        DefaultBodyLimit, Path, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use pvfll_core::constants::FALLBACK_MEDIA_TYPE;
use pvfll_core::{
    BoxNumber, BoxResult, BroadcastNotifier, CoreConfig, DeviceId, EventKind, FileName, Garden,
    GardenEvent, Heartbeat,
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Characters left unescaped in an RFC 5987 `filename*` value.
const ATTR_CHARS: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Application state shared across REST API handlers.
///
/// Holds the garden for box operations and the broadcast hub the SSE endpoint subscribes to.
#[derive(Clone)]
pub struct AppState {
    garden: Garden,
    hub: BroadcastNotifier,
}

impl AppState {
    pub fn new(garden: Garden, hub: BroadcastNotifier) -> Self {
        Self { garden, hub }
    }

    /// Build the garden described by `cfg`, with a fresh broadcast hub for SSE subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured object store cannot be built.
    pub fn from_config(cfg: Arc<CoreConfig>) -> BoxResult<Self> {
        let hub = BroadcastNotifier::new();
        let garden = Garden::from_config(cfg, hub.clone())?;
        Ok(Self::new(garden, hub))
    }

    pub fn garden(&self) -> &Garden {
        &self.garden
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        garden,
        box_status,
        presign_upload,
        presign_legacy,
        upload_file,
        download_file,
        download_url,
        trigger_event,
        events,
        record_heartbeat,
        list_devices,
    ),
    components(schemas(
        HealthRes,
        ErrorRes,
        SuccessRes,
        BoxStatusRes,
        GardenBox,
        GardenRes,
        PresignUploadReq,
        LegacyPresignReq,
        PresignRes,
        DownloadUrlRes,
        UploadRes,
        TriggerEventReq,
        HeartbeatReq,
        DeviceHealthRes,
    ))
)]
pub struct ApiDoc;

/// Build the REST router with CORS, the body size limit and Swagger UI applied.
pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.garden.config().max_file_size()).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health))
        .route("/api/garden", get(garden))
        .route("/api/files", post(presign_legacy))
        .route("/api/boxes/:box/files", get(box_status).post(presign_upload))
        .route(
            "/api/boxes/:box/files/:file",
            get(download_file).put(upload_file),
        )
        .route("/api/boxes/:box/files/:file/url", get(download_url))
        .route("/api/boxes/:box/events", post(trigger_event))
        .route("/api/events", get(events))
        .route(
            "/api/devices/health",
            get(list_devices).post(record_heartbeat),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn parse_box(raw: &str) -> ApiResult<BoxNumber> {
    Ok(raw.parse::<BoxNumber>()?)
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn upload_fields(
    file_name: Option<String>,
    file_type: Option<String>,
) -> ApiResult<(FileName, String)> {
    match (present(file_name), present(file_type)) {
        (Some(name), Some(file_type)) => Ok((FileName::new(name)?, file_type)),
        _ => Err(ApiError::bad_request(
            "Missing required fields: fileName, fileType",
        )),
    }
}

/// `Content-Disposition` for a download, with an ASCII fallback and the exact UTF-8 name.
fn attachment(file_name: &FileName) -> HeaderValue {
    let fallback: String = file_name
        .as_str()
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(file_name.as_str(), ATTR_CHARS);

    HeaderValue::from_str(&format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// Used for monitoring and load balancer health checks.
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthService::check_health())
}

#[utoipa::path(
    get,
    path = "/api/garden",
    responses(
        (status = 200, description = "Status of every box", body = GardenRes),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// Report all four boxes at once.
#[axum::debug_handler]
async fn garden(State(state): State<AppState>) -> ApiResult<Json<GardenRes>> {
    let boxes = state
        .garden
        .garden()
        .await?
        .into_iter()
        .map(|(box_number, status)| GardenBox::new(box_number, status))
        .collect();
    Ok(Json(GardenRes { boxes }))
}

#[utoipa::path(
    get,
    path = "/api/boxes/{box}/files",
    params(("box" = u8, Path, description = "Box number, 1 to 4")),
    responses(
        (status = 200, description = "What the box holds", body = BoxStatusRes),
        (status = 400, description = "Invalid box number", body = ErrorRes),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// Report whether a box is empty, and what it holds if not.
#[axum::debug_handler]
async fn box_status(
    State(state): State<AppState>,
    Path(raw_box): Path<String>,
) -> ApiResult<Json<BoxStatusRes>> {
    let box_number = parse_box(&raw_box)?;
    let status = state.garden.status(box_number).await?;
    Ok(Json(status.into()))
}

#[utoipa::path(
    post,
    path = "/api/boxes/{box}/files",
    params(("box" = u8, Path, description = "Box number, 1 to 4")),
    request_body = PresignUploadReq,
    responses(
        (status = 200, description = "Presigned upload", body = PresignRes),
        (status = 400, description = "Missing or invalid fields", body = ErrorRes),
        (status = 409, description = "Box already holds a file", body = ErrorRes),
        (status = 501, description = "Store cannot presign", body = ErrorRes)
    )
)]
/// Hand out a presigned upload for an empty box.
///
/// The client uploads straight to the object store; peers are told through
/// `POST /api/boxes/{box}/events` once it is done.
#[axum::debug_handler]
async fn presign_upload(
    State(state): State<AppState>,
    Path(raw_box): Path<String>,
    payload: Result<Json<PresignUploadReq>, JsonRejection>,
) -> ApiResult<Json<PresignRes>> {
    let Json(req) = payload?;
    let box_number = parse_box(&raw_box)?;
    let (file_name, file_type) = upload_fields(req.file_name, req.file_type)?;

    let presigned = state
        .garden
        .presign_upload(box_number, &file_name, &file_type)
        .await?;
    Ok(Json(presigned.into()))
}

#[utoipa::path(
    post,
    path = "/api/files",
    request_body = LegacyPresignReq,
    responses(
        (status = 200, description = "Presigned upload", body = PresignRes),
        (status = 400, description = "Missing or invalid fields", body = ErrorRes),
        (status = 409, description = "Box already holds a file", body = ErrorRes),
        (status = 501, description = "Store cannot presign", body = ErrorRes)
    )
)]
/// Same as `POST /api/boxes/{box}/files`, with the box number in the body.
#[axum::debug_handler]
async fn presign_legacy(
    State(state): State<AppState>,
    payload: Result<Json<LegacyPresignReq>, JsonRejection>,
) -> ApiResult<Json<PresignRes>> {
    let Json(req) = payload?;
    let missing = || ApiError::bad_request("Missing required fields: boxNumber, fileName, fileType");

    let box_number: BoxNumber = match req.box_number {
        None | Some(serde_json::Value::Null) => return Err(missing()),
        Some(raw) => {
            serde_json::from_value(raw).map_err(|e| ApiError::bad_request(e.to_string()))?
        }
    };
    let (file_name, file_type) =
        upload_fields(req.file_name, req.file_type).map_err(|_| missing())?;

    let presigned = state
        .garden
        .presign_upload(box_number, &file_name, &file_type)
        .await?;
    Ok(Json(presigned.into()))
}

#[utoipa::path(
    put,
    path = "/api/boxes/{box}/files/{file}",
    params(
        ("box" = u8, Path, description = "Box number, 1 to 4"),
        ("file" = String, Path, description = "File name")
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "File stored", body = UploadRes),
        (status = 400, description = "Invalid box number or file name", body = ErrorRes),
        (status = 409, description = "Box already holds a file", body = ErrorRes),
        (status = 413, description = "File too large", body = ErrorRes)
    )
)]
/// Store the request body in an empty box and publish `file-uploaded`.
#[axum::debug_handler]
async fn upload_file(
    State(state): State<AppState>,
    Path((raw_box, raw_file)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<(StatusCode, Json<UploadRes>)> {
    let box_number = parse_box(&raw_box)?;
    let file_name = FileName::new(raw_file)?;
    let body = body?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    let stored = state
        .garden
        .offer(box_number, &file_name, content_type, body)
        .await?;
    Ok((StatusCode::CREATED, Json(stored.into())))
}

#[utoipa::path(
    get,
    path = "/api/boxes/{box}/files/{file}",
    params(
        ("box" = u8, Path, description = "Box number, 1 to 4"),
        ("file" = String, Path, description = "File name")
    ),
    responses(
        (status = 200, description = "File contents; the box is emptied once fully sent", body = String, content_type = "application/octet-stream"),
        (status = 400, description = "Invalid box number or file name", body = ErrorRes),
        (status = 404, description = "No such file", body = ErrorRes)
    )
)]
/// Stream a file to the receiver, then empty the box and publish `file-deleted`.
///
/// The box is only emptied when the whole body was handed over; a receiver that hangs up
/// early leaves the file in place.
#[axum::debug_handler]
async fn download_file(
    State(state): State<AppState>,
    Path((raw_box, raw_file)): Path<(String, String)>,
) -> ApiResult<Response> {
    let box_number = parse_box(&raw_box)?;
    let file_name = FileName::new(raw_file)?;

    let stream = state.garden.receive(box_number, &file_name).await?;
    let content_type = stream
        .media_type()
        .and_then(|t| HeaderValue::from_str(t).ok())
        .unwrap_or_else(|| HeaderValue::from_static(FALLBACK_MEDIA_TYPE));
    let headers = [
        (header::CONTENT_TYPE, content_type),
        (header::CONTENT_LENGTH, HeaderValue::from(stream.size())),
        (header::CONTENT_DISPOSITION, attachment(&file_name)),
    ];

    Ok((headers, Body::from_stream(stream)).into_response())
}

#[utoipa::path(
    get,
    path = "/api/boxes/{box}/files/{file}/url",
    params(
        ("box" = u8, Path, description = "Box number, 1 to 4"),
        ("file" = String, Path, description = "File name")
    ),
    responses(
        (status = 200, description = "Presigned download URL", body = DownloadUrlRes),
        (status = 400, description = "Invalid box number or file name", body = ErrorRes),
        (status = 501, description = "Store cannot presign", body = ErrorRes)
    )
)]
/// Presigned download URL. Does not empty the box.
#[axum::debug_handler]
async fn download_url(
    State(state): State<AppState>,
    Path((raw_box, raw_file)): Path<(String, String)>,
) -> ApiResult<Json<DownloadUrlRes>> {
    let box_number = parse_box(&raw_box)?;
    let file_name = FileName::new(raw_file)?;

    let presigned = state.garden.presign_download(box_number, &file_name).await?;
    Ok(Json(DownloadUrlRes { url: presigned.url }))
}

#[utoipa::path(
    post,
    path = "/api/boxes/{box}/events",
    params(("box" = u8, Path, description = "Box number, 1 to 4")),
    request_body = TriggerEventReq,
    responses(
        (status = 200, description = "Event published", body = SuccessRes),
        (status = 400, description = "Missing or unknown event type", body = ErrorRes),
        (status = 500, description = "Publishing failed", body = ErrorRes)
    )
)]
/// Publish a garden event on behalf of a client, typically after a presigned upload.
#[axum::debug_handler]
async fn trigger_event(
    State(state): State<AppState>,
    Path(raw_box): Path<String>,
    payload: Result<Json<TriggerEventReq>, JsonRejection>,
) -> ApiResult<Json<SuccessRes>> {
    let Json(req) = payload?;
    let box_number = parse_box(&raw_box)?;
    let kind: EventKind = present(req.kind)
        .ok_or_else(|| ApiError::bad_request("Event type is required"))?
        .parse()?;

    let event = GardenEvent {
        kind,
        box_number,
        file_name: req.file_name,
        file_size: req.file_size,
    };
    state.garden.publish(&event).await?;

    tracing::info!(box_number = %box_number, event = %kind, "event triggered");
    Ok(Json(SuccessRes::ok()))
}

/// Every published garden event as an SSE event named after its kind.
fn event_stream(hub: &BroadcastNotifier) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(hub.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(published) => {
                    let event = Event::default()
                        .event(published.event.kind.as_str())
                        .data(published.event.payload().to_string());
                    return Some((Ok(event), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagging");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

#[utoipa::path(
    get,
    path = "/api/events",
    responses(
        (status = 200, description = "Server-Sent Events stream of garden events", body = String, content_type = "text/event-stream")
    )
)]
/// Subscribe to garden events.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(&state.hub)).keep_alive(KeepAlive::default())
}

#[utoipa::path(
    post,
    path = "/api/devices/health",
    request_body = HeartbeatReq,
    responses(
        (status = 200, description = "Heartbeat stored", body = SuccessRes),
        (status = 400, description = "Missing or invalid fields", body = ErrorRes),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// Store a device heartbeat.
#[axum::debug_handler]
async fn record_heartbeat(
    State(state): State<AppState>,
    payload: Result<Json<HeartbeatReq>, JsonRejection>,
) -> ApiResult<Json<SuccessRes>> {
    let Json(req) = payload?;
    let (Some(device_id), Some(connected), Some(timestamp)) =
        (present(req.device_id), req.connected, present(req.timestamp))
    else {
        return Err(ApiError::bad_request(
            "Missing required fields: deviceId, connected, timestamp",
        ));
    };

    let heartbeat = Heartbeat {
        device_id: DeviceId::new(device_id)?,
        connected,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| ApiError::bad_request(format!("invalid timestamp: {e}")))?
            .with_timezone(&Utc),
    };
    state.garden.record_heartbeat(&heartbeat).await?;

    Ok(Json(SuccessRes::ok()))
}

#[utoipa::path(
    get,
    path = "/api/devices/health",
    responses(
        (status = 200, description = "Every reported device", body = [DeviceHealthRes]),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// List device health, flagging devices silent for more than ten minutes as stale.
#[axum::debug_handler]
async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Vec<DeviceHealthRes>>> {
    let devices = state.garden.devices(Utc::now()).await?;
    Ok(Json(devices.into_iter().map(Into::into).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use pvfll_core::{Published, StoreConfig};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn app_with(cfg: CoreConfig) -> (Router, BroadcastNotifier) {
        let state = AppState::from_config(Arc::new(cfg)).unwrap();
        let hub = state.hub.clone();
        (router(state), hub)
    }

    fn app() -> (Router, BroadcastNotifier) {
        app_with(CoreConfig::in_memory())
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    async fn send_json(app: &Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::get(uri).body(Body::empty()).unwrap();
        let (status, _, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn put_file(app: &Router, uri: &str, content: &'static [u8]) -> (StatusCode, Value) {
        let req = Request::put(uri)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(content))
            .unwrap();
        let (status, _, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn next_event(rx: &mut broadcast::Receiver<Published>) -> Published {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event published")
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_alive() {
        let (app, _) = app();
        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true, "message": "pvfll is alive"}));
    }

    #[tokio::test]
    async fn garden_starts_empty() {
        let (app, _) = app();
        let (status, body) = get_json(&app, "/api/garden").await;
        assert_eq!(status, StatusCode::OK);

        let boxes = body["boxes"].as_array().unwrap();
        assert_eq!(boxes.len(), 4);
        assert_eq!(boxes[0], json!({"boxNumber": 1, "empty": true, "label": "box1: empty"}));
    }

    #[tokio::test]
    async fn box_number_out_of_range_is_rejected() {
        let (app, _) = app();
        for uri in ["/api/boxes/0/files", "/api/boxes/5/files", "/api/boxes/x/files"] {
            let (status, body) = get_json(&app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].as_str().unwrap().contains("invalid box number"));
        }
    }

    #[tokio::test]
    async fn upload_fills_box_and_notifies() {
        let (app, hub) = app();
        let mut rx = hub.subscribe();

        let (status, body) = put_file(&app, "/api/boxes/2/files/notes.txt", b"hello").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            body,
            json!({"key": "box2/notes.txt", "name": "notes.txt", "size": 5, "mediaType": "text/plain"})
        );

        let published = next_event(&mut rx).await;
        assert_eq!(published.event.kind, EventKind::FileUploaded);
        assert_eq!(
            published.event.payload(),
            json!({"boxNumber": "2", "fileName": "notes.txt", "fileSize": 5})
        );

        let (_, body) = get_json(&app, "/api/boxes/2/files").await;
        assert_eq!(body, json!({"empty": false, "name": "notes.txt", "size": 5}));
    }

    #[tokio::test]
    async fn occupied_box_rejects_second_upload() {
        let (app, _) = app();
        put_file(&app, "/api/boxes/1/files/a.txt", b"a").await;

        let (status, body) = put_file(&app, "/api/boxes/1/files/b.txt", b"b").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("a.txt"));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let cfg = CoreConfig::new(
            StoreConfig::Memory,
            "garden".into(),
            4,
            Duration::from_secs(60),
            Duration::from_secs(5),
            None,
        )
        .unwrap();
        let (app, _) = app_with(cfg);

        let req = Request::put("/api/boxes/1/files/big.bin")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (_, body) = get_json(&app, "/api/boxes/1/files").await;
        assert_eq!(body, json!({"empty": true}));
    }

    #[tokio::test]
    async fn download_streams_then_empties_box() {
        let (app, hub) = app();
        put_file(&app, "/api/boxes/3/files/gift.txt", b"a gift").await;
        let mut rx = hub.subscribe();

        let req = Request::get("/api/boxes/3/files/gift.txt")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"a gift");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::CONTENT_LENGTH], "6");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"gift.txt\"; filename*=UTF-8''gift.txt"
        );

        let published = next_event(&mut rx).await;
        assert_eq!(published.event.kind, EventKind::FileDeleted);
        assert_eq!(published.event.file_size, Some(6));

        let (_, body) = get_json(&app, "/api/boxes/3/files").await;
        assert_eq!(body, json!({"empty": true}));
    }

    #[tokio::test]
    async fn download_over_a_real_connection_empties_box() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (app, hub) = app();
        put_file(&app, "/api/boxes/3/files/gift.txt", b"a gift").await;
        let mut rx = hub.subscribe();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = app.clone();
        tokio::spawn(async move { axum::serve(listener, served).await });

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(
            b"GET /api/boxes/3/files/gift.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
        let mut raw = Vec::new();
        conn.read_to_end(&mut raw).await.unwrap();
        let raw = String::from_utf8(raw).unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        assert!(raw.ends_with("\r\n\r\na gift"));

        let published = next_event(&mut rx).await;
        assert_eq!(published.event.kind, EventKind::FileDeleted);
        let (_, body) = get_json(&app, "/api/boxes/3/files").await;
        assert_eq!(body, json!({"empty": true}));
    }

    #[tokio::test]
    async fn download_of_missing_file_is_not_found() {
        let (app, _) = app();
        let (status, body) = get_json(&app, "/api/boxes/1/files/nothing.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn presign_requires_fields() {
        let (app, _) = app();
        let (status, body) =
            send_json(&app, Method::POST, "/api/boxes/1/files", json!({"fileName": "a.txt"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields: fileName, fileType");
    }

    #[tokio::test]
    async fn presign_without_signer_is_not_implemented() {
        let (app, _) = app();
        let req = json!({"fileName": "a.txt", "fileType": "text/plain"});
        let (status, _) = send_json(&app, Method::POST, "/api/boxes/1/files", req).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

        let (status, _) = get_json(&app, "/api/boxes/1/files/a.txt/url").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn presign_into_occupied_box_conflicts() {
        let (app, _) = app();
        put_file(&app, "/api/boxes/4/files/a.txt", b"a").await;

        let req = json!({"fileName": "b.txt", "fileType": "text/plain"});
        let (status, _) = send_json(&app, Method::POST, "/api/boxes/4/files", req).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn legacy_presign_validates_box_number() {
        let (app, _) = app();

        let req = json!({"boxNumber": "7", "fileName": "a.txt", "fileType": "text/plain"});
        let (status, _) = send_json(&app, Method::POST, "/api/files", req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = json!({"fileName": "a.txt", "fileType": "text/plain"});
        let (status, body) = send_json(&app, Method::POST, "/api/files", req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields: boxNumber, fileName, fileType");

        let req = json!({"boxNumber": "2", "fileName": "a.txt", "fileType": "text/plain"});
        let (status, _) = send_json(&app, Method::POST, "/api/files", req).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn trigger_event_publishes() {
        let (app, hub) = app();
        let mut rx = hub.subscribe();

        let req = json!({"type": "file-uploaded", "fileName": "x.png", "fileSize": 10});
        let (status, body) = send_json(&app, Method::POST, "/api/boxes/2/events", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let published = next_event(&mut rx).await;
        assert_eq!(published.channel, "garden");
        assert_eq!(published.event.kind, EventKind::FileUploaded);
        assert_eq!(published.event.file_name.as_deref(), Some("x.png"));
    }

    #[tokio::test]
    async fn trigger_event_requires_known_type() {
        let (app, _) = app();

        let (status, body) = send_json(&app, Method::POST, "/api/boxes/2/events", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Event type is required");

        let req = json!({"type": "file-exploded"});
        let (status, _) = send_json(&app, Method::POST, "/api/boxes/2/events", req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn events_endpoint_is_an_event_stream() {
        let (app, _) = app();
        let res = app
            .oneshot(Request::get("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/event-stream");
    }

    #[tokio::test]
    async fn heartbeats_round_trip() {
        let (app, _) = app();

        let (status, body) =
            send_json(&app, Method::POST, "/api/devices/health", json!({"deviceId": "pi"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields: deviceId, connected, timestamp");

        let now = Utc::now().to_rfc3339();
        let req = json!({"deviceId": "pi-kitchen", "connected": true, "timestamp": now});
        let (status, body) = send_json(&app, Method::POST, "/api/devices/health", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let (status, body) = get_json(&app, "/api/devices/health").await;
        assert_eq!(status, StatusCode::OK);
        let devices = body.as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["deviceId"], "pi-kitchen");
        assert_eq!(devices[0]["stale"], false);
        assert_eq!(devices[0]["state"], "Connected");
    }

    #[tokio::test]
    async fn heartbeat_rejects_bad_device_id() {
        let (app, _) = app();
        let req = json!({"deviceId": "../etc", "connected": true, "timestamp": Utc::now().to_rfc3339()});
        let (status, _) = send_json(&app, Method::POST, "/api/devices/health", req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn attachment_escapes_non_ascii_names() {
        let value = attachment(&FileName::new("résumé \"v2\".pdf").unwrap());
        assert_eq!(
            value,
            "attachment; filename=\"r_sum_ _v2_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9%20%22v2%22.pdf"
        );
    }
}
