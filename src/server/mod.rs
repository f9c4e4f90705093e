//! HTTP Server
//!
//! Routes:
//!
//! | Method | Path       | Handler                                |
//! |--------|------------|----------------------------------------|
//! | GET    | `/`        | liveness banner                        |
//! | GET    | `/image`   | `?src={id}&w={width}&q={quality}`      |
//! | POST   | `/upload`  | multipart, raw, JSON envelope, archive |
//! | GET    | `/list`    | every `(id, filePath)` pair            |
//! | GET    | `/healthz` | `ok` once the metadata store answers   |
//! | GET    | `/metrics` | Prometheus text exposition             |

pub mod upload;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::imaging::{TransformParams, DEFAULT_QUALITY, DEFAULT_WIDTH, OUTPUT_CONTENT_TYPE};
use crate::ingest::{IngestPipeline, IngestReport};
use crate::metadata::MetadataStore;
use crate::serving::ImageService;

/// Banner returned on `GET /`
pub const BANNER: &str = "Image Processor API is running.";

/// Default `Cache-Control` max-age for served variants (30 days)
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default upload body ceiling (1 GiB)
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 1024 * 1024 * 1024;

type HttpResponse = Response<Full<Bytes>>;

/// HTTP-facing settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cache_max_age: Duration,
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

/// Everything a request handler needs
pub struct AppState {
    images: ImageService,
    ingest: IngestPipeline,
    metadata: MetadataStore,
    max_upload_size: usize,
    cache_control: HeaderValue,
}

impl AppState {
    pub fn new(
        images: ImageService,
        ingest: IngestPipeline,
        metadata: MetadataStore,
        config: ServerConfig,
    ) -> Result<Self> {
        if config.max_upload_size == 0 {
            return Err(Error::Config("max upload size must be positive".to_string()));
        }
        let cache_control = HeaderValue::from_str(&format!(
            "public, max-age={}, immutable",
            config.cache_max_age.as_secs()
        ))
        .map_err(|e| Error::Config(format!("invalid Cache-Control value: {}", e)))?;

        Ok(Self {
            images,
            ingest,
            metadata,
            max_upload_size: config.max_upload_size,
            cache_control,
        })
    }

    pub fn images(&self) -> &ImageService {
        &self.images
    }
}

/// Accept connections until `cancel` fires
pub async fn serve(listener: TcpListener, state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    info!("Image server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Image server no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Image server accept error: {}", e);
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(route(&state, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

/// Dispatch one request
pub async fn route<B>(state: &AppState, req: Request<B>) -> HttpResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let (label, response) = match (&method, path.as_str()) {
        (&Method::GET, "/") => ("/", text(StatusCode::OK, BANNER)),
        (&Method::GET, "/image") => ("/image", handle_image(state, req.uri().query()).await),
        (&Method::POST, "/upload") => ("/upload", handle_upload(state, req).await),
        (&Method::GET, "/list") => ("/list", handle_list(state).await),
        (&Method::GET, "/healthz") => ("/healthz", handle_health(state).await),
        (&Method::GET, "/metrics") => ("/metrics", handle_metrics()),
        (_, "/" | "/image" | "/upload" | "/list" | "/healthz" | "/metrics") => (
            "method-not-allowed",
            text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
        ),
        _ => ("unknown", text(StatusCode::NOT_FOUND, "Not found")),
    };

    crate::metrics::HTTP_REQUESTS
        .with_label_values(&[label, response.status().as_str()])
        .inc();
    response
}

// =============================================================================
// Handlers
// =============================================================================

async fn handle_image(state: &AppState, query: Option<&str>) -> HttpResponse {
    let params = query_params(query);

    let Some(src) = params.get("src").filter(|s| !s.is_empty()) else {
        return text(StatusCode::BAD_REQUEST, "Missing src parameter");
    };
    let transform = match read_transform_params(&params) {
        Ok(transform) => transform,
        Err(e) => return text(e.status_code(), &e.to_string()),
    };

    match state.images.fetch(src, transform).await {
        Ok(served) => {
            debug!("Served {} from {}", src, served.served_from.as_str());
            let mut response = Response::new(Full::new(served.data));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(OUTPUT_CONTENT_TYPE));
            headers.insert(CACHE_CONTROL, state.cache_control.clone());
            response
        }
        Err(Error::NotFound(_)) => text(StatusCode::NOT_FOUND, "Image not found"),
        Err(e) if e.status_code().is_client_error() => text(e.status_code(), &e.to_string()),
        Err(e) => {
            error!("Error processing image {}: {}", src, e);
            text(e.status_code(), "Error processing image")
        }
    }
}

fn read_transform_params(params: &HashMap<String, String>) -> Result<TransformParams> {
    let width = match params.get("w") {
        Some(w) => w
            .parse::<u32>()
            .map_err(|_| Error::InvalidRequest(format!("width must be a positive integer, got {:?}", w)))?,
        None => DEFAULT_WIDTH,
    };
    let quality = match params.get("q") {
        Some(q) => q
            .parse::<u8>()
            .map_err(|_| Error::InvalidRequest(format!("quality must be 1..=100, got {:?}", q)))?,
        None => DEFAULT_QUALITY,
    };
    TransformParams::new(width, quality)
}

async fn handle_upload<B>(state: &AppState, req: Request<B>) -> HttpResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let request_id = IngestPipeline::new_request_id();

    match accept_upload(state, &request_id, req).await {
        Ok(report) => json_response(
            StatusCode::OK,
            json!({
                "message": "Files uploaded successfully",
                "requestId": request_id,
                "imageIds": report.image_ids,
                "rejected": report.rejected,
            }),
        ),
        Err(e) => {
            let status = e.status_code();
            let message = match &e {
                Error::EmptyBatch { .. } => "Invalid file uploaded".to_string(),
                Error::UnsupportedContentType(_) => "Unsupported Content-Type".to_string(),
                Error::InvalidUpload(reason) => reason.clone(),
                _ if status.is_server_error() => {
                    error!("Upload {} failed: {}", request_id, e);
                    "Error processing upload".to_string()
                }
                other => other.to_string(),
            };
            if status.is_client_error() {
                warn!("Upload {} rejected: {}", request_id, e);
            }
            json_response(status, json!({ "error": message, "requestId": request_id }))
        }
    }
}

async fn accept_upload<B>(state: &AppState, request_id: &str, req: Request<B>) -> Result<IngestReport>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let kind = upload::negotiate(req.headers())?;
    let body = read_body(req.into_body(), state.max_upload_size).await?;
    let items = upload::extract_items(kind, body, state.max_upload_size).await?;
    state.ingest.ingest(request_id, items).await
}

/// Buffer a body, failing once it passes `limit` bytes
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(Error::InvalidUpload(
            format!("Payload exceeds {} bytes", limit),
        )),
        Err(e) => Err(Error::InvalidUpload(format!("failed to read body: {}", e))),
    }
}

async fn handle_list(state: &AppState) -> HttpResponse {
    match state.metadata.list().await {
        Ok(records) => {
            let images: Vec<_> = records
                .iter()
                .map(|r| json!({ "id": r.id, "filePath": r.local_path.display().to_string() }))
                .collect();
            json_response(StatusCode::OK, json!({ "images": images }))
        }
        Err(e) => {
            error!("Listing images failed: {}", e);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Error listing images" }),
            )
        }
    }
}

async fn handle_health(state: &AppState) -> HttpResponse {
    match state.metadata.ping().await {
        Ok(()) => text(StatusCode::OK, "ok"),
        Err(e) => {
            warn!("Health check failed: {}", e);
            text(StatusCode::SERVICE_UNAVAILABLE, "metadata store unavailable")
        }
    }
}

fn handle_metrics() -> HttpResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("{}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn text(status: StatusCode, body: &str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::copy_from_slice(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode, body: serde_json::Value) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Decode `a=1&b=2` into a map; later duplicates win
fn query_params(query: Option<&str>) -> HashMap<String, String> {
    let decode = |s: &str| {
        let s = s.replace('+', " ");
        urlencoding::decode(&s)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| s.clone())
    };

    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_query_params_decoding() {
        let params = query_params(Some("src=abc%2D1&w=400&q=80&flag"));
        assert_eq!(params.get("src").map(String::as_str), Some("abc-1"));
        assert_eq!(params.get("w").map(String::as_str), Some("400"));
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
        assert!(query_params(None).is_empty());
    }

    #[test]
    fn test_transform_params_defaults_and_validation() {
        let params = read_transform_params(&HashMap::new()).unwrap();
        assert_eq!(params.width, DEFAULT_WIDTH);
        assert_eq!(params.quality, DEFAULT_QUALITY);

        let params = query_params(Some("w=abc"));
        assert_matches!(read_transform_params(&params), Err(Error::InvalidRequest(_)));

        let params = query_params(Some("w=400&q=0"));
        assert_matches!(read_transform_params(&params), Err(Error::InvalidRequest(_)));

        let params = query_params(Some("w=400&q=101"));
        assert_matches!(read_transform_params(&params), Err(Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let body = Full::new(Bytes::from_static(b"0123456789"));
        assert_matches!(read_body(body, 4).await, Err(Error::InvalidUpload(_)));

        let body = Full::new(Bytes::from_static(b"0123"));
        assert_eq!(read_body(body, 4).await.unwrap().as_ref(), b"0123");
    }
}
