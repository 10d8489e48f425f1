//! External collaborators: browser automation, blob storage and diff
//! computation. This crate only moves opaque image refs between them.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use pagewatch_core::model::{DiffMetrics, Viewport};

use crate::jobs::CapturePayload;

/// Typed collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Collaborator unreachable or answering 5xx.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// Collaborator rejected the request as malformed.
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("blob storage error: {0}")]
    Storage(String),
}

impl CaptureError {
    /// Transient errors are retried; permanent ones fail the job at once.
    pub fn is_transient(&self) -> bool {
        match self {
            CaptureError::Timeout(_)
            | CaptureError::Navigation(_)
            | CaptureError::Unavailable(_)
            | CaptureError::Storage(_) => true,
            CaptureError::InvalidSelector(_) | CaptureError::InvalidUrl(_) | CaptureError::Rejected(_) => false,
        }
    }
}

/// What to capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSpec {
    pub url: String,
    pub selector: Option<String>,
    pub viewport: Option<Viewport>,
    #[serde(rename = "timeoutMs", serialize_with = "serialize_millis")]
    pub timeout: Duration,
}

impl CaptureSpec {
    pub fn from_payload(payload: &CapturePayload, timeout: Duration) -> Self {
        Self {
            url: payload.url.clone(),
            selector: payload.selector.clone(),
            viewport: payload.viewport,
            timeout,
        }
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
}

#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Render the page and return encoded image bytes.
    async fn capture(&self, spec: &CaptureSpec) -> Result<Vec<u8>, CaptureError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return an opaque ref.
    async fn put(&self, bytes: Vec<u8>) -> Result<String, CaptureError>;

    async fn get(&self, image_ref: &str) -> Result<Vec<u8>, CaptureError>;
}

#[async_trait]
pub trait DiffService: Send + Sync {
    async fn compare(&self, previous_ref: &str, current_ref: &str) -> Result<DiffMetrics, CaptureError>;
}

/// Process-local blob store for tests/dev. Its `mem://` refs mean nothing
/// to another process, so a remote diff service cannot resolve them.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, CaptureError> {
        let image_ref = format!("mem://{}", uuid::Uuid::now_v7());
        self.blobs
            .write()
            .map_err(|_| CaptureError::Storage("blob lock poisoned".to_string()))?
            .insert(image_ref.clone(), bytes);
        Ok(image_ref)
    }

    async fn get(&self, image_ref: &str) -> Result<Vec<u8>, CaptureError> {
        self.blobs
            .read()
            .map_err(|_| CaptureError::Storage("blob lock poisoned".to_string()))?
            .get(image_ref)
            .cloned()
            .ok_or_else(|| CaptureError::Storage(format!("unknown blob ref {image_ref}")))
    }
}

/// Blob store served over HTTP, shared with the diff service so both sides
/// resolve the same refs.
///
/// `POST {base}/blobs` takes raw bytes and answers `{"ref": ...}`;
/// `GET {base}/blobs/{ref}` answers with the bytes.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    http: Client,
    base: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct StoredBlob {
    #[serde(rename = "ref")]
    image_ref: String,
}

impl HttpBlobStore {
    pub fn new(base: Url, request_timeout: Duration) -> Result<Self, CaptureError> {
        if base.cannot_be_a_base() {
            return Err(CaptureError::Rejected(format!("blob store url {base} cannot be a base")));
        }
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .map_err(|e| CaptureError::Unavailable(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base,
            timeout: request_timeout,
        })
    }

    /// `{base}/blobs[/{ref}]`, with the ref kept as a single path segment.
    fn blob_url(&self, image_ref: Option<&str>) -> Result<Url, CaptureError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CaptureError::Rejected(format!("blob store url {} cannot be a base", self.base)))?;
            segments.pop_if_empty().push("blobs");
            if let Some(image_ref) = image_ref {
                segments.push(image_ref);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, CaptureError> {
        let response = self
            .http
            .post(self.blob_url(None)?)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| map_http_error(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(storage_error(RenderServiceClient::error_from_response(response, self.timeout).await));
        }
        let stored: StoredBlob = response
            .json()
            .await
            .map_err(|e| CaptureError::Storage(format!("malformed blob store response: {e}")))?;
        Ok(stored.image_ref)
    }

    async fn get(&self, image_ref: &str) -> Result<Vec<u8>, CaptureError> {
        let response = self
            .http
            .get(self.blob_url(Some(image_ref))?)
            .send()
            .await
            .map_err(|e| map_http_error(e, self.timeout))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CaptureError::Rejected(format!("unknown blob ref {image_ref}")));
        }
        if !response.status().is_success() {
            return Err(storage_error(RenderServiceClient::error_from_response(response, self.timeout).await));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_http_error(e, self.timeout))?;
        Ok(bytes.to_vec())
    }
}

/// Blob store outages stay retryable; rejections stay permanent.
fn storage_error(err: CaptureError) -> CaptureError {
    match err {
        CaptureError::Unavailable(reason) => CaptureError::Storage(reason),
        other => other,
    }
}

/// HTTP client for a render/diff service.
///
/// `POST {render}/render` takes a [`CaptureSpec`] and answers with image
/// bytes; `POST {diff}/compare` takes `{previousRef, currentRef}` and answers
/// with [`DiffMetrics`]. Errors come back as `{code, message}`.
#[derive(Debug, Clone)]
pub struct RenderServiceClient {
    http: Client,
    render_url: Option<Url>,
    diff_url: Option<Url>,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompareRequest<'a> {
    previous_ref: &'a str,
    current_ref: &'a str,
}

impl RenderServiceClient {
    pub fn new(render_url: Option<Url>, diff_url: Option<Url>, request_timeout: Duration) -> Result<Self, CaptureError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .map_err(|e| CaptureError::Unavailable(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            render_url,
            diff_url,
        })
    }

    fn endpoint(base: &Option<Url>, path: &str) -> Result<Url, CaptureError> {
        let base = base
            .as_ref()
            .ok_or_else(|| CaptureError::Unavailable("service url not configured".to_string()))?;
        base.join(path)
            .map_err(|e| CaptureError::Rejected(format!("bad service url: {e}")))
    }

    async fn error_from_response(response: reqwest::Response, timeout: Duration) -> CaptureError {
        let status = response.status();
        let body: ServiceErrorBody = response.json().await.unwrap_or(ServiceErrorBody {
            code: String::new(),
            message: status.to_string(),
        });
        match body.code.as_str() {
            "timeout" => CaptureError::Timeout(timeout),
            "navigation" => CaptureError::Navigation(body.message),
            "invalid_selector" => CaptureError::InvalidSelector(body.message),
            "invalid_url" => CaptureError::InvalidUrl(body.message),
            _ if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT => {
                CaptureError::Timeout(timeout)
            }
            _ if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                CaptureError::Unavailable(format!("{status}: {}", body.message))
            }
            _ => CaptureError::Rejected(format!("{status}: {}", body.message)),
        }
    }
}

fn map_http_error(error: reqwest::Error, timeout: Duration) -> CaptureError {
    if error.is_timeout() {
        CaptureError::Timeout(timeout)
    } else {
        CaptureError::Unavailable(error.to_string())
    }
}

#[async_trait]
impl BrowserEngine for RenderServiceClient {
    async fn capture(&self, spec: &CaptureSpec) -> Result<Vec<u8>, CaptureError> {
        let url = Self::endpoint(&self.render_url, "render")?;
        let response = self
            .http
            .post(url)
            .timeout(spec.timeout)
            .json(spec)
            .send()
            .await
            .map_err(|e| map_http_error(e, spec.timeout))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, spec.timeout).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_http_error(e, spec.timeout))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl DiffService for RenderServiceClient {
    async fn compare(&self, previous_ref: &str, current_ref: &str) -> Result<DiffMetrics, CaptureError> {
        let url = Self::endpoint(&self.diff_url, "compare")?;
        let timeout = Duration::from_secs(60);
        let response = self
            .http
            .post(url)
            .json(&CompareRequest {
                previous_ref,
                current_ref,
            })
            .send()
            .await
            .map_err(|e| map_http_error(e, timeout))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, timeout).await);
        }
        response
            .json::<DiffMetrics>()
            .await
            .map_err(|e| CaptureError::Unavailable(format!("malformed diff response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(CaptureError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(CaptureError::Navigation("net::ERR".into()).is_transient());
        assert!(!CaptureError::InvalidSelector("#nope".into()).is_transient());
        assert!(!CaptureError::InvalidUrl("x".into()).is_transient());
    }

    #[tokio::test]
    async fn memory_blobs_round_trip_by_ref() {
        let store = MemoryBlobStore::new();
        let a = store.put(vec![1, 2, 3]).await.unwrap();
        let b = store.put(vec![1, 2, 3]).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.get(&a).await.unwrap(), vec![1, 2, 3]);
        assert!(store.get("mem://missing").await.is_err());
    }

    #[test]
    fn capture_spec_serializes_timeout_in_millis() {
        let spec = CaptureSpec {
            url: "https://example.com/".to_string(),
            selector: Some("#hero".to_string()),
            viewport: None,
            timeout: Duration::from_secs(30),
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["timeoutMs"], 30_000);
        assert_eq!(value["selector"], "#hero");
    }

    #[test]
    fn blob_refs_stay_one_path_segment() {
        let store = HttpBlobStore::new(Url::parse("http://blobs.internal/v1/").unwrap(), Duration::from_secs(5)).unwrap();
        assert_eq!(store.blob_url(None).unwrap().as_str(), "http://blobs.internal/v1/blobs");
        assert_eq!(
            store.blob_url(Some("2026/10/a b")).unwrap().as_str(),
            "http://blobs.internal/v1/blobs/2026%2F10%2Fa%20b"
        );

        assert!(HttpBlobStore::new(Url::parse("mailto:ops@example.com").unwrap(), Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn unreachable_blob_store_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = HttpBlobStore::new(Url::parse(&format!("http://{addr}/")).unwrap(), Duration::from_secs(2)).unwrap();
        let err = store.put(vec![1, 2, 3]).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    async fn unconfigured_service_is_unavailable() {
        let client = RenderServiceClient::new(None, None, Duration::from_secs(5)).unwrap();
        let err = client.compare("a", "b").await.unwrap_err();
        assert!(matches!(err, CaptureError::Unavailable(_)));
    }
}
