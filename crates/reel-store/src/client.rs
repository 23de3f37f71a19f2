//! Firestore REST API client.
//!
//! Only the document operations the job store needs: get, upsert and delete
//! by ID. Requests carry a tracing span and request metrics, and transient
//! failures go through [`with_retry`]. When an emulator host is configured
//! the client talks plain HTTP and skips authentication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, info_span, Instrument};

use crate::error::{StoreError, StoreResult};
use crate::metrics::record_request;
use crate::retry::{with_retry, RetryConfig};
use crate::token_cache::TokenCache;
use crate::types::Document;

// =============================================================================
// Configuration
// =============================================================================

/// Which persistence backend the service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    /// Process-local map, for development and tests
    Memory,
}

impl StoreBackend {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "inmemory" | "in-memory" => StoreBackend::Memory,
            _ => StoreBackend::Firestore,
        }
    }
}

/// Store client configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// Emulator `host:port`; disables auth when set
    pub emulator_host: Option<String>,
    /// Collection holding job records
    pub collection: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            project_id: "local".to_string(),
            database_id: "(default)".to_string(),
            emulator_host: None,
            collection: "reel_jobs".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        let backend = std::env::var("STORE_BACKEND")
            .map(|s| StoreBackend::parse(&s))
            .unwrap_or(StoreBackend::Firestore);

        let project_id = std::env::var("STORE_PROJECT_ID")
            .or_else(|_| std::env::var("GCP_PROJECT_ID"))
            .ok()
            .filter(|s| !s.is_empty());

        let project_id = match (backend, project_id) {
            (_, Some(id)) => id,
            (StoreBackend::Memory, None) => "local".to_string(),
            (StoreBackend::Firestore, None) => {
                return Err(StoreError::config(
                    "STORE_PROJECT_ID or GCP_PROJECT_ID must be set for the Firestore backend",
                ))
            }
        };

        let emulator_host = std::env::var("STORE_EMULATOR_HOST")
            .or_else(|_| std::env::var("FIRESTORE_EMULATOR_HOST"))
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            backend,
            project_id,
            database_id: std::env::var("STORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            emulator_host,
            collection: std::env::var("STORE_COLLECTION")
                .unwrap_or_else(|_| "reel_jobs".to_string()),
            timeout: Duration::from_secs(
                std::env::var("STORE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            connect_timeout: Duration::from_secs(
                std::env::var("STORE_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            retry: RetryConfig::from_env(),
        })
    }

    fn base_url(&self) -> String {
        let root = match &self.emulator_host {
            Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
                host.trim_end_matches('/').to_string()
            }
            Some(host) => format!("http://{}", host),
            None => "https://firestore.googleapis.com".to_string(),
        };
        format!(
            "{}/v1/projects/{}/databases/{}/documents",
            root, self.project_id, self.database_id
        )
    }
}

// =============================================================================
// Client
// =============================================================================

/// Firestore REST API client.
#[derive(Clone)]
pub struct StoreClient {
    http: Client,
    config: StoreConfig,
    base_url: String,
    /// `None` in emulator mode
    token_cache: Option<Arc<TokenCache>>,
    closed: Arc<AtomicBool>,
}

impl StoreClient {
    /// Create a new client.
    pub async fn new(config: StoreConfig) -> StoreResult<Self> {
        let token_cache = match config.emulator_host {
            Some(ref host) => {
                info!(emulator = %host, "Store client using emulator, authentication disabled");
                None
            }
            None => Some(Arc::new(TokenCache::new(Self::create_auth_provider().await?))),
        };

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("reel-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(StoreError::Network)?;

        let base_url = config.base_url();

        Ok(Self {
            http,
            config,
            base_url,
            token_cache,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Service account file first, then the ambient provider chain
    /// (metadata server, gcloud).
    async fn create_auth_provider() -> StoreResult<Arc<dyn TokenProvider>> {
        let service_account = CustomServiceAccount::from_env()
            .map_err(|e| StoreError::auth_error(format!("Failed to load service account: {}", e)))?;

        match service_account {
            Some(sa) => Ok(Arc::new(sa)),
            None => gcp_auth::provider()
                .await
                .map_err(|e| StoreError::auth_error(format!("No GCP credentials available: {}", e))),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    fn document_path(&self, collection: &str, doc_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        )
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    async fn authorize(&self, request: RequestBuilder) -> StoreResult<RequestBuilder> {
        match &self.token_cache {
            Some(cache) => Ok(request.bearer_auth(cache.get_token().await?)),
            None => Ok(request.bearer_auth("owner")),
        }
    }

    /// Send a request, refreshing the token once on an expired-token 401.
    async fn send<B>(&self, url: &str, build: B) -> StoreResult<Response>
    where
        B: Fn(&Client) -> RequestBuilder,
    {
        let response = self.authorize(build(&self.http)).await?.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match &self.token_cache {
            Some(cache) if Self::is_access_token_expired(&body) => {
                debug!("Access token rejected as expired, refreshing");
                cache.invalidate().await;
                Ok(self.authorize(build(&self.http)).await?.send().await?)
            }
            _ => Err(StoreError::from_http_status(
                StatusCode::UNAUTHORIZED.as_u16(),
                format!("{} failed: {}", url, body),
            )),
        }
    }

    // =========================================================================
    // Document operations
    // =========================================================================

    /// Get a document. Returns `None` when it does not exist.
    pub async fn get_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> StoreResult<Option<Document>> {
        self.ensure_open()?;
        let url = self.document_path(collection, doc_id);
        let url = url.as_str();

        with_retry(&self.config.retry, "get_document", || {
            self.execute_request("get_document", collection, Some(doc_id), async move {
                let response = self.send(url, |http| http.get(url)).await?;
                match response.status() {
                    StatusCode::OK => Ok(Some(response.json::<Document>().await?)),
                    StatusCode::NOT_FOUND => Ok(None),
                    status => Err(Self::handle_error_response(status, url, response).await),
                }
            })
        })
        .await
    }

    /// Create or fully replace a document.
    pub async fn upsert_document(
        &self,
        collection: &str,
        doc_id: &str,
        document: &Document,
    ) -> StoreResult<Document> {
        self.ensure_open()?;
        let url = self.document_path(collection, doc_id);
        let url = url.as_str();
        let body = Document {
            name: None,
            fields: document.fields.clone(),
            create_time: None,
            update_time: None,
        };
        let body = &body;

        with_retry(&self.config.retry, "upsert_document", || {
            self.execute_request("upsert_document", collection, Some(doc_id), async move {
                let response = self.send(url, |http| http.patch(url).json(body)).await?;
                match response.status() {
                    StatusCode::OK => Ok(response.json::<Document>().await?),
                    status => Err(Self::handle_error_response(status, url, response).await),
                }
            })
        })
        .await
    }

    /// Delete a document. Deleting a missing document is not an error.
    pub async fn delete_document(&self, collection: &str, doc_id: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let url = self.document_path(collection, doc_id);
        let url = url.as_str();

        with_retry(&self.config.retry, "delete_document", || {
            self.execute_request("delete_document", collection, Some(doc_id), async move {
                let response = self.send(url, |http| http.delete(url)).await?;
                match response.status() {
                    StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
                    status => Err(Self::handle_error_response(status, url, response).await),
                }
            })
        })
        .await
    }

    /// Round-trip to the backend with a read of a sentinel document.
    ///
    /// A 404 still proves the database answered.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.ensure_open()?;
        let url = self.document_path(&self.config.collection, "__health__");
        let url = url.as_str();

        self.execute_request("health_check", &self.config.collection, None, async {
            let response = self.send(url, |http| http.get(url)).await?;
            match response.status() {
                StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
                status => Err(Self::handle_error_response(status, url, response).await),
            }
        })
        .await
    }

    /// Mark the client closed; later operations fail with `StoreError::Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Store client closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    /// Execute a request with tracing and metrics.
    async fn execute_request<T, F>(
        &self,
        operation: &'static str,
        collection: &str,
        doc_id: Option<&str>,
        fut: F,
    ) -> StoreResult<T>
    where
        F: std::future::Future<Output = StoreResult<T>>,
    {
        let span = match doc_id {
            Some(id) => info_span!("store_request", operation = %operation, collection = %collection, doc_id = %id),
            None => info_span!("store_request", operation = %operation, collection = %collection),
        };

        let start = Instant::now();
        let result = fut.instrument(span).await;
        let status = result
            .as_ref()
            .map_or_else(|e| e.http_status().unwrap_or(500), |_| 200);
        record_request(operation, status, start.elapsed());

        result
    }

    async fn handle_error_response(status: StatusCode, url: &str, response: Response) -> StoreError {
        let body = response.text().await.unwrap_or_default();
        StoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToFirestoreValue, Value};
    use serde_json::json;
    use serial_test::serial;
    use std::collections::HashMap;
    use wiremock::matchers::{header, method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) async fn emulator_client(server: &MockServer) -> StoreClient {
        let config = StoreConfig {
            backend: StoreBackend::Firestore,
            project_id: "test-project".to_string(),
            emulator_host: Some(server.uri()),
            retry: RetryConfig {
                retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..StoreConfig::default()
        };
        StoreClient::new(config).await.unwrap()
    }

    #[test]
    #[serial]
    fn test_config_requires_project_for_firestore() {
        std::env::set_var("STORE_BACKEND", "firestore");
        std::env::remove_var("STORE_PROJECT_ID");
        std::env::remove_var("GCP_PROJECT_ID");
        assert!(matches!(StoreConfig::from_env(), Err(StoreError::Config(_))));
        std::env::remove_var("STORE_BACKEND");
    }

    #[test]
    #[serial]
    fn test_config_memory_backend_needs_no_project() {
        std::env::set_var("STORE_BACKEND", "memory");
        std::env::remove_var("STORE_PROJECT_ID");
        std::env::remove_var("GCP_PROJECT_ID");
        let config = StoreConfig::from_env().unwrap();
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.collection, "reel_jobs");
        std::env::remove_var("STORE_BACKEND");
    }

    #[test]
    fn test_emulator_base_url() {
        let config = StoreConfig {
            emulator_host: Some("localhost:8080".to_string()),
            project_id: "p".to_string(),
            ..StoreConfig::default()
        };
        assert_eq!(
            config.base_url(),
            "http://localhost:8080/v1/projects/p/databases/(default)/documents"
        );
    }

    #[tokio::test]
    async fn test_get_missing_document_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"/documents/reel_jobs/abc$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = emulator_client(&server).await;
        let doc = client.get_document("reel_jobs", "abc").await.unwrap();
        assert!(doc.is_none());
    }

    #[tokio::test]
    async fn test_upsert_sends_fields_with_emulator_auth() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path_regex(r"/documents/reel_jobs/abc$"))
            .and(header("authorization", "Bearer owner"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/test-project/databases/(default)/documents/reel_jobs/abc",
                "fields": { "status": { "stringValue": "queued" } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = emulator_client(&server).await;
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), "queued".to_firestore_value());

        let saved = client
            .upsert_document("reel_jobs", "abc", &Document::new(fields))
            .await
            .unwrap();
        assert_eq!(saved.field::<String>("status").as_deref(), Some("queued"));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "fields": { "attempts": { "integerValue": "1" } }
            })))
            .mount(&server)
            .await;

        let client = emulator_client(&server).await;
        let doc = client.get_document("reel_jobs", "abc").await.unwrap().unwrap();
        assert_eq!(
            doc.fields.unwrap().get("attempts"),
            Some(&Value::IntegerValue("1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = emulator_client(&server).await;
        let err = client.get_document("reel_jobs", "abc").await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_health_check_accepts_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"/__health__$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = emulator_client(&server).await;
        assert!(client.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let server = MockServer::start().await;
        let client = emulator_client(&server).await;
        client.close();
        assert!(client.is_closed());
        tokio_test::assert_err!(client.get_document("reel_jobs", "abc").await);
        assert!(matches!(client.health_check().await, Err(StoreError::Closed)));
    }
}
