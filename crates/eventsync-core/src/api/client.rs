//! API client for the event-discovery REST backend.
//!
//! Reads go through typed helpers (`list_events`, `list_alerts`, ...); writes
//! go through [`ApiClient::send`] so the same request can be captured and
//! replayed later by the sync driver.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::ApiError;
use crate::models::{AgendaResponse, Alert, Event, EventFilter, Route, User};
use crate::query::{AgendaSource, EventSource, ListSource};
use crate::queue::{HttpMethod, PendingOperation, ReplayTransport};

// ============================================================================
// Constants
// ============================================================================

/// Base URL used when neither the environment nor the config names one.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3001/api/v1";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a client for `base_url` (e.g. `http://localhost:3001/api/v1`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    /// Headers to store with a queued operation so it can be replayed as sent.
    pub fn request_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(header::CONTENT_TYPE.to_string(), "application/json".to_string());
        if let Some(ref token) = self.token {
            headers.insert(header::AUTHORIZATION.to_string(), format!("Bearer {}", token));
        }
        headers
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ApiError::InvalidRequest(format!("Bad token: {}", e)))?,
            );
        }
        Ok(headers)
    }

    /// Rebuild the headers captured with a queued operation.
    fn replay_headers(&self, captured: &BTreeMap<String, String>) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        for (name, value) in captured {
            match (
                header::HeaderName::from_bytes(name.as_bytes()),
                header::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping unreadable captured header"),
            }
        }
        if !headers.contains_key(header::AUTHORIZATION) {
            headers.extend(self.auth_headers()?);
        }
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        query: &[(&'static str, String)],
        headers: header::HeaderMap,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone());
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!(%method, url, "Sending request");
            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Decode a response body; an empty body (e.g. 204) is `None`.
    async fn read_body(response: Response, url: &str) -> Result<Option<Value>, ApiError> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e)))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&'static str, String)],
    ) -> Result<T, ApiError> {
        let url = self.url(endpoint);
        let response = self
            .send_with_retry(Method::GET, &url, query, self.auth_headers()?, None)
            .await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e)))
    }

    /// Send a mutation with the current credentials.
    pub async fn send(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ApiError> {
        let url = self.url(endpoint);
        let response = self
            .send_with_retry(to_method(method), &url, &[], self.auth_headers()?, body)
            .await?;
        Self::read_body(response, &url).await
    }

    // ===== Data Fetching Methods =====

    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, ApiError> {
        self.get("/events/", &filter.query_pairs()).await
    }

    pub async fn upcoming_events(&self, limit: usize) -> Result<Vec<Event>, ApiError> {
        self.get("/events/upcoming", &[("limit", limit.to_string())]).await
    }

    pub async fn get_event(&self, id: &str) -> Result<Event, ApiError> {
        self.get(&format!("/events/{}", id), &[]).await
    }

    /// All alerts, including inactive ones, so the active index covers both.
    pub async fn list_alerts(&self) -> Result<Vec<Alert>, ApiError> {
        self.get("/alerts/", &[("active_only", "false".to_string())]).await
    }

    pub async fn list_routes(&self) -> Result<Vec<Route>, ApiError> {
        self.get("/routes/", &[]).await
    }

    pub async fn list_users(&self) -> Result<Vec<User>, ApiError> {
        self.get("/users/", &[]).await
    }

    pub async fn get_agenda(&self) -> Result<AgendaResponse, ApiError> {
        self.get("/agenda", &[]).await
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

// ============================================================================
// Query and replay seams
// ============================================================================

#[async_trait]
impl ListSource<Event> for ApiClient {
    async fn list(&self) -> Result<Vec<Event>, ApiError> {
        self.list_events(&EventFilter::default()).await
    }
}

#[async_trait]
impl ListSource<Alert> for ApiClient {
    async fn list(&self) -> Result<Vec<Alert>, ApiError> {
        self.list_alerts().await
    }
}

#[async_trait]
impl ListSource<Route> for ApiClient {
    async fn list(&self) -> Result<Vec<Route>, ApiError> {
        self.list_routes().await
    }
}

#[async_trait]
impl ListSource<User> for ApiClient {
    async fn list(&self) -> Result<Vec<User>, ApiError> {
        self.list_users().await
    }
}

#[async_trait]
impl EventSource for ApiClient {
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, ApiError> {
        ApiClient::list_events(self, filter).await
    }

    async fn upcoming_events(&self, limit: usize) -> Result<Vec<Event>, ApiError> {
        ApiClient::upcoming_events(self, limit).await
    }

    async fn get_event(&self, id: &str) -> Result<Event, ApiError> {
        ApiClient::get_event(self, id).await
    }
}

#[async_trait]
impl AgendaSource for ApiClient {
    async fn get_agenda(&self) -> Result<AgendaResponse, ApiError> {
        ApiClient::get_agenda(self).await
    }
}

#[async_trait]
impl ReplayTransport for ApiClient {
    async fn replay(&self, operation: &PendingOperation) -> Result<Option<Value>, ApiError> {
        let url = self.url(&operation.endpoint);
        let headers = self.replay_headers(&operation.headers)?;
        let response = self
            .send_with_retry(to_method(operation.method), &url, &[], headers, operation.data.as_ref())
            .await?;
        Self::read_body(response, &url).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventCategory;
    use crate::queue::{OperationKind, OperationRequest};
    use serde_json::json;
    use wiremock::matchers::{body_json, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert_json(id: &str) -> Value {
        json!({
            "_id": id,
            "title": "Desvio",
            "description": "",
            "type": "desvio",
            "location": "Av. Huayna Capac",
            "coordinates": {"lat": -2.9, "lng": -79.0},
            "start_date": "2025-01-01",
            "end_date": "2025-01-02",
            "is_active": true
        })
    }

    async fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(format!("{}/api/v1/", server.uri())).unwrap()
    }

    #[test]
    fn test_url_joining() {
        let client = ApiClient::new("http://example.com/api/v1///").unwrap();
        assert_eq!(client.base_url(), "http://example.com/api/v1");
        assert_eq!(client.url("/events/"), "http://example.com/api/v1/events/");
        assert_eq!(client.url("agenda"), "http://example.com/api/v1/agenda");
    }

    #[test]
    fn test_request_headers_include_token() {
        let client = ApiClient::new(DEFAULT_API_BASE_URL).unwrap();
        assert!(!client.request_headers().contains_key("authorization"));

        let authed = client.with_token("abc".to_string());
        assert_eq!(authed.request_headers()["authorization"], "Bearer abc");
        assert_eq!(authed.request_headers()["content-type"], "application/json");
    }

    #[tokio::test]
    async fn test_list_alerts_includes_inactive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts/"))
            .and(query_param("active_only", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([alert_json("a1")])))
            .expect(1)
            .mount(&server)
            .await;

        let alerts = client_for(&server).await.list_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, "a1");
    }

    #[tokio::test]
    async fn test_event_filter_becomes_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/events/"))
            .and(query_param("category", "religioso"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let events = client_for(&server)
            .await
            .list_events(&EventFilter::category(EventCategory::Religioso))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_not_found_maps_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/events/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Evento no encontrado"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.get_event("missing").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(ref body) if body == "Evento no encontrado"));
        assert!(!err.is_offline());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/routes/"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/routes/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let routes = client_for(&server).await.list_routes().await.unwrap();
        assert!(routes.is_empty());
    }

    #[tokio::test]
    async fn test_replay_sends_captured_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/alerts/"))
            .and(header_eq("authorization", "Bearer captured"))
            .and(body_json(json!({"title": "Desvio"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(alert_json("a9")))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), "Bearer captured".to_string());
        let op = OperationRequest::new(OperationKind::Create, "/alerts/", HttpMethod::Post)
            .with_data(json!({"title": "Desvio"}))
            .with_headers(headers)
            .into_operation("1-x".to_string(), 1);

        let client = client_for(&server).await.with_token("current".to_string());
        let body = client.replay(&op).await.unwrap().unwrap();
        assert_eq!(body["_id"], "a9");
    }

    #[tokio::test]
    async fn test_delete_with_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/routes/r1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let body = client_for(&server)
            .await
            .send(HttpMethod::Delete, "/routes/r1", None)
            .await
            .unwrap();
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_offline() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = ApiClient::new(format!("http://127.0.0.1:{}/api/v1", port)).unwrap();
        let err = client.list_routes().await.unwrap_err();
        assert!(err.is_offline(), "expected offline error, got {err}");
    }
}
