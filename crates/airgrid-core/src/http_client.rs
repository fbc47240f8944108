use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Minimal HTTP method set needed by provider fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Authentication strategy applied to outgoing provider requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    BearerToken(String),
    Header { name: String, value: String },
    /// API key passed as a query parameter, as most weather and air-quality APIs expect.
    QueryKey { name: String, value: String },
}

/// HTTP request envelope executed as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_auth(self, auth: &HttpAuth) -> Self {
        match auth {
            HttpAuth::None => self,
            HttpAuth::BearerToken(token) => {
                self.with_header("authorization", format!("Bearer {token}"))
            }
            HttpAuth::Header { name, value } => self.with_header(name.as_str(), value.as_str()),
            HttpAuth::QueryKey { name, value } => self.with_query(name.as_str(), value),
        }
    }

    /// Full URL with percent-encoded query parameters appended.
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }

        let encoded = self
            .query
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{encoded}", self.url)
    }
}

/// HTTP response envelope returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub const fn is_client_error(&self) -> bool {
        self.status >= 400 && self.status < 500
    }

    pub const fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Transport-level HTTP error: no response was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    message: String,
    retryable: bool,
}

impl HttpError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

pub type HttpFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

/// Provider transport contract.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a>;
}

/// Transport that answers every request with the same canned response.
#[derive(Debug, Clone)]
pub struct StaticHttpClient {
    response: HttpResponse,
}

impl StaticHttpClient {
    pub fn new(response: HttpResponse) -> Self {
        Self { response }
    }
}

impl Default for StaticHttpClient {
    fn default() -> Self {
        Self::new(HttpResponse::ok_json("{}"))
    }
}

impl HttpClient for StaticHttpClient {
    fn execute<'a>(&'a self, _request: HttpRequest) -> HttpFuture<'a> {
        let response = self.response.clone();
        Box::pin(async move { Ok(response) })
    }
}

/// Production transport backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
    timeout: Duration,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("airgrid/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
            timeout,
        }
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client: Arc::new(client),
            timeout,
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        Box::pin(async move {
            let url = request.full_url();
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&url),
                HttpMethod::Post => self.client.post(&url),
            };

            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            builder = builder.timeout(self.timeout);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    HttpError::new(format!("request timeout: {e}"))
                } else if e.is_connect() {
                    HttpError::new(format!("connection failed: {e}"))
                } else if e.is_builder() {
                    HttpError::non_retryable(format!("invalid request: {e}"))
                } else {
                    HttpError::new(format!("request failed: {e}"))
                }
            })?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| HttpError::new(format!("failed to read response body: {e}")))?;

            Ok(HttpResponse { status, body })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_key_auth_is_percent_encoded_into_url() {
        let request = HttpRequest::get("https://api.example.test/air")
            .with_query("lat", 52.37)
            .with_query("lon", 4.895)
            .with_auth(&HttpAuth::QueryKey {
                name: String::from("key"),
                value: String::from("a b&c"),
            });

        assert_eq!(
            request.full_url(),
            "https://api.example.test/air?lat=52.37&lon=4.895&key=a%20b%26c"
        );
    }

    #[test]
    fn query_is_appended_to_existing_query_string() {
        let request = HttpRequest::get("https://api.example.test/pollen?v=2").with_query("lat", 1);

        assert_eq!(request.full_url(), "https://api.example.test/pollen?v=2&lat=1");
    }

    #[test]
    fn bearer_auth_populates_authorization_header() {
        let request = HttpRequest::get("https://api.example.test/weather")
            .with_auth(&HttpAuth::BearerToken(String::from("token-123")));

        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Bearer token-123")
        );
    }

    #[test]
    fn status_classes_partition_responses() {
        assert!(HttpResponse::new(204, "").is_success());
        assert!(HttpResponse::new(404, "").is_client_error());
        assert!(HttpResponse::new(503, "").is_server_error());
        assert!(!HttpResponse::new(503, "").is_client_error());
    }

    #[tokio::test]
    async fn static_client_returns_canned_response() {
        let client = StaticHttpClient::new(HttpResponse::new(418, "teapot"));

        let response = client
            .execute(HttpRequest::get("https://api.example.test"))
            .await
            .expect("static client never fails");

        assert_eq!(response.status, 418);
        assert_eq!(response.body, "teapot");
    }
}
