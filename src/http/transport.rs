// HTTP transport boundary and its reqwest implementation.
// The coordinator only sees requests and fully-read responses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Client, Method, StatusCode, Url,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT},
};
use serde_json::Value;

use crate::cache::QueryParams;
use crate::config::CoordinatorConfig;
use crate::error::{FetchError, Result};

/// A fully described outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Build `base + endpoint` with the query string in stable key order.
    pub fn new(method: Method, base_url: &str, endpoint: &str, params: &QueryParams) -> Result<Self> {
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );
        let url = if params.is_empty() {
            Url::parse(&url)?
        } else {
            Url::parse_with_params(&url, params.iter())?
        };

        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    /// Set or replace the bearer credential.
    pub fn set_authorization(&mut self, value: &str) -> Result<()> {
        let mut header = HeaderValue::from_str(value)?;
        header.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, header);
        Ok(())
    }

    pub fn clear_authorization(&mut self) {
        self.headers.remove(AUTHORIZATION);
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }
}

/// A response with its body already read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Response with a JSON body and matching content type.
    pub fn json(status: StatusCode, body: &Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Sends requests to the origin.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request. Only failures to obtain a response are errors;
    /// every status code comes back as a response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Transport over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FetchError::Config(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_url_has_sorted_query() {
        let request = HttpRequest::new(
            Method::GET,
            "https://api.example.com/v1/",
            "/subjects",
            &params(&[("z", "1"), ("a", "two words")]),
        )
        .unwrap();
        assert_eq!(
            request.url.as_str(),
            "https://api.example.com/v1/subjects?a=two+words&z=1"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpRequest::new(Method::GET, "not a url", "/x", &QueryParams::new()).unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[test]
    fn test_authorization_header() {
        let mut request =
            HttpRequest::new(Method::GET, "https://a.test", "/x", &QueryParams::new()).unwrap();
        request.set_authorization("Bearer abc").unwrap();
        assert_eq!(request.authorization(), Some("Bearer abc"));
        request.clear_authorization();
        assert_eq!(request.authorization(), None);
    }

    #[tokio::test]
    async fn test_reqwest_transport_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/things"))
            .and(query_param("instituteId", "I1"))
            .and(header("authorization", "Bearer t1"))
            .and(body_json(json!({"name": "thing"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&CoordinatorConfig::default()).unwrap();
        let mut request = HttpRequest::new(
            Method::POST,
            &format!("{}/api", server.uri()),
            "/things",
            &params(&[("instituteId", "I1")]),
        )
        .unwrap()
        .with_body(Some(json!({"name": "thing"})));
        request.set_authorization("Bearer t1").unwrap();

        let response = transport.send(request).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert!(response.content_type().unwrap().contains("json"));
        assert_eq!(serde_json::from_str::<Value>(&response.body).unwrap(), json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_error_status_is_a_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({"message": "slow down"})))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&CoordinatorConfig::default()).unwrap();
        let request = HttpRequest::new(Method::GET, &server.uri(), "/x", &QueryParams::new()).unwrap();
        let response = transport.send(request).await.unwrap();
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    }
}
