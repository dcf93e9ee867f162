// Test doubles for the transport and credential boundaries.
// Scripted responses, call recording, and a coordinator wired to a manual clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::auth::{CredentialStore, Credentials};
use crate::cache::MemoryStore;
use crate::clock::ManualClock;
use crate::config::CoordinatorConfig;
use crate::coordinator::RequestCoordinator;
use crate::error::{FetchError, Result};
use crate::http::{HttpRequest, HttpResponse, Transport};

pub const BASE_URL: &str = "https://api.test";

type Handler = Box<dyn Fn(&HttpRequest, usize) -> Result<HttpResponse> + Send + Sync>;

/// Transport answering from a closure given the request and its call index.
pub struct MockTransport {
    handler: Handler,
    delay: Duration,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&HttpRequest, usize) -> Result<HttpResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Transport answering every call with `{"call": index}`.
    pub fn counting() -> Self {
        Self::new(|_, call| Ok(ok_json(json!({ "call": call }))))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(&request, call)
    }
}

pub fn ok_json(body: Value) -> HttpResponse {
    HttpResponse::json(StatusCode::OK, &body)
}

pub fn status_json(status: u16, body: Value) -> HttpResponse {
    HttpResponse::json(StatusCode::from_u16(status).unwrap(), &body)
}

/// Credential store whose refresh swaps in the token `fresh`.
pub struct MockCredentials {
    token: Mutex<Option<String>>,
    fail_refresh: bool,
    refresh_delay: Duration,
    pub refresh_calls: AtomicUsize,
    pub clear_calls: AtomicUsize,
}

impl MockCredentials {
    pub fn new(token: &str) -> Self {
        Self {
            token: Mutex::new(Some(token.to_string())),
            fail_refresh: false,
            refresh_delay: Duration::from_millis(20),
            refresh_calls: AtomicUsize::new(0),
            clear_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_refresh = true;
        self
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MockCredentials {
    async fn credentials(&self) -> Option<Credentials> {
        self.token().map(Credentials::bearer)
    }

    async fn refresh_credentials(&self) -> Result<Credentials> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.refresh_delay).await;
        if self.fail_refresh {
            return Err(FetchError::Http {
                status: 401,
                message: "refresh token expired".to_string(),
            });
        }
        *self.token.lock().unwrap() = Some("fresh".to_string());
        Ok(Credentials::bearer("fresh"))
    }

    async fn clear_credentials(&self) {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        *self.token.lock().unwrap() = None;
    }
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        revalidate_delay_ms: 100,
        ..CoordinatorConfig::default()
    }
    .with_base_url(BASE_URL)
}

/// A coordinator plus handles on all of its collaborators.
pub struct Harness {
    pub coordinator: RequestCoordinator,
    pub transport: Arc<MockTransport>,
    pub credentials: Arc<MockCredentials>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(transport: MockTransport) -> Self {
        Self::with(test_config(), transport, MockCredentials::new("initial"))
    }

    pub fn with(
        config: CoordinatorConfig,
        transport: MockTransport,
        credentials: MockCredentials,
    ) -> Self {
        let transport = Arc::new(transport);
        let credentials = Arc::new(credentials);
        let clock = ManualClock::default();
        let coordinator = RequestCoordinator::builder(config)
            .transport(transport.clone())
            .credentials(credentials.clone())
            .cache(Arc::new(MemoryStore::new()))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        Self {
            coordinator,
            transport,
            credentials,
            clock,
        }
    }

    pub fn calls(&self) -> usize {
        self.transport.calls()
    }
}
