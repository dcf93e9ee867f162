// Response interpretation.
// Decodes success bodies and turns error responses into typed outcomes.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;

use crate::error::{FetchError, Result};

use super::transport::HttpResponse;

static SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)").expect("seconds pattern is valid")
});

/// What a response means to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Success(Value),
    Unauthorized,
    RateLimited { retry_after: Option<Duration> },
    Failed(FetchError),
}

pub fn classify(response: &HttpResponse) -> ResponseOutcome {
    let status = response.status;
    if status.is_success() {
        return match decode_body(response) {
            Ok(value) => ResponseOutcome::Success(value),
            Err(err) => ResponseOutcome::Failed(err),
        };
    }

    match status {
        StatusCode::UNAUTHORIZED => ResponseOutcome::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ResponseOutcome::RateLimited {
            retry_after: retry_after(response),
        },
        _ => ResponseOutcome::Failed(FetchError::Http {
            status: status.as_u16(),
            message: error_message(response),
        }),
    }
}

fn is_json(response: &HttpResponse) -> bool {
    response
        .content_type()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
}

/// JSON bodies decode to values; empty bodies are null; other text is a string.
pub fn decode_body(response: &HttpResponse) -> Result<Value> {
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    if is_json(response) {
        Ok(serde_json::from_str(&response.body)?)
    } else {
        Ok(Value::String(response.body.clone()))
    }
}

fn error_body(response: &HttpResponse) -> Option<Value> {
    if !is_json(response) {
        return None;
    }
    serde_json::from_str(&response.body).ok()
}

/// The server's `message`, arrays joined with ", ", or a generic message.
pub fn error_message(response: &HttpResponse) -> String {
    let server_message = error_body(response).and_then(|body| match body.get("message") {
        Some(Value::String(message)) if !message.trim().is_empty() => Some(message.clone()),
        Some(Value::Array(parts)) => {
            let parts: Vec<String> = parts
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    });

    server_message.unwrap_or_else(|| generic_message(response.status).to_string())
}

pub fn generic_message(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "The request was invalid",
        401 => "Authentication is required",
        403 => "You do not have permission to perform this action",
        404 => "The requested resource was not found",
        409 => "The request conflicts with the current state of the resource",
        422 => "The submitted data could not be processed",
        429 => "Too many requests, please try again later",
        500 => "The server encountered an internal error",
        502..=504 => "The service is temporarily unavailable",
        400..=499 => "The request could not be completed",
        _ => "The server could not complete the request",
    }
}

/// Retry hint from `details.retryAfter`, a top-level `retryAfter`, or the
/// `Retry-After` header. Numbers and free text containing a number of
/// seconds are accepted; anything else yields `None`.
pub fn retry_after(response: &HttpResponse) -> Option<Duration> {
    let from_body = error_body(response).and_then(|body| {
        body.pointer("/details/retryAfter")
            .or_else(|| body.get("retryAfter"))
            .and_then(seconds_from_value)
    });

    from_body.or_else(|| {
        response
            .headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}

fn seconds_from_value(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n.as_f64().and_then(seconds_from_f64),
        Value::String(text) => parse_seconds(text),
        _ => None,
    }
}

/// First number found in `text`, taken as seconds and rounded up.
pub fn parse_seconds(text: &str) -> Option<Duration> {
    SECONDS
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .and_then(seconds_from_f64)
}

fn seconds_from_f64(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs(secs.ceil() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_success_decoding() {
        let json = HttpResponse::json(StatusCode::OK, &json!({"data": [1]}));
        assert_eq!(classify(&json), ResponseOutcome::Success(json!({"data": [1]})));

        let text = HttpResponse::new(StatusCode::OK, "plain");
        assert_eq!(classify(&text), ResponseOutcome::Success(json!("plain")));

        let empty = HttpResponse::new(StatusCode::NO_CONTENT, "");
        assert_eq!(classify(&empty), ResponseOutcome::Success(Value::Null));
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        let mut response = HttpResponse::json(StatusCode::OK, &json!({}));
        response.body = "{broken".to_string();
        assert!(matches!(
            classify(&response),
            ResponseOutcome::Failed(FetchError::Decode(_))
        ));
    }

    #[test]
    fn test_error_message_prefers_server_text() {
        let single = HttpResponse::json(StatusCode::BAD_REQUEST, &json!({"message": "Name taken"}));
        assert_eq!(error_message(&single), "Name taken");

        let many = HttpResponse::json(
            StatusCode::UNPROCESSABLE_ENTITY,
            &json!({"message": ["name is required", "code too long"]}),
        );
        assert_eq!(error_message(&many), "name is required, code too long");

        let none = HttpResponse::new(StatusCode::NOT_FOUND, "<html>nope</html>");
        assert_eq!(error_message(&none), "The requested resource was not found");
    }

    #[test]
    fn test_http_error_outcome() {
        let response = HttpResponse::json(StatusCode::FORBIDDEN, &json!({"error": "x"}));
        assert_eq!(
            classify(&response),
            ResponseOutcome::Failed(FetchError::Http {
                status: 403,
                message: "You do not have permission to perform this action".to_string(),
            })
        );
    }

    #[test]
    fn test_retry_after_sources() {
        let text = HttpResponse::json(
            StatusCode::TOO_MANY_REQUESTS,
            &json!({"message": "Too many", "details": {"retryAfter": "Please retry after 5 seconds"}}),
        );
        assert_eq!(
            classify(&text),
            ResponseOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
        );

        let numeric = HttpResponse::json(
            StatusCode::TOO_MANY_REQUESTS,
            &json!({"details": {"retryAfter": 2.5}}),
        );
        assert_eq!(retry_after(&numeric), Some(Duration::from_secs(3)));

        let mut header = HttpResponse::new(StatusCode::TOO_MANY_REQUESTS, "");
        header
            .headers
            .insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&header), Some(Duration::from_secs(12)));

        let unparsable = HttpResponse::json(
            StatusCode::TOO_MANY_REQUESTS,
            &json!({"details": {"retryAfter": "later"}}),
        );
        assert_eq!(retry_after(&unparsable), None);
    }

    #[test]
    fn test_unauthorized_outcome() {
        let response = HttpResponse::new(StatusCode::UNAUTHORIZED, "");
        assert_eq!(classify(&response), ResponseOutcome::Unauthorized);
    }
}
