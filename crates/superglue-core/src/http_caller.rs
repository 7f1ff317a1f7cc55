// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Executes a single HTTP `ApiConfig` against its remote endpoint: header
//! and query-param substitution, Basic-auth normalization, retry-with-backoff
//! on transient failures, and `Retry-After`-aware handling of `429`.

use crate::config::{ApiConfig, HttpMethod};
use crate::error::{OrchestratorError, Result};
use crate::masking::mask_credentials;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::substitution::{substitute, substitute_map, VariableScope};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// The longest we'll honor a server's `Retry-After` request for before
/// giving up instead of blocking the caller indefinitely.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Raw outcome of one HTTP call: status code and parsed (or raw text) body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
    pub headers: HashMap<String, String>,
}

pub struct HttpCaller {
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl HttpCaller {
    pub fn new(client: reqwest::Client, retry_policy: RetryPolicy) -> Self {
        Self { client, retry_policy }
    }

    /// Executes `config` once, substituting `scope` into its URL, headers,
    /// query params, and body, retrying transient failures per the retry
    /// policy.
    pub async fn call(&self, config: &ApiConfig, scope: &VariableScope) -> Result<HttpResponse> {
        let credentials_map = scope_to_string_map(scope);
        let executor = RetryExecutor::new(self.retry_policy);

        executor
            .execute_with_delay(
                || self.attempt(config, scope),
                |err: &OrchestratorError| match err {
                    OrchestratorError::AbortError(_) => false,
                    OrchestratorError::RateLimitExceeded { wait } => *wait <= MAX_RATE_LIMIT_WAIT,
                    _ => true,
                },
                |err: &OrchestratorError| match err {
                    OrchestratorError::RateLimitExceeded { wait } => Some(*wait),
                    _ => None,
                },
            )
            .await
            .map_err(|err| mask_error(err, &credentials_map))
    }

    async fn attempt(&self, config: &ApiConfig, scope: &VariableScope) -> Result<HttpResponse> {
        let url = substitute(&config.full_url(), scope);
        let mut headers = substitute_map(&config.headers, scope);
        dedup_authorization_header(&mut headers);
        normalize_authorization_header(&mut headers);

        let query_params = substitute_map(&config.query_params, scope);
        let body = config
            .body
            .as_ref()
            .map(|b| substitute(b, scope));

        debug!(method = ?config.method, url = %url, "dispatching HTTP request");

        let mut request = self
            .client
            .request(config.method.as_reqwest(), &url)
            .query(&query_params);

        for (key, value) in &headers {
            request = request.header(key, value);
        }

        if let Some(body) = &body {
            request = attach_body(request, config.method, body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        if status == 429 {
            return Err(self.rate_limit_error(&response).await);
        }

        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let text = response.text().await.unwrap_or_default();

        if status >= 500 {
            return Err(OrchestratorError::ApiCallError {
                status_code: Some(status),
                message: format!("server error {status}: {text}"),
            });
        }

        let parsed_body = parse_body(&text, &response_headers);

        if status >= 400 {
            return Err(OrchestratorError::ApiCallError {
                status_code: Some(status),
                message: format!("request failed with {status}: {text}"),
            });
        }

        Ok(HttpResponse {
            status,
            body: parsed_body,
            headers: response_headers,
        })
    }

    /// Builds the rate-limit error from the response's `Retry-After` header,
    /// honoring both plain-integer-seconds and HTTP-date forms. The carried
    /// `wait` is the raw, unclamped duration the server asked for — callers
    /// decide whether to sleep it (if within budget) or treat it as terminal
    /// (if it exceeds [`MAX_RATE_LIMIT_WAIT`]), never sleeping longer than
    /// that budget either way.
    async fn rate_limit_error(&self, response: &reqwest::Response) -> OrchestratorError {
        let wait = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
            .unwrap_or(Duration::from_secs(1));

        if wait > MAX_RATE_LIMIT_WAIT {
            warn!(wait_secs = wait.as_secs(), "rate limited, Retry-After exceeds wait budget");
        } else {
            warn!(wait_secs = wait.as_secs(), "rate limited, will retry after Retry-After");
        }
        OrchestratorError::RateLimitExceeded { wait }
    }
}

/// Parses a `Retry-After` header value: either a plain integer number of
/// seconds, or an HTTP-date (RFC 2822, e.g. `Wed, 21 Oct 2026 07:28:00 GMT`)
/// to wait until.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let target = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let seconds = (target.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_seconds();
    Some(Duration::from_secs(seconds.max(0) as u64))
}

/// Collapses duplicate `Authorization` header keys that can arise when a
/// caller's template and an OAuth/basic-auth injection both set it —
/// keeps the last one written.
fn dedup_authorization_header(headers: &mut HashMap<String, String>) {
    let auth_keys: Vec<String> = headers
        .keys()
        .filter(|k| k.eq_ignore_ascii_case("authorization"))
        .cloned()
        .collect();
    if auth_keys.len() > 1 {
        let winner = headers.get(&auth_keys[auth_keys.len() - 1]).cloned();
        for key in &auth_keys {
            headers.remove(key);
        }
        if let Some(value) = winner {
            headers.insert("Authorization".to_string(), value);
        }
    }
}

/// Normalizes the resolved `Authorization` header value: collapses an
/// accidentally doubled `Basic Basic`/`Bearer Bearer` prefix (which can
/// arise when a template already contains the scheme and a credential
/// value also carries it), then, for `Basic <x>`, base64-encodes `<x>` if
/// it isn't already valid base64 — callers sometimes template in a raw
/// `user:pass` string rather than a pre-encoded one.
fn normalize_authorization_header(headers: &mut HashMap<String, String>) {
    let Some(key) = headers.keys().find(|k| k.eq_ignore_ascii_case("authorization")).cloned() else {
        return;
    };
    let Some(mut value) = headers.get(&key).cloned() else {
        return;
    };

    value = collapse_doubled_scheme(&value, "Basic");
    value = collapse_doubled_scheme(&value, "Bearer");

    if let Some(rest) = value.strip_prefix("Basic ") {
        if !is_base64_alphabet(rest) {
            use base64::{engine::general_purpose::STANDARD, Engine};
            value = format!("Basic {}", STANDARD.encode(rest));
        }
    }

    headers.insert(key, value);
}

fn collapse_doubled_scheme(value: &str, scheme: &str) -> String {
    let doubled = format!("{scheme} {scheme} ");
    match value.strip_prefix(&doubled) {
        Some(rest) => format!("{scheme} {rest}"),
        None => value.to_string(),
    }
}

/// Whether `s` consists entirely of characters from the Base64 alphabet
/// (including `=` padding) — a cheap check for "already encoded" rather
/// than a full decode/validate.
fn is_base64_alphabet(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

/// Builds a Basic-auth `Authorization` header from separately supplied
/// username/password credential values.
pub fn basic_auth_header(username: &str, password: &str) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let raw = format!("{username}:{password}");
    format!("Basic {}", STANDARD.encode(raw))
}

fn attach_body(request: reqwest::RequestBuilder, method: HttpMethod, body: &str) -> reqwest::RequestBuilder {
    if matches!(method, HttpMethod::Get | HttpMethod::Head) {
        return request;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(json) => request.json(&json),
        Err(_) => request.body(body.to_string()),
    }
}

fn parse_body(text: &str, headers: &HashMap<String, String>) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        return json;
    }

    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.as_str())
        .unwrap_or("");

    if content_type.contains("text/html") || looks_like_html(text) {
        return Value::String(text.to_string());
    }

    Value::String(text.to_string())
}

fn looks_like_html(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<html")
}

fn scope_to_string_map(scope: &VariableScope) -> HashMap<String, String> {
    scope
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

fn mask_error(err: OrchestratorError, credentials: &HashMap<String, String>) -> OrchestratorError {
    let credentials_value: HashMap<String, Value> = credentials
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    match err {
        OrchestratorError::ApiCallError { status_code, message } => OrchestratorError::ApiCallError {
            status_code,
            message: mask_credentials(&message, &credentials_value),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_last_authorization_header() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer first".to_string());
        headers.insert("authorization".to_string(), "Bearer second".to_string());
        dedup_authorization_header(&mut headers);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn basic_auth_header_encodes_as_base64() {
        let header = basic_auth_header("user", "pass");
        assert_eq!(header, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn normalize_encodes_raw_basic_credentials() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Basic user:pass".to_string());
        normalize_authorization_header(&mut headers);
        assert_eq!(headers.get("Authorization").unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn normalize_leaves_already_encoded_basic_credentials() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Basic dXNlcjpwYXNz".to_string());
        normalize_authorization_header(&mut headers);
        assert_eq!(headers.get("Authorization").unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn normalize_collapses_doubled_basic_prefix() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Basic Basic dXNlcjpwYXNz".to_string());
        normalize_authorization_header(&mut headers);
        assert_eq!(headers.get("Authorization").unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn normalize_collapses_doubled_bearer_prefix() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer Bearer token123".to_string());
        normalize_authorization_header(&mut headers);
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer token123");
    }

    #[test]
    fn parse_body_detects_html_without_content_type() {
        let value = parse_body("<!DOCTYPE html><html></html>", &HashMap::new());
        assert!(matches!(value, Value::String(_)));
    }

    #[test]
    fn parse_body_parses_json() {
        let value = parse_body("{\"a\":1}", &HashMap::new());
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[test]
    fn parse_body_empty_is_null() {
        assert_eq!(parse_body("", &HashMap::new()), Value::Null);
    }

    #[test]
    fn parse_retry_after_accepts_plain_seconds() {
        assert_eq!(parse_retry_after("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn parse_retry_after_accepts_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(30);
        let header = future.to_rfc2822();
        let wait = parse_retry_after(&header).unwrap();
        assert!(wait.as_secs() <= 30 && wait.as_secs() >= 28);
    }

    #[test]
    fn parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("not-a-date"), None);
    }

    fn sample_config(url_host: &str) -> ApiConfig {
        ApiConfig {
            id: "cfg1".to_string(),
            url_host: url_host.to_string(),
            url_path: "/items".to_string(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
            authentication: crate::config::AuthenticationType::None,
            pagination: None,
            data_path: None,
            response_schema: None,
            response_mapping: None,
            instruction: String::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn retry_sleeps_the_honored_retry_after_not_the_generic_backoff() {
        let mut server = mockito::Server::new_async().await;
        // Always 429 with an immediate Retry-After; the generic backoff
        // policy below is calibrated to 10s so that if `call` ever fell
        // back to it instead of honoring the header, this test would take
        // >10s instead of completing almost instantly.
        let rate_limited = server
            .mock("GET", "/items")
            .with_status(429)
            .with_header("retry-after", "0")
            .expect(2)
            .create_async()
            .await;

        let caller = HttpCaller::new(
            reqwest::Client::new(),
            RetryPolicy::new(2, Duration::from_secs(10), 1.0, Duration::from_secs(60)),
        );
        let scope = VariableScope::new();
        let config = sample_config(&server.url());

        let start = std::time::Instant::now();
        let result = caller.call(&config, &scope).await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(OrchestratorError::RateLimitExceeded { .. })));
        assert!(
            elapsed < Duration::from_secs(5),
            "expected the honored Retry-After (0s) to be used instead of the 10s generic backoff, took {elapsed:?}"
        );
        rate_limited.assert_async().await;
    }

    #[tokio::test]
    async fn fails_without_retry_when_retry_after_exceeds_budget() {
        let mut server = mockito::Server::new_async().await;
        let rate_limited = server
            .mock("GET", "/items")
            .with_status(429)
            .with_header("retry-after", "120")
            .expect(1)
            .create_async()
            .await;

        let caller = HttpCaller::new(
            reqwest::Client::new(),
            RetryPolicy::new(3, Duration::from_millis(1), 1.0, Duration::from_secs(5)),
        );
        let scope = VariableScope::new();
        let config = sample_config(&server.url());

        let result = caller.call(&config, &scope).await;
        assert!(matches!(result, Err(OrchestratorError::RateLimitExceeded { .. })));
        rate_limited.assert_async().await;
    }
}
