// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! OAuth2 token lifecycle: expiry checks, the refresh flow, header
//! construction, and authorization-code callback handling.
//!
//! Refreshes for a given `(orgId, integrationId)` pair are serialized
//! through [`OAuthRefreshLocks`] so two concurrent requests hitting an
//! expired token don't race each other into the authorization server —
//! the second caller waits for the first's refreshed token instead of
//! spending its own refresh token.

use crate::catalog;
use crate::error::{OrchestratorError, Result};
use crate::integration::OAuthState;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Resolves the token endpoint to refresh against, per spec.md §4.7's
/// fallback chain: the integration's own stored `token_url`, else the
/// matching catalog entry's OAuth template, else a `{urlHost}/oauth/token`
/// guess.
pub fn resolve_token_url(stored_token_url: &str, url_host: &str) -> String {
    if !stored_token_url.is_empty() {
        return stored_token_url.to_string();
    }
    if let Some(entry) = catalog::match_host(url_host) {
        if let Some(oauth) = &entry.oauth {
            return oauth.token_url.to_string();
        }
    }
    format!("{}/oauth/token", url_host.trim_end_matches('/'))
}

/// Tokens within this window of expiry are treated as already expired, so
/// a request doesn't start using a token that dies mid-flight.
const EXPIRY_SKEW: ChronoDuration = ChronoDuration::minutes(5);

/// True if `expires_at` is unset (unknown lifetime, treated as non-expiring)
/// or already within the refresh skew window.
pub fn is_token_expired(expires_at: Option<DateTime<Utc>>) -> bool {
    match expires_at {
        None => false,
        Some(exp) => Utc::now() + EXPIRY_SKEW >= exp,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchanges a refresh token for a fresh access token via the
/// authorization server's token endpoint. `url_host` is the owning
/// integration's base URL, consulted only when `oauth.token_url` is empty
/// (see [`resolve_token_url`]).
pub async fn refresh_oauth_token(client: &reqwest::Client, oauth: &OAuthState, url_host: &str) -> Result<OAuthState> {
    let refresh_token = oauth
        .refresh_token
        .as_ref()
        .ok_or_else(|| OrchestratorError::TokenRefreshFailed("no refresh_token stored".to_string()))?;

    let token_url = resolve_token_url(&oauth.token_url, url_host);

    let mut form = HashMap::new();
    form.insert("grant_type", "refresh_token");
    form.insert("refresh_token", refresh_token.as_str());
    form.insert("client_id", oauth.client_id.as_str());
    form.insert("client_secret", oauth.client_secret.as_str());

    let response = client
        .post(&token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| OrchestratorError::TokenRefreshFailed(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(OrchestratorError::TokenRefreshFailed(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| OrchestratorError::TokenRefreshFailed(e.to_string()))?;

    Ok(OAuthState {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token.or_else(|| oauth.refresh_token.clone()),
        token_type: parsed.token_type.or_else(|| oauth.token_type.clone()),
        token_url,
        client_id: oauth.client_id.clone(),
        client_secret: oauth.client_secret.clone(),
        scopes: oauth.scopes.clone(),
        expires_at: parsed.expires_in.map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
    })
}

/// Builds the `Authorization: <token_type> <access_token>` header for an
/// OAuth2 integration, defaulting to `Bearer` when the authorization server
/// didn't report a `token_type`.
pub fn build_oauth_headers(oauth: &OAuthState) -> HashMap<String, String> {
    let token_type = oauth.token_type.as_deref().unwrap_or("Bearer");
    let mut headers = HashMap::new();
    headers.insert(
        "Authorization".to_string(),
        format!("{token_type} {}", oauth.access_token),
    );
    headers
}

#[derive(Debug, Deserialize)]
struct AuthorizationCodeResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchanges an authorization code (from the redirect callback) for an
/// initial `OAuthState`.
pub async fn handle_oauth_callback(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
) -> Result<OAuthState> {
    let mut form = HashMap::new();
    form.insert("grant_type", "authorization_code");
    form.insert("code", code);
    form.insert("redirect_uri", redirect_uri);
    form.insert("client_id", client_id);
    form.insert("client_secret", client_secret);

    let response = client
        .post(token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| OrchestratorError::TokenRefreshFailed(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(OrchestratorError::TokenRefreshFailed(format!(
            "authorization code exchange failed with {status}: {body}"
        )));
    }

    let parsed: AuthorizationCodeResponse = response
        .json()
        .await
        .map_err(|e| OrchestratorError::TokenRefreshFailed(e.to_string()))?;

    Ok(OAuthState {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        token_type: parsed.token_type,
        token_url: token_url.to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        scopes: vec![],
        expires_at: parsed.expires_in.map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
    })
}

/// Per-`(orgId, integrationId)` mutex registry, serializing concurrent
/// refresh attempts for the same integration.
#[derive(Debug, Clone, Default)]
pub struct OAuthRefreshLocks {
    locks: Arc<DashMap<(String, String), Arc<Mutex<()>>>>,
}

impl OAuthRefreshLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex guarding refreshes for this integration, creating
    /// one on first use.
    pub fn lock_for(&self, org_id: &str, integration_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((org_id.to_string(), integration_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_token_url_prefers_stored_value() {
        let resolved = resolve_token_url("https://stored.example.com/token", "https://api.github.com");
        assert_eq!(resolved, "https://stored.example.com/token");
    }

    #[test]
    fn resolve_token_url_falls_back_to_catalog_template() {
        let resolved = resolve_token_url("", "https://api.github.com");
        assert_eq!(resolved, "https://github.com/login/oauth/access_token");
    }

    #[test]
    fn resolve_token_url_falls_back_to_url_host_guess() {
        let resolved = resolve_token_url("", "https://api.unknown-vendor.com");
        assert_eq!(resolved, "https://api.unknown-vendor.com/oauth/token");
    }

    #[test]
    fn token_without_expiry_never_expires() {
        assert!(!is_token_expired(None));
    }

    #[test]
    fn token_within_skew_window_is_expired() {
        let soon = Utc::now() + ChronoDuration::minutes(2);
        assert!(is_token_expired(Some(soon)));
    }

    #[test]
    fn token_far_in_future_is_not_expired() {
        let later = Utc::now() + ChronoDuration::hours(2);
        assert!(!is_token_expired(Some(later)));
    }

    #[test]
    fn build_oauth_headers_defaults_to_bearer_token() {
        let oauth = OAuthState {
            access_token: "tok123".to_string(),
            refresh_token: None,
            token_type: None,
            token_url: "https://example.com/oauth/token".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec![],
            expires_at: None,
        };
        let headers = build_oauth_headers(&oauth);
        assert_eq!(headers.get("Authorization"), Some(&"Bearer tok123".to_string()));
    }

    #[test]
    fn build_oauth_headers_honors_stored_token_type() {
        let oauth = OAuthState {
            access_token: "tok123".to_string(),
            refresh_token: None,
            token_type: Some("MAC".to_string()),
            token_url: "https://example.com/oauth/token".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec![],
            expires_at: None,
        };
        let headers = build_oauth_headers(&oauth);
        assert_eq!(headers.get("Authorization"), Some(&"MAC tok123".to_string()));
    }

    #[tokio::test]
    async fn refresh_locks_return_same_mutex_for_same_key() {
        let locks = OAuthRefreshLocks::new();
        let a = locks.lock_for("org1", "int1");
        let b = locks.lock_for("org1", "int1");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
