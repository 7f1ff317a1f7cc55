// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Integration` — a stored connection to a third-party API: base URL,
//! credentials, and (for OAuth2 integrations) the refresh-token machinery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OAuth2 grant state kept alongside an [`Integration`] when its
/// credentials were obtained via an authorization-code flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// The scheme the access token is presented under (`"Bearer"`,
    /// occasionally `"Basic"`/`"MAC"` for non-standard issuers). `None`
    /// means the authorization server didn't report one; callers default
    /// to `Bearer`.
    #[serde(default)]
    pub token_type: Option<String>,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// When `access_token` expires. `None` means the token never expires or
    /// expiry tracking wasn't provided by the authorization server.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A stored connection to a third-party API, scoped to a single
/// organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub org_id: String,

    /// Human-readable label shown in listings — distinct from `id`, which
    /// is the stable reference `ExecutionStep`/`Workflow` link against.
    #[serde(default)]
    pub name: String,

    pub url_host: String,
    #[serde(default)]
    pub url_path: String,

    /// Flat credential bag (API keys, bearer tokens, basic-auth parts) —
    /// stored encrypted at rest by the datastore layer, plaintext here.
    #[serde(default)]
    pub credentials: HashMap<String, String>,

    #[serde(default)]
    pub oauth: Option<OAuthState>,

    #[serde(default)]
    pub documentation_url: Option<String>,

    /// Free-text documentation for this integration, fed into the
    /// self-healing prompt alongside `specific_instructions`.
    #[serde(default)]
    pub documentation: String,

    /// OpenAPI schema for the integration's API, if one was imported.
    #[serde(default)]
    pub open_api_schema: Option<serde_json::Value>,

    /// Operator-authored guidance specific to this integration (quirks,
    /// gotchas, required headers) surfaced to the self-healing LLM.
    #[serde(default)]
    pub specific_instructions: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    /// Builds the variable scope an `ApiConfig` is substituted against for
    /// this integration: credential entries plus the host/path, matching
    /// the `{integrationId}_apiKey`-style naming convention catalog entries
    /// rely on.
    pub fn credential_scope(&self) -> HashMap<String, serde_json::Value> {
        let mut scope: HashMap<String, serde_json::Value> = self
            .credentials
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        if let Some(oauth) = &self.oauth {
            scope.insert(
                "access_token".to_string(),
                serde_json::Value::String(oauth.access_token.clone()),
            );
        }
        scope
    }

    pub fn has_oauth(&self) -> bool {
        self.oauth.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_scope_includes_access_token_when_oauth_present() {
        let integration = Integration {
            id: "int1".to_string(),
            org_id: "org1".to_string(),
            name: "Test Integration".to_string(),
            url_host: "https://api.example.com".to_string(),
            url_path: String::new(),
            credentials: HashMap::new(),
            oauth: Some(OAuthState {
                access_token: "tok".to_string(),
                refresh_token: None,
                token_type: None,
                token_url: "https://example.com/oauth/token".to_string(),
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                scopes: vec![],
                expires_at: None,
            }),
            documentation_url: None,
            documentation: String::new(),
            open_api_schema: None,
            specific_instructions: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let scope = integration.credential_scope();
        assert_eq!(
            scope.get("access_token"),
            Some(&serde_json::Value::String("tok".to_string()))
        );
    }
}
