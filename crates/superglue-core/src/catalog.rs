// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A small static catalog of well-known integrations, used to pre-fill
//! `url_host`/`documentation_url`/auth hints when a caller creates an
//! integration by name instead of describing it from scratch.

use crate::config::AuthenticationType;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// OAuth2 endpoint defaults for a catalog entry, used to fill in
/// `refreshOAuthToken`'s token URL when an integration's own credentials
/// don't carry a `token_url` (spec.md §4.7: "from `credentials.token_url`,
/// else known-integration template, else `{urlHost}/oauth/token`").
#[derive(Debug, Clone)]
pub struct CatalogOAuth {
    pub auth_url: &'static str,
    pub token_url: &'static str,
    pub scopes: &'static [&'static str],
}

/// A catalog entry for one well-known API.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub key: &'static str,
    pub display_name: &'static str,
    pub url_host: &'static str,
    /// Pattern matched against an `ApiConfig`/`Integration`'s `url_host` to
    /// recognize this integration from a bare URL (spec.md §6 "`regex`
    /// (URL host match)") — a plain substring match on the host, not a
    /// true regular expression, matching how the corpus's URL-based
    /// integration matchers are written.
    pub host_pattern: &'static str,
    pub documentation_url: &'static str,
    pub open_api_url: Option<&'static str>,
    pub preferred_auth_type: AuthenticationType,
    /// Credential field names this integration expects, e.g. `"apiKey"`.
    pub credential_fields: &'static [&'static str],
    pub oauth: Option<CatalogOAuth>,
    pub icon: &'static str,
}

static CATALOG: Lazy<HashMap<&'static str, CatalogEntry>> = Lazy::new(|| {
    let mut map = HashMap::new();

    map.insert(
        "stripe",
        CatalogEntry {
            key: "stripe",
            display_name: "Stripe",
            url_host: "https://api.stripe.com",
            host_pattern: "api.stripe.com",
            documentation_url: "https://stripe.com/docs/api",
            open_api_url: Some("https://raw.githubusercontent.com/stripe/openapi/master/openapi/spec3.json"),
            preferred_auth_type: AuthenticationType::Header,
            credential_fields: &["apiKey"],
            oauth: None,
            icon: "stripe",
        },
    );

    map.insert(
        "shopify",
        CatalogEntry {
            key: "shopify",
            display_name: "Shopify",
            url_host: "https://{storeName}.myshopify.com",
            host_pattern: "myshopify.com",
            documentation_url: "https://shopify.dev/docs/api/admin-rest",
            open_api_url: None,
            preferred_auth_type: AuthenticationType::Oauth2,
            credential_fields: &["storeName", "accessToken"],
            oauth: Some(CatalogOAuth {
                auth_url: "https://{storeName}.myshopify.com/admin/oauth/authorize",
                token_url: "https://{storeName}.myshopify.com/admin/oauth/access_token",
                scopes: &["read_products", "read_orders"],
            }),
            icon: "shopify",
        },
    );

    map.insert(
        "github",
        CatalogEntry {
            key: "github",
            display_name: "GitHub",
            url_host: "https://api.github.com",
            host_pattern: "api.github.com",
            documentation_url: "https://docs.github.com/en/rest",
            open_api_url: Some("https://raw.githubusercontent.com/github/rest-api-description/main/descriptions/api.github.com/api.github.com.json"),
            preferred_auth_type: AuthenticationType::Oauth2,
            credential_fields: &["accessToken"],
            oauth: Some(CatalogOAuth {
                auth_url: "https://github.com/login/oauth/authorize",
                token_url: "https://github.com/login/oauth/access_token",
                scopes: &["repo", "read:org"],
            }),
            icon: "github",
        },
    );

    map.insert(
        "hubspot",
        CatalogEntry {
            key: "hubspot",
            display_name: "HubSpot",
            url_host: "https://api.hubapi.com",
            host_pattern: "api.hubapi.com",
            documentation_url: "https://developers.hubspot.com/docs/api/overview",
            open_api_url: None,
            preferred_auth_type: AuthenticationType::Oauth2,
            credential_fields: &["accessToken"],
            oauth: Some(CatalogOAuth {
                auth_url: "https://app.hubspot.com/oauth/authorize",
                token_url: "https://api.hubapi.com/oauth/v1/token",
                scopes: &["crm.objects.contacts.read"],
            }),
            icon: "hubspot",
        },
    );

    map.insert(
        "slack",
        CatalogEntry {
            key: "slack",
            display_name: "Slack",
            url_host: "https://slack.com/api",
            host_pattern: "slack.com",
            documentation_url: "https://api.slack.com/web",
            open_api_url: None,
            preferred_auth_type: AuthenticationType::Header,
            credential_fields: &["botToken"],
            oauth: Some(CatalogOAuth {
                auth_url: "https://slack.com/oauth/v2/authorize",
                token_url: "https://slack.com/api/oauth.v2.access",
                scopes: &["channels:read"],
            }),
            icon: "slack",
        },
    );

    map
});

/// Looks up a catalog entry by key, case-insensitively.
pub fn lookup(key: &str) -> Option<&'static CatalogEntry> {
    CATALOG.get(key.to_lowercase().as_str())
}

/// Finds the catalog entry whose `host_pattern` occurs within `url_host`,
/// used to recognize a bare integration URL against the static catalog
/// (spec.md §6: "Runtime uses it for URL→integration matching").
pub fn match_host(url_host: &str) -> Option<&'static CatalogEntry> {
    let host = url_host.to_lowercase();
    CATALOG.values().find(|entry| host.contains(entry.host_pattern))
}

/// Lists every catalog entry, sorted by key for stable output.
pub fn list() -> Vec<&'static CatalogEntry> {
    let mut entries: Vec<&'static CatalogEntry> = CATALOG.values().collect();
    entries.sort_by_key(|e| e.key);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_known_integration_case_insensitively() {
        let entry = lookup("Stripe").expect("stripe should be cataloged");
        assert_eq!(entry.url_host, "https://api.stripe.com");
    }

    #[test]
    fn unknown_integration_returns_none() {
        assert!(lookup("not-a-real-integration").is_none());
    }

    #[test]
    fn match_host_recognizes_known_api_host() {
        let entry = match_host("https://api.github.com/repos/x/y").expect("github should match");
        assert_eq!(entry.key, "github");
    }

    #[test]
    fn match_host_returns_none_for_unknown_host() {
        assert!(match_host("https://example.com").is_none());
    }

    #[test]
    fn oauth_entries_carry_token_url() {
        let entry = lookup("github").unwrap();
        let oauth = entry.oauth.as_ref().expect("github should carry oauth defaults");
        assert_eq!(oauth.token_url, "https://github.com/login/oauth/access_token");
    }

    #[test]
    fn list_is_sorted_and_non_empty() {
        let entries = list();
        assert!(entries.len() >= 5);
        let keys: Vec<&str> = entries.iter().map(|e| e.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
