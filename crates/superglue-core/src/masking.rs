// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Credential masking, applied to every error message and log line that
//! could otherwise leak a secret to the client or to the LLM.

use std::collections::HashMap;

/// Replaces every occurrence of a known credential value with a placeholder.
///
/// Values shorter than 4 characters are skipped: masking them would corrupt
/// unrelated text (short values collide with ordinary words) without
/// meaningfully protecting anything.
pub fn mask_credentials(text: &str, credentials: &HashMap<String, serde_json::Value>) -> String {
    let mut masked = text.to_string();
    for value in credentials.values() {
        if let Some(s) = value.as_str() {
            if s.len() >= 4 {
                masked = masked.replace(s, "****");
            }
        }
    }
    masked
}

/// Convenience wrapper over a flat string map, used at call sites that only
/// have the resolved scalar credential values (not full JSON values).
pub fn mask_credentials_flat(text: &str, credentials: &HashMap<String, String>) -> String {
    let mut masked = text.to_string();
    for value in credentials.values() {
        if value.len() >= 4 {
            masked = masked.replace(value.as_str(), "****");
        }
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_known_credential_values() {
        let mut creds = HashMap::new();
        creds.insert(
            "apiKey".to_string(),
            serde_json::Value::String("sk-super-secret-123".to_string()),
        );

        let text = "request failed: invalid key sk-super-secret-123 provided";
        let masked = mask_credentials(text, &creds);

        assert!(!masked.contains("sk-super-secret-123"));
        assert!(masked.contains("****"));
    }

    #[test]
    fn skips_short_values() {
        let mut creds = HashMap::new();
        creds.insert("id".to_string(), serde_json::Value::String("ab".to_string()));

        let text = "id: ab not found";
        let masked = mask_credentials(text, &creds);
        assert_eq!(masked, text);
    }
}
