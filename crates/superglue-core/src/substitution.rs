// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolves `{var}`, `{{var}}`, and `<<var>>` placeholders against a flat
//! variable scope. A single, non-recursive pass: a resolved value is never
//! re-scanned for further placeholders.

use serde_json::Value;
use std::collections::HashMap;

/// A flat variable scope: scalar values, or whole JSON values for variables
/// that are consumed structurally rather than interpolated into a string.
pub type VariableScope = HashMap<String, Value>;

/// Merges scopes left-to-right; later maps win on key collision, matching
/// spec's `{...payload, ...credentials, ...paginationVars}` ordering.
pub fn merge_scopes(scopes: &[&VariableScope]) -> VariableScope {
    let mut merged = VariableScope::new();
    for scope in scopes {
        for (k, v) in scope.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

fn value_to_interp_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "undefined".to_string(),
        other => other.to_string(),
    }
}

/// Substitutes every placeholder occurring in `template` from `scope`.
///
/// Recognizes, in order of precedence at each position, `{{name}}`,
/// `<<name>>`, and `{name}`. A name that isn't present in scope is replaced
/// with the literal string `"undefined"` rather than left untouched or
/// erroring — callers are expected to filter undefined/empty values out of
/// the final header/query maps themselves.
pub fn substitute(template: &str, scope: &VariableScope) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '{' && chars.get(i + 1) == Some(&'{') {
            if let Some(end) = find_close(&chars, i + 2, '}', '}') {
                let name: String = chars[i + 2..end].iter().collect();
                out.push_str(&resolve(&name, scope));
                i = end + 2;
                continue;
            }
        }
        if chars[i] == '<' && chars.get(i + 1) == Some(&'<') {
            if let Some(end) = find_close(&chars, i + 2, '>', '>') {
                let name: String = chars[i + 2..end].iter().collect();
                out.push_str(&resolve(&name, scope));
                i = end + 2;
                continue;
            }
        }
        if chars[i] == '{' {
            if let Some(end) = find_single_close(&chars, i + 1, '}') {
                let name: String = chars[i + 1..end].iter().collect();
                out.push_str(&resolve(&name, scope));
                i = end + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}

fn resolve(name: &str, scope: &VariableScope) -> String {
    let trimmed = name.trim();
    match scope.get(trimmed) {
        Some(value) => value_to_interp_string(value),
        None => "undefined".to_string(),
    }
}

/// Finds the index of the first `c1 c2` pair at or after `from`.
fn find_close(chars: &[char], from: usize, c1: char, c2: char) -> Option<usize> {
    let mut j = from;
    while j + 1 < chars.len() {
        if chars[j] == c1 && chars[j + 1] == c2 {
            return Some(j);
        }
        j += 1;
    }
    None
}

fn find_single_close(chars: &[char], from: usize, c: char) -> Option<usize> {
    let mut j = from;
    while j < chars.len() {
        if chars[j] == c {
            return Some(j);
        }
        j += 1;
    }
    None
}

/// Applies [`substitute`] to every string value in a header/query map,
/// dropping entries whose resolved value is empty, `"undefined"`, or
/// `"null"`.
pub fn substitute_map(
    map: &HashMap<String, String>,
    scope: &VariableScope,
) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| {
            let resolved = substitute(v, scope);
            if resolved.is_empty() || resolved == "undefined" || resolved == "null" {
                None
            } else {
                Some((k.clone(), resolved))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with(pairs: &[(&str, &str)]) -> VariableScope {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn substitutes_all_three_forms() {
        let scope = scope_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
        assert_eq!(substitute("{a}-{{b}}-<<c>>", &scope), "1-2-3");
    }

    #[test]
    fn missing_variable_renders_undefined() {
        let scope = VariableScope::new();
        assert_eq!(substitute("{missing}", &scope), "undefined");
    }

    #[test]
    fn substitution_is_not_recursive() {
        // If `a` resolves to "{b}" it must not be re-scanned for `{b}`.
        let mut scope = VariableScope::new();
        scope.insert("a".to_string(), Value::String("{b}".to_string()));
        scope.insert("b".to_string(), Value::String("real".to_string()));
        assert_eq!(substitute("{a}", &scope), "{b}");
    }

    #[test]
    fn substitute_map_filters_undefined_and_empty() {
        let scope = scope_with(&[("present", "value")]);
        let mut input = HashMap::new();
        input.insert("keep".to_string(), "{present}".to_string());
        input.insert("drop_missing".to_string(), "{missing}".to_string());
        input.insert("drop_empty".to_string(), "".to_string());

        let result = substitute_map(&input, &scope);
        assert_eq!(result.len(), 1);
        assert_eq!(result.get("keep"), Some(&"value".to_string()));
    }
}
