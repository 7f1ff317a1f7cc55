// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives repeated calls against a paginated `ApiConfig`, accumulating each
//! page's extracted data until a stop condition fires.
//!
//! Three pagination styles are supported (`OFFSET_BASED`, `PAGE_BASED`,
//! `CURSOR_BASED`), plus `DISABLED` for a single call. Two distinct
//! termination algorithms apply depending on whether the endpoint declares a
//! `stopCondition`:
//!
//! - **Without** one, the driver stops as soon as a page comes back shorter
//!   than `pageSize` (non-cursor modes) or the cursor path goes null
//!   (cursor mode), or a previously-seen page repeats. Ceiling:
//!   [`HARD_ITERATION_CEILING`].
//! - **With** one, the driver hashes each extracted page: two identical
//!   non-empty pages back to back is a misconfiguration (`PaginationConfigError`),
//!   two empty pages with a condition that never fired is a
//!   `StopConditionError`, and a repeat of the previous page after that
//!   terminates silently. Ceiling: [`MAX_PAGINATION_REQUESTS`].

use crate::config::{ApiConfig, Pagination, PaginationType};
use crate::error::{OrchestratorError, Result};
use crate::expression;
use crate::http_caller::HttpResponse;
use crate::substitution::VariableScope;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// What `PaginationDriver::run` hands back: the accumulated/extracted data
/// plus the status and headers of the *last* page fetched — per the step
/// executor's `{data, statusCode, headers}` contract, status and headers
/// come from the final iteration, not the first.
#[derive(Debug, Clone)]
pub struct PaginatedResult {
    pub data: Value,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// Hard stop when no `stopCondition` is configured — guards against an API
/// that never returns an empty page.
pub const HARD_ITERATION_CEILING: usize = 500;

/// Hard stop when a `stopCondition` *is* configured — a much higher ceiling
/// since the condition is expected to do the real stopping.
pub const MAX_PAGINATION_REQUESTS: usize = 1000;

/// One invocation of the underlying transport (HTTP or Postgres), abstracted
/// so the driver doesn't care which.
#[async_trait::async_trait]
pub trait PageFetcher {
    async fn fetch_page(&self, config: &ApiConfig, scope: &VariableScope) -> Result<HttpResponse>;
}

pub struct PaginationDriver<'a, F: PageFetcher> {
    fetcher: &'a F,
}

impl<'a, F: PageFetcher> PaginationDriver<'a, F> {
    pub fn new(fetcher: &'a F) -> Self {
        Self { fetcher }
    }

    /// Runs the full pagination loop for `config`. Non-paginated (or
    /// `DISABLED`) configs return the extracted response as-is; paginated
    /// ones return an array (collapsed to its sole element if only one page
    /// of data was accumulated), or for `CURSOR_BASED` pagination
    /// `{next_cursor, results: [...]}` (spread as `{next_cursor, ...obj}`
    /// when every page was a single object rather than a list).
    pub async fn run(&self, config: &ApiConfig, base_scope: &VariableScope) -> Result<PaginatedResult> {
        let Some(pagination) = &config.pagination else {
            return self.fetch_single(config, base_scope).await;
        };
        if pagination.pagination_type == PaginationType::Disabled {
            return self.fetch_single(config, base_scope).await;
        }

        self.paginate(config, pagination, base_scope).await
    }

    async fn fetch_single(&self, config: &ApiConfig, scope: &VariableScope) -> Result<PaginatedResult> {
        let response = self.fetcher.fetch_page(config, scope).await?;
        reject_bad_body(&response)?;
        let data = extract_data(config, &response)?;
        Ok(PaginatedResult {
            data,
            status: response.status,
            headers: response.headers,
        })
    }

    async fn paginate(&self, config: &ApiConfig, pagination: &Pagination, base_scope: &VariableScope) -> Result<PaginatedResult> {
        let has_stop_condition = pagination.stop_condition.is_some();
        let ceiling = if has_stop_condition {
            MAX_PAGINATION_REQUESTS
        } else {
            HARD_ITERATION_CEILING
        };
        let page_size = pagination.page_size_usize();

        let mut accumulated: Vec<Value> = Vec::new();
        let mut all_pages_were_objects = true;
        let mut seen_hashes: HashSet<String> = HashSet::new();
        let mut first_hash: Option<String> = None;
        let mut previous_hash: Option<String> = None;
        let mut first_iteration_empty = false;

        let mut page = 1usize;
        let mut offset = 0usize;
        let mut cursor: Option<String> = None;
        let mut last_next_cursor: Option<String> = None;
        let mut last_status: u16 = 0;
        let mut last_headers: HashMap<String, String> = HashMap::new();

        for iteration in 1..=ceiling {
            let mut scope = base_scope.clone();
            scope.insert("pageSize".to_string(), serde_json::json!(page_size));
            scope.insert("limit".to_string(), serde_json::json!(page_size));
            match pagination.pagination_type {
                PaginationType::OffsetBased => {
                    scope.insert("offset".to_string(), serde_json::json!(offset));
                }
                PaginationType::PageBased => {
                    scope.insert("page".to_string(), serde_json::json!(page));
                }
                PaginationType::CursorBased => {
                    scope.insert(
                        "cursor".to_string(),
                        cursor.clone().map(Value::String).unwrap_or(Value::Null),
                    );
                }
                PaginationType::Disabled => unreachable!("handled by caller"),
            }

            let response = self.fetcher.fetch_page(config, &scope).await?;
            reject_bad_body(&response)?;

            last_status = response.status;
            last_headers = response.headers.clone();

            let extracted = extract_data(config, &response)?;
            let is_array = extracted.is_array();
            if !is_array && !extracted.is_null() {
                all_pages_were_objects = all_pages_were_objects && extracted.is_object();
            } else if is_array {
                all_pages_were_objects = false;
            }
            let is_empty = is_value_empty(&extracted);
            let hash = hash_response(&extracted);

            let next_cursor = pagination
                .cursor_path
                .as_ref()
                .and_then(|path| json_path(&response.body, path))
                .and_then(|v| v.as_str().map(str::to_string));
            last_next_cursor = next_cursor.clone();

            if has_stop_condition {
                if iteration == 1 {
                    first_hash = Some(hash.clone());
                    first_iteration_empty = is_empty;
                } else if iteration == 2 && Some(&hash) == first_hash.as_ref() && !is_empty {
                    return Err(OrchestratorError::PaginationConfigError(
                        "pagination parameters are not varying between requests (identical first two pages)"
                            .to_string(),
                    ));
                }

                let repeats_previous = iteration > 2 && Some(&hash) == previous_hash.as_ref();

                let total_fetched = accumulated.len();
                let page_info = serde_json::json!({
                    "page": page,
                    "offset": offset,
                    "cursor": cursor,
                    "pageSize": page_size,
                    "totalFetched": total_fetched,
                });
                let condition_fired = if repeats_previous {
                    false
                } else {
                    let ctx = serde_json::json!({ "response": &extracted, "pageInfo": page_info });
                    let expr_source = pagination.stop_condition.as_ref().unwrap();
                    let result = expression::evaluate_bounded(expr_source, &ctx, expression::DEFAULT_EVALUATION_TIMEOUT)
                        .await
                        .map_err(|e| OrchestratorError::StopConditionError(e.to_string()))?;
                    expression::is_truthy(&result)
                };

                if iteration == 2 && first_iteration_empty && is_empty && !condition_fired {
                    return Err(OrchestratorError::StopConditionError(
                        "stop condition did not fire after two consecutive empty responses".to_string(),
                    ));
                }

                accumulate(&mut accumulated, extracted);
                previous_hash = Some(hash);

                if repeats_previous || condition_fired {
                    break;
                }

                if pagination.pagination_type == PaginationType::CursorBased && next_cursor.is_none() {
                    break;
                }
            } else {
                if !seen_hashes.insert(hash) {
                    // Previously-seen page: pagination isn't advancing. Stop
                    // without accumulating this repeat.
                    break;
                }

                accumulate(&mut accumulated, extracted.clone());

                match pagination.pagination_type {
                    PaginationType::CursorBased => {
                        if next_cursor.is_none() {
                            break;
                        }
                    }
                    _ => {
                        if is_empty {
                            break;
                        }
                        if is_array && extracted.as_array().map(|a| a.len()).unwrap_or(0) < page_size {
                            break;
                        }
                        if !is_array {
                            // A single non-array page is accumulated once and
                            // the loop ends — there's no page-size signal to
                            // judge whether more data remains.
                            break;
                        }
                    }
                }
            }

            offset += page_size;
            page += 1;
            cursor = next_cursor;
        }

        Ok(PaginatedResult {
            data: finalize(pagination.pagination_type, accumulated, last_next_cursor, all_pages_were_objects),
            status: last_status,
            headers: last_headers,
        })
    }
}

/// Concatenates array pages, pushes scalar/object pages as single elements.
fn accumulate(accumulated: &mut Vec<Value>, extracted: Value) {
    match extracted {
        Value::Array(items) => accumulated.extend(items),
        Value::Null => {}
        other => accumulated.push(other),
    }
}

fn is_value_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn finalize(pagination_type: PaginationType, accumulated: Vec<Value>, cursor: Option<String>, all_objects: bool) -> Value {
    if pagination_type == PaginationType::CursorBased {
        if all_objects && accumulated.len() == 1 {
            let mut obj = match accumulated.into_iter().next() {
                Some(Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            obj.insert(
                "next_cursor".to_string(),
                cursor.map(Value::String).unwrap_or(Value::Null),
            );
            return Value::Object(obj);
        }
        return serde_json::json!({
            "next_cursor": cursor,
            "results": accumulated,
        });
    }

    if accumulated.len() == 1 {
        accumulated.into_iter().next().unwrap()
    } else {
        Value::Array(accumulated)
    }
}

/// Rejects a response whose body is an HTML document (wrong content type
/// entirely) or a JSON object carrying an `error` field or non-empty
/// `errors` array (a 2xx-wrapped application-level failure).
fn reject_bad_body(response: &HttpResponse) -> Result<()> {
    if let Value::String(s) = &response.body {
        let trimmed = s.trim_start();
        let head: String = trimmed.chars().take(100).collect::<String>().to_lowercase();
        if head.starts_with("<!doctype html") || head.starts_with("<html") {
            return Err(OrchestratorError::HtmlResponseError);
        }
    }

    if let Value::Object(map) = &response.body {
        if map.contains_key("error") {
            return Err(OrchestratorError::ApiCallError {
                status_code: Some(response.status),
                message: format!("response body contains an error field: {}", response.body),
            });
        }
        if let Some(Value::Array(errors)) = map.get("errors") {
            if !errors.is_empty() {
                return Err(OrchestratorError::ApiCallError {
                    status_code: Some(response.status),
                    message: format!("response body contains errors: {}", response.body),
                });
            }
        }
    }

    Ok(())
}

fn extract_data(config: &ApiConfig, response: &HttpResponse) -> Result<Value> {
    let body = match &response.body {
        Value::String(text) => parse_structured_body(text, &response.headers)?,
        other => other.clone(),
    };

    match &config.data_path {
        Some(path) => Ok(json_path(&body, path).unwrap_or(Value::Null)),
        None => Ok(body),
    }
}

/// Parses a non-JSON text body as CSV or XML based on content type, falling
/// back to the raw string when neither applies.
fn parse_structured_body(text: &str, headers: &std::collections::HashMap<String, String>) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        return Ok(json);
    }

    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.to_lowercase())
        .unwrap_or_default();

    if content_type.contains("csv") || (content_type.is_empty() && looks_like_csv(text)) {
        return parse_csv(text);
    }

    if content_type.contains("xml") || text.trim_start().starts_with("<?xml") {
        return parse_xml(text);
    }

    Ok(Value::String(text.to_string()))
}

fn looks_like_csv(text: &str) -> bool {
    let first_line = text.lines().next().unwrap_or("");
    first_line.contains(',') && !first_line.trim_start().starts_with('<')
}

fn parse_csv(text: &str) -> Result<Value> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| OrchestratorError::ExpressionError(format!("failed to read CSV headers: {e}")))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| OrchestratorError::ExpressionError(format!("invalid CSV row: {e}")))?;
        let mut obj = serde_json::Map::new();
        for (key, value) in headers.iter().zip(record.iter()) {
            obj.insert(key.to_string(), Value::String(value.to_string()));
        }
        rows.push(Value::Object(obj));
    }
    Ok(Value::Array(rows))
}

/// Converts a flat XML document into a JSON value: each element becomes an
/// object keyed by tag name, text content collapses to a string. Good
/// enough for the simple list-of-records feeds pagination deals with —
/// not a general XML-to-JSON mapping.
fn parse_xml(text: &str) -> Result<Value> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<(String, serde_json::Map<String, Value>)> = Vec::new();
    let mut root: Option<Value> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                stack.push((name, serde_json::Map::new()));
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if !text.is_empty() {
                    if let Some((_, obj)) = stack.last_mut() {
                        obj.insert("#text".to_string(), Value::String(text));
                    }
                }
            }
            Ok(Event::End(_)) => {
                if let Some((name, obj)) = stack.pop() {
                    let value = if obj.len() == 1 && obj.contains_key("#text") {
                        obj.get("#text").cloned().unwrap_or(Value::Null)
                    } else {
                        Value::Object(obj)
                    };
                    match stack.last_mut() {
                        Some((_, parent)) => {
                            insert_xml_child(parent, &name, value);
                        }
                        None => root = Some(value),
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(OrchestratorError::ExpressionError(format!(
                    "invalid XML document: {e}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(root.unwrap_or(Value::Null))
}

fn insert_xml_child(parent: &mut serde_json::Map<String, Value>, name: &str, value: Value) {
    match parent.get_mut(name) {
        Some(Value::Array(arr)) => arr.push(value),
        Some(existing) => {
            let previous = existing.clone();
            parent.insert(name.to_string(), Value::Array(vec![previous, value]));
        }
        None => {
            parent.insert(name.to_string(), value);
        }
    }
}

fn hash_response(body: &Value) -> String {
    let serialized = serde_json::to_string(body).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Minimal dot-path lookup (`"data.items"`) used for `cursor_path` and
/// `data_path` extraction — does not support array indices or wildcards.
fn json_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value.clone();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(mut map) => map.remove(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthenticationType, HttpMethod};
    use std::collections::HashMap;

    fn sample_config(data_path: Option<&str>, pagination: Option<Pagination>) -> ApiConfig {
        ApiConfig {
            id: "cfg".to_string(),
            url_host: "https://api.example.com".to_string(),
            url_path: String::new(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
            authentication: AuthenticationType::None,
            pagination,
            data_path: data_path.map(str::to_string),
            response_schema: None,
            response_mapping: None,
            instruction: String::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    struct ScriptedFetcher {
        pages: std::sync::Mutex<std::collections::VecDeque<Value>>,
    }

    #[async_trait::async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, _config: &ApiConfig, _scope: &VariableScope) -> Result<HttpResponse> {
            let mut pages = self.pages.lock().unwrap();
            let body = pages.pop_front().unwrap_or(Value::Null);
            Ok(HttpResponse {
                status: 200,
                body,
                headers: HashMap::new(),
            })
        }
    }

    #[tokio::test]
    async fn page_based_two_pages_accumulates_and_stops_on_short_page() {
        // Scenario 1: pageSize=2, [{id:1},{id:2}] then [{id:3}] -> 2 requests.
        let fetcher = ScriptedFetcher {
            pages: std::sync::Mutex::new(
                vec![
                    serde_json::json!({"items": [{"id": 1}, {"id": 2}]}),
                    serde_json::json!({"items": [{"id": 3}]}),
                ]
                .into(),
            ),
        };
        let pagination = Pagination {
            pagination_type: PaginationType::PageBased,
            page_size: "2".to_string(),
            cursor_path: None,
            stop_condition: None,
        };
        let config = sample_config(Some("items"), Some(pagination));
        let driver = PaginationDriver::new(&fetcher);
        let result = driver.run(&config, &VariableScope::new()).await.unwrap();
        assert_eq!(
            result.data,
            serde_json::json!([{"id": 1}, {"id": 2}, {"id": 3}])
        );
        assert_eq!(result.status, 200);
        assert_eq!(fetcher.pages.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn repeated_identical_page_terminates_without_error() {
        // Testable property: without a stopCondition, identical consecutive
        // pages terminate the loop after 2 requests rather than erroring.
        let fetcher = ScriptedFetcher {
            pages: std::sync::Mutex::new(
                std::iter::repeat(serde_json::json!({"items": [1]}))
                    .take(10)
                    .collect(),
            ),
        };
        let pagination = Pagination {
            pagination_type: PaginationType::PageBased,
            page_size: "1".to_string(),
            cursor_path: None,
            stop_condition: None,
        };
        let config = sample_config(Some("items"), Some(pagination));
        let driver = PaginationDriver::new(&fetcher);
        let result = driver.run(&config, &VariableScope::new()).await.unwrap();
        assert_eq!(result.data, serde_json::json!(1));
        // Exactly 2 requests made (10 - 8 left unconsumed).
        assert_eq!(fetcher.pages.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn cursor_based_pagination_follows_cursor_to_null() {
        // Scenario 3.
        let fetcher = ScriptedFetcher {
            pages: std::sync::Mutex::new(
                vec![
                    serde_json::json!({"data": [{"id": 1}, {"id": 2}], "meta": {"next_cursor": "c1"}}),
                    serde_json::json!({"data": [{"id": 3}], "meta": {"next_cursor": null}}),
                ]
                .into(),
            ),
        };
        let pagination = Pagination {
            pagination_type: PaginationType::CursorBased,
            page_size: "50".to_string(),
            cursor_path: Some("meta.next_cursor".to_string()),
            stop_condition: None,
        };
        let config = sample_config(Some("data"), Some(pagination));
        let driver = PaginationDriver::new(&fetcher);
        let result = driver.run(&config, &VariableScope::new()).await.unwrap();
        assert_eq!(
            result.data,
            serde_json::json!({"next_cursor": null, "results": [{"id": 1}, {"id": 2}, {"id": 3}]})
        );
    }

    #[tokio::test]
    async fn stop_condition_rejects_identical_nonempty_first_two_pages() {
        let fetcher = ScriptedFetcher {
            pages: std::sync::Mutex::new(
                std::iter::repeat(serde_json::json!({"items": [1]})).take(5).collect(),
            ),
        };
        let pagination = Pagination {
            pagination_type: PaginationType::PageBased,
            page_size: "1".to_string(),
            cursor_path: None,
            stop_condition: Some("pageInfo.page > 10".to_string()),
        };
        let config = sample_config(Some("items"), Some(pagination));
        let driver = PaginationDriver::new(&fetcher);
        let result = driver.run(&config, &VariableScope::new()).await;
        assert!(matches!(result, Err(OrchestratorError::PaginationConfigError(_))));
    }

    #[test]
    fn parse_csv_produces_array_of_objects() {
        let csv_text = "id,name\n1,alice\n2,bob";
        let value = parse_csv(csv_text).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{"id": "1", "name": "alice"}, {"id": "2", "name": "bob"}])
        );
    }

    #[test]
    fn json_path_navigates_nested_objects() {
        let value = serde_json::json!({"data": {"items": [1, 2]}});
        assert_eq!(json_path(&value, "data.items"), Some(serde_json::json!([1, 2])));
    }
}
