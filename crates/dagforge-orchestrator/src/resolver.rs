use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// The placeholder DSL from spec §4.E: `<Result from Task N>` or
/// `<Results of Task N>`, case-insensitive on the two variant words.
fn placeholder_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<results?\s+(?:from|of)\s+task\s+([^>]+)>").expect("static regex")
    })
}

/// Permissive URL grammar for rule 2: `http(s)://…` or a bare `host.tld/…`.
/// Bare hosts are prepended with `https://`.
fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"https?://[^\s<>"']+|(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}(?:/[^\s<>"']*)?"#,
        )
        .expect("static regex")
    })
}

fn extract_urls(text: &str) -> Vec<String> {
    url_pattern()
        .find_iter(text)
        .map(|m| {
            let found = m.as_str();
            if found.starts_with("http://") || found.starts_with("https://") {
                found.to_string()
            } else {
                format!("https://{found}")
            }
        })
        .collect()
}

pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Collects the URLs a fetchURLs placeholder should expand to, per rule 2:
/// a list of `{url, ...}` objects contributes their `url` fields; a string
/// result is scanned with the URL grammar; anything else contributes none.
fn urls_from_result(result: &Value) -> Vec<String> {
    match result {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("url").and_then(|u| u.as_str()))
            .map(str::to_string)
            .collect(),
        Value::String(s) => extract_urls(s),
        _ => Vec::new(),
    }
}

/// Resolves one placeholder-bearing string for the fetchURLs tool. Returns
/// `Some(urls)` when every placeholder in the string resolved; `None` when
/// at least one referenced task id is missing from `results` (rule 4: the
/// whole param is left untouched so the Executor observes a missing
/// dependency rather than a partial, silently-incomplete URL list).
fn resolve_fetch_urls_value(text: &str, results: &HashMap<String, Value>) -> Option<Vec<String>> {
    let mut urls = Vec::new();
    let mut saw_placeholder = false;
    for captures in placeholder_pattern().captures_iter(text) {
        saw_placeholder = true;
        let task_id = captures[1].trim();
        let Some(result) = results.get(task_id) else {
            return None;
        };
        urls.extend(urls_from_result(result));
    }
    if !saw_placeholder {
        return None;
    }
    Some(urls)
}

/// Resolves one placeholder-bearing string for any tool/inference action
/// other than fetchURLs, per rule 3: textual, in-place replacement,
/// preserving surrounding string structure. Rule 4 applies per-occurrence:
/// an unresolved placeholder is left as literal text.
fn resolve_textual_value(text: &str, results: &HashMap<String, Value>) -> String {
    placeholder_pattern()
        .replace_all(text, |captures: &regex::Captures| {
            let task_id = captures[1].trim();
            match results.get(task_id) {
                Some(result) => stringify(result),
                None => captures[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolves every value in a SubTask's `params` against prior task results,
/// per spec §4.E. `tool_name` selects the fetchURLs special case; pass the
/// tool's own name for tool actions, or the prompt id for inference actions
/// (inference never matches "fetchURLs", so it always takes rule 3).
pub fn resolve_params(
    tool_name: &str,
    params: &HashMap<String, Value>,
    results: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let is_fetch_urls = tool_name == "fetchURLs";
    params
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                Value::String(text) if is_fetch_urls => {
                    match resolve_fetch_urls_value(text, results) {
                        Some(urls) => {
                            Value::Array(urls.into_iter().map(Value::String).collect())
                        }
                        None => value.clone(),
                    }
                }
                Value::String(text) => Value::String(resolve_textual_value(text, results)),
                other => other.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

/// True when `resolve_params` left at least one placeholder unresolved
/// (rule 4): a missing dependency, surfaced as a literal `<Result from Task
/// N>` string still sitting in a resolved param. The Executor checks this
/// before dispatch so a missing-dependency task is marked `blocked` instead
/// of being handed a garbage literal as input.
pub(crate) fn has_unresolved_placeholder(params: &HashMap<String, Value>) -> bool {
    fn value_has_placeholder(value: &Value) -> bool {
        match value {
            Value::String(s) => placeholder_pattern().is_match(s),
            Value::Array(items) => items.iter().any(value_has_placeholder),
            Value::Object(map) => map.values().any(value_has_placeholder),
            _ => false,
        }
    }
    params.values().any(value_has_placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolving_with_empty_results_is_a_no_op() {
        let mut params = HashMap::new();
        params.insert("query".to_string(), json!("<Result from Task 1>"));
        let resolved = resolve_params("webSearch", &params, &HashMap::new());
        assert_eq!(resolved["query"], json!("<Result from Task 1>"));
    }

    #[test]
    fn resolving_twice_with_the_same_results_is_idempotent() {
        let mut results = HashMap::new();
        results.insert("1".to_string(), json!("astronomy news"));
        let mut params = HashMap::new();
        params.insert("summary".to_string(), json!("summarise <Result from Task 1>"));

        let once = resolve_params("summarizer", &params, &results);
        let twice = resolve_params("summarizer", &once, &results);
        assert_eq!(once, twice);
    }

    #[test]
    fn textual_replace_preserves_surrounding_structure() {
        let mut results = HashMap::new();
        results.insert("1".to_string(), json!("42 widgets"));
        let mut params = HashMap::new();
        params.insert(
            "prompt".to_string(),
            json!("There were <Results of Task 1> in stock."),
        );
        let resolved = resolve_params("inference-prompt", &params, &results);
        assert_eq!(resolved["prompt"], json!("There were 42 widgets in stock."));
    }

    #[test]
    fn non_string_result_is_stringified_as_json() {
        let mut results = HashMap::new();
        results.insert("1".to_string(), json!({"count": 3}));
        let mut params = HashMap::new();
        params.insert("note".to_string(), json!("counted: <Result from Task 1>"));
        let resolved = resolve_params("inference-prompt", &params, &results);
        assert_eq!(resolved["note"], json!("counted: {\"count\":3}"));
    }

    #[test]
    fn fetch_urls_flattens_a_string_result_via_url_grammar() {
        let mut results = HashMap::new();
        results.insert(
            "1".to_string(),
            json!("Visit https://a.example and b.example/path"),
        );
        let mut params = HashMap::new();
        params.insert("urls".to_string(), json!("<Result from Task 1>"));
        let resolved = resolve_params("fetchURLs", &params, &results);
        assert_eq!(
            resolved["urls"],
            json!(["https://a.example", "https://b.example/path"])
        );
    }

    #[test]
    fn fetch_urls_collects_url_fields_from_a_list_of_objects() {
        let mut results = HashMap::new();
        results.insert(
            "1".to_string(),
            json!([{"url": "https://a.example"}, {"url": "https://b.example"}]),
        );
        let mut params = HashMap::new();
        params.insert("urls".to_string(), json!("<Result from Task 1>"));
        let resolved = resolve_params("fetchURLs", &params, &results);
        assert_eq!(resolved["urls"], json!(["https://a.example", "https://b.example"]));
    }

    #[test]
    fn fetch_urls_concatenates_multiple_placeholders_in_order() {
        let mut results = HashMap::new();
        results.insert("1".to_string(), json!("https://a.example"));
        results.insert("2".to_string(), json!("https://b.example"));
        let mut params = HashMap::new();
        params.insert(
            "urls".to_string(),
            json!("<Result from Task 1> <Result from Task 2>"),
        );
        let resolved = resolve_params("fetchURLs", &params, &results);
        assert_eq!(resolved["urls"], json!(["https://a.example", "https://b.example"]));
    }

    #[test]
    fn missing_dependency_leaves_placeholder_untouched() {
        let mut params = HashMap::new();
        params.insert("urls".to_string(), json!("<Result from Task 9>"));
        let resolved = resolve_params("fetchURLs", &params, &HashMap::new());
        assert_eq!(resolved["urls"], json!("<Result from Task 9>"));
    }

    #[test]
    fn non_string_params_pass_through_unchanged() {
        let mut params = HashMap::new();
        params.insert("limit".to_string(), json!(5));
        let resolved = resolve_params("webSearch", &params, &HashMap::new());
        assert_eq!(resolved["limit"], json!(5));
    }

    #[test]
    fn detects_an_unresolved_placeholder_left_by_a_missing_dependency() {
        let mut params = HashMap::new();
        params.insert("urls".to_string(), json!("<Result from Task 9>"));
        let resolved = resolve_params("fetchURLs", &params, &HashMap::new());
        assert!(has_unresolved_placeholder(&resolved));
    }

    #[test]
    fn does_not_flag_params_with_no_placeholder_left() {
        let mut results = HashMap::new();
        results.insert("1".to_string(), json!("https://a.example"));
        let mut params = HashMap::new();
        params.insert("urls".to_string(), json!("<Result from Task 1>"));
        let resolved = resolve_params("fetchURLs", &params, &results);
        assert!(!has_unresolved_placeholder(&resolved));
    }
}
