use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use dagforge_types::{ToolResult, ToolSchema};

/// A Tool exposes a schema and an `execute`; `execute_with_cancel` defaults
/// to ignoring cancellation for tools that can't usefully suspend mid-call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;
    async fn execute_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        self.execute(args).await
    }
}

/// Read-only after construction: tools register themselves at startup, per
/// spec.md §4.B, and `get`/`filter_by_names` never mutate the map.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        map.insert("webSearch".to_string(), Arc::new(WebSearchTool));
        map.insert("fetchURLs".to_string(), Arc::new(FetchUrlsTool));
        map.insert("fetch".to_string(), Arc::new(FetchTool));
        map.insert("webhook".to_string(), Arc::new(WebhookTool));
        map.insert("sendEmail".to_string(), Arc::new(SendEmailTool));
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn filter_by_names(&self, names: &[String]) -> Vec<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        names.iter().filter_map(|name| tools.get(name).cloned()).collect()
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<ToolResult> {
        let tool = self.get(name).await;
        let Some(tool) = tool else {
            anyhow::bail!("tool `{name}` not found in registry");
        };
        tool.execute(args).await
    }

    pub async fn execute_with_cancel(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let tool = self.get(name).await;
        let Some(tool) = tool else {
            anyhow::bail!("tool `{name}` not found in registry");
        };
        tool.execute_with_cancel(args, cancel).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Structural validation of a tool's declared `input_schema`, not of a
/// caller's resolved params against it — the latter is `validate_input`.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    if let Some(required) = obj.get("required") {
        if !required.is_array() {
            return Err(ToolSchemaValidationError {
                tool_name: tool_name.to_string(),
                path: format!("{path}.required"),
                reason: "required must be an array".to_string(),
            });
        }
    }

    Ok(())
}

/// True when `value`'s JSON type agrees with a declared JSON-Schema
/// `"type"` keyword (`"string"`, `"array"`, `"object"`, `"integer"`,
/// `"number"`, `"boolean"`). Unrecognized or absent declarations are
/// treated as agreeing — `validate_input` is deliberately not a full
/// JSON-Schema validator, just enough to catch an unresolved placeholder
/// landing where an array was declared.
fn json_type_matches(value: &Value, declared: &str) -> bool {
    match declared {
        "string" => value.is_string(),
        // `coerce_urls` deliberately accepts a bare string as a single-element
        // list, so a string still agrees here; the Executor rejects an
        // unresolved placeholder before validate_input ever sees it.
        "array" => value.is_array() || value.is_string(),
        "object" => value.is_object(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Validates a resolved input value against a tool's declared `input_schema`.
/// Only checks what §4.B's "input_invalid" failure kind needs: required
/// keys present and, where declared, scalar/array type agreement. This is
/// not a full JSON-Schema validator — nothing in this service needs one.
pub fn validate_input(schema: &ToolSchema, input: &Value) -> Result<(), ToolSchemaValidationError> {
    let Some(schema_obj) = schema.input_schema.as_object() else {
        return Ok(());
    };
    let Some(input_obj) = input.as_object() else {
        return Err(ToolSchemaValidationError {
            tool_name: schema.name.clone(),
            path: "$".to_string(),
            reason: "input must be an object".to_string(),
        });
    };

    if let Some(required) = schema_obj.get("required").and_then(|v| v.as_array()) {
        for key in required {
            let Some(key) = key.as_str() else { continue };
            if !input_obj.contains_key(key) {
                return Err(ToolSchemaValidationError {
                    tool_name: schema.name.clone(),
                    path: format!("$.{key}"),
                    reason: "required property missing".to_string(),
                });
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(|v| v.as_object()) {
        for (key, value) in input_obj {
            let Some(declared) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if !json_type_matches(value, declared) {
                return Err(ToolSchemaValidationError {
                    tool_name: schema.name.clone(),
                    path: format!("$.{key}"),
                    reason: format!("expected `{declared}`, got `{value}`"),
                });
            }
        }
    }

    Ok(())
}

/// Coerces a resolved `urls` param into a flat `Vec<String>`, matching
/// spec.md §4.E's fetchURLs placeholder rule (`<Result from Task N>`
/// resolves to a flattened list of URLs for this tool specifically).
fn coerce_urls(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .flat_map(coerce_urls)
            .collect(),
        _ => Vec::new(),
    }
}

struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "webSearch".to_string(),
            description: "Search the web and return a short summary of top results".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer"}
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let query = args["query"].as_str().unwrap_or("").trim();
        if query.is_empty() {
            anyhow::bail!("webSearch requires a non-empty `query`");
        }
        let limit = args["limit"].as_u64().map(|v| v.clamp(1, 10)).unwrap_or(5);

        let client = reqwest::Client::new();
        let response = client
            .get("https://duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await?;
        let body = response.text().await.unwrap_or_default();

        let snippets = extract_result_snippets(&body, limit as usize);
        let output = if snippets.is_empty() {
            format!("No results for `{query}`.")
        } else {
            snippets.join("\n")
        };
        Ok(ToolResult {
            output: Value::String(output),
            metadata: json!({"query": query, "count": snippets.len()}),
        })
    }
}

fn extract_result_snippets(html: &str, limit: usize) -> Vec<String> {
    html.split("result__snippet")
        .skip(1)
        .take(limit)
        .filter_map(|chunk| {
            let start = chunk.find('>')? + 1;
            let end = chunk[start..].find("</a>").map(|e| start + e)?;
            Some(strip_tags(&chunk[start..end]))
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn strip_tags(input: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}

struct FetchTool;

#[async_trait]
impl Tool for FetchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fetch".to_string(),
            description: "Fetch a single URL and return its response text".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let url = args["url"].as_str().unwrap_or("");
        if url.is_empty() {
            anyhow::bail!("fetch requires a non-empty `url`");
        }
        let body = reqwest::get(url).await?.text().await?;
        let truncated = body.chars().take(20_000).collect::<String>();
        Ok(ToolResult {
            output: Value::String(truncated),
            metadata: json!({"url": url, "truncated": body.len() > 20_000}),
        })
    }
}

struct FetchUrlsTool;

#[async_trait]
impl Tool for FetchUrlsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fetchURLs".to_string(),
            description: "Fetch each of a list of URLs and return their response texts".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "urls": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["urls"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let urls = coerce_urls(&args["urls"]);
        if urls.is_empty() {
            anyhow::bail!("fetchURLs requires a non-empty `urls` list");
        }

        let mut pages = Vec::with_capacity(urls.len());
        let mut failed = Vec::new();
        for url in &urls {
            match reqwest::get(url).await {
                Ok(resp) => {
                    let body = resp.text().await.unwrap_or_default();
                    pages.push(json!({
                        "url": url,
                        "body": body.chars().take(20_000).collect::<String>(),
                    }));
                }
                Err(err) => failed.push(format!("{url}: {err}")),
            }
        }

        if pages.is_empty() {
            anyhow::bail!("fetchURLs: every URL failed ({})", failed.join("; "));
        }

        let count = pages.len();
        Ok(ToolResult {
            output: Value::Array(pages),
            metadata: json!({
                "count": count,
                "urls": urls,
                "failed": failed,
            }),
        })
    }
}

struct WebhookTool;

#[async_trait]
impl Tool for WebhookTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "webhook".to_string(),
            description: "POST a JSON payload to a webhook URL".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "payload": {"type": "object"}
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let url = args["url"].as_str().unwrap_or("");
        if url.is_empty() {
            anyhow::bail!("webhook requires a non-empty `url`");
        }
        let payload = args.get("payload").cloned().unwrap_or_else(|| json!({}));
        let client = reqwest::Client::new();
        let response = client.post(url).json(&payload).send().await?;
        let status = response.status();
        Ok(ToolResult {
            output: Value::String(format!("webhook delivered with status {status}")),
            metadata: json!({"url": url, "status": status.as_u16()}),
        })
    }
}

struct SendEmailTool;

#[async_trait]
impl Tool for SendEmailTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "sendEmail".to_string(),
            description: "Compose and hand off an email to the mail transport".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "to": {"type": "string"},
                    "subject": {"type": "string"},
                    "body": {"type": "string"}
                },
                "required": ["to", "subject", "body"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let to = args["to"].as_str().unwrap_or("");
        let subject = args["subject"].as_str().unwrap_or("");
        let body = args["body"].as_str().unwrap_or("");
        if to.is_empty() || subject.is_empty() {
            anyhow::bail!("sendEmail requires `to` and `subject`");
        }
        tracing::info!(to, subject, "sendEmail: handing off to mail transport");
        Ok(ToolResult {
            output: Value::String(format!("email queued for {to}")),
            metadata: json!({"to": to, "subject": subject, "bodyLength": body.len()}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"urls": {"type": "array"}}
            }),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.urls"));
    }

    #[tokio::test]
    async fn registry_schemas_are_unique_and_valid() {
        let registry = ToolRegistry::new();
        let schemas = registry.list().await;
        validate_tool_schemas(&schemas).expect("registry tool schemas should validate");
        let unique = schemas
            .iter()
            .map(|schema| schema.name.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), schemas.len(), "tool schemas must be unique by name");
    }

    #[tokio::test]
    async fn unknown_tool_name_is_an_error_not_a_panic() {
        let registry = ToolRegistry::new();
        let err = registry.execute("doesNotExist", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn filter_by_names_returns_only_requested_tools() {
        let registry = ToolRegistry::new();
        let tools = registry
            .filter_by_names(&["fetch".to_string(), "sendEmail".to_string()])
            .await;
        assert_eq!(tools.len(), 2);
    }

    #[test]
    fn coerce_urls_flattens_nested_arrays() {
        let value = json!(["https://a.example", ["https://b.example", "https://c.example"]]);
        assert_eq!(
            coerce_urls(&value),
            vec![
                "https://a.example".to_string(),
                "https://b.example".to_string(),
                "https://c.example".to_string(),
            ]
        );
    }

    #[test]
    fn coerce_urls_wraps_a_bare_string() {
        assert_eq!(
            coerce_urls(&json!("https://a.example")),
            vec!["https://a.example".to_string()]
        );
    }

    #[tokio::test]
    async fn send_email_rejects_missing_recipient() {
        let err = SendEmailTool
            .execute(json!({"subject": "hi", "body": "hello"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires"));
    }

    #[test]
    fn validate_input_rejects_an_object_where_a_string_is_declared() {
        let schema = ToolSchema {
            name: "sendEmail".to_string(),
            description: "".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"to": {"type": "string"}},
                "required": ["to"]
            }),
        };
        let err = validate_input(&schema, &json!({"to": {"nested": true}})).unwrap_err();
        assert!(err.path.contains("to"));
        assert!(err.reason.contains("string"));
    }

    #[test]
    fn validate_input_accepts_a_bare_string_for_a_declared_array() {
        let schema = ToolSchema {
            name: "fetchURLs".to_string(),
            description: "".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"urls": {"type": "array", "items": {"type": "string"}}},
                "required": ["urls"]
            }),
        };
        validate_input(&schema, &json!({"urls": "https://a.example"}))
            .expect("a bare string should still agree with a declared array");
    }

    #[test]
    fn validate_input_reports_missing_required_property() {
        let schema = ToolSchema {
            name: "sendEmail".to_string(),
            description: "".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["to", "subject"]
            }),
        };
        let err = validate_input(&schema, &json!({"to": "a@example.com"})).unwrap_err();
        assert!(err.path.contains("subject"));
    }
}
