//! Capability table: the tools exposed by the HTTP and stdio transports.
//!
//! Every capability is a [`Tool`] with a name, a description and a JSON
//! Schema for its parameters. [`ToolRegistry::with_builtins`] builds the
//! table once at startup and refuses duplicate names; transports only ever
//! dispatch through [`ToolRegistry::call`], which validates parameters
//! against the schema before the tool runs.
//!
//! ```text
//! POST /tools/{name}  ─┐
//!                      ├─► ToolRegistry::call ─► validate_params ─► Tool::execute ─► KnowledgeService
//! stdin JSON line    ──┘
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;

use kb_ledger_core::history::HistoryQuery;
use kb_ledger_core::models::ChangeScope;
use kb_ledger_core::KbError;

use crate::ingest::IngestInput;
use crate::registry::NewRepository;
use crate::revert::UndoRequest;
use crate::service::{BrowseOp, KnowledgeService};

/// Parameters that do not match a tool's schema.
#[derive(Debug, Error)]
#[error("invalid parameters: {0}")]
pub struct InvalidParams(pub String);

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema (`"type": "object"`) for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Run with parameters already validated and defaulted.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// What a tool can reach while executing.
#[derive(Clone)]
pub struct ToolContext {
    pub service: Arc<KnowledgeService>,
}

impl ToolContext {
    pub fn new(service: Arc<KnowledgeService>) -> Self {
        Self { service }
    }
}

/// Entry in `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ═══════════════════════════════════════════════════════════════════════
// Parameter handling
// ═══════════════════════════════════════════════════════════════════════

/// Check `params` against `schema`: required fields, types and enums.
/// Missing properties with a `default` are filled in.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value, InvalidParams> {
    let params_obj = match params {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(InvalidParams(format!(
                "parameters must be an object, got {}",
                json_type_name(other)
            )))
        }
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    for field in &required {
        if params_obj.get(*field).map_or(true, Value::is_null) {
            return Err(InvalidParams(format!(
                "missing required parameter: {}",
                field
            )));
        }
    }

    let mut result = params_obj.clone();
    for (prop_name, prop_schema) in &properties {
        match params_obj.get(prop_name) {
            Some(Value::Null) | None => {
                if let Some(default) = prop_schema.get("default") {
                    result.insert(prop_name.clone(), default.clone());
                }
            }
            Some(value) => {
                if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
                    let type_ok = match expected {
                        "string" => value.is_string(),
                        "integer" => value.is_u64() || value.is_i64(),
                        "number" => value.is_number(),
                        "boolean" => value.is_boolean(),
                        "array" => value.is_array(),
                        "object" => value.is_object(),
                        _ => true,
                    };
                    if !type_ok {
                        return Err(InvalidParams(format!(
                            "parameter '{}' must be of type '{}', got {}",
                            prop_name,
                            expected,
                            json_type_name(value)
                        )));
                    }
                }
                if let Some(allowed) = prop_schema.get("enum").and_then(|e| e.as_array()) {
                    if !allowed.contains(value) {
                        let names: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                        return Err(InvalidParams(format!(
                            "parameter '{}' must be one of [{}], got {}",
                            prop_name,
                            names.join(", "),
                            value
                        )));
                    }
                }
                if let Some(min) = prop_schema.get("minimum").and_then(|m| m.as_i64()) {
                    if value.as_i64().is_some_and(|n| n < min) {
                        return Err(InvalidParams(format!(
                            "parameter '{}' must be >= {}",
                            prop_name, min
                        )));
                    }
                }
            }
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn repository_param(params: &Value) -> Result<&str> {
    match str_param(params, "repository").map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => bail!(InvalidParams("repository must not be empty".to_string())),
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| InvalidParams(e.to_string()).into())
}

fn scope_param(params: &Value, key: &str) -> Result<ChangeScope> {
    match str_param(params, key) {
        None => Ok(ChangeScope::Both),
        Some(s) => s.parse().map_err(|e: String| InvalidParams(e).into()),
    }
}

const REPOSITORY_PROPERTY: &str = "Repository name or id";

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tools
// ═══════════════════════════════════════════════════════════════════════

pub struct ListRepositoriesTool;

#[async_trait]
impl Tool for ListRepositoriesTool {
    fn name(&self) -> &str {
        "list_repositories"
    }

    fn description(&self) -> &str {
        "List registered repositories"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let repositories = ctx.service.list_repositories().await;
        Ok(json!({ "repositories": repositories }))
    }
}

pub struct GetRepositoryDetailsTool;

#[async_trait]
impl Tool for GetRepositoryDetailsTool {
    fn name(&self) -> &str {
        "get_repository_details"
    }

    fn description(&self) -> &str {
        "Show the configuration of one repository"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "repository": { "type": "string", "description": REPOSITORY_PROPERTY }
            },
            "required": ["repository"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let repository = ctx
            .service
            .get_repository_details(repository_param(&params)?)
            .await?;
        Ok(serde_json::to_value(repository)?)
    }
}

pub struct RegisterRepositoryTool;

#[async_trait]
impl Tool for RegisterRepositoryTool {
    fn name(&self) -> &str {
        "register_repository"
    }

    fn description(&self) -> &str {
        "Register a local directory or a remote git repository"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Unique repository name" },
                "type": { "type": "string", "enum": ["local", "remote"] },
                "knowledgeBaseRoot": { "type": "string", "description": "Path prefix for all knowledge-base content", "default": "" },
                "path": { "type": "string", "description": "Directory (local)" },
                "owner": { "type": "string", "description": "Repository owner (remote)" },
                "repoName": { "type": "string", "description": "Repository name on the host (remote)" },
                "branch": { "type": "string", "description": "Tracked branch (remote)" },
                "credentialAlias": { "type": "string", "description": "Alias resolved to a token through the environment (remote)" }
            },
            "required": ["name", "type"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let new: NewRepository = deserialize(params)?;
        let repository = ctx.service.register_repository(new).await?;
        Ok(json!({ "id": repository.id, "repository": repository }))
    }
}

pub struct IngestContentTool;

#[async_trait]
impl Tool for IngestContentTool {
    fn name(&self) -> &str {
        "ingest_content"
    }

    fn description(&self) -> &str {
        "Store text, a file or a web page and generate knowledge-base pages from it"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "repository": { "type": "string", "description": REPOSITORY_PROPERTY },
                "inputKind": { "type": "string", "enum": ["text", "file", "url"] },
                "title": { "type": "string", "description": "Title (text)" },
                "content": { "type": "string", "description": "Text content (text, or file as UTF-8)" },
                "filename": { "type": "string", "description": "Original file name (file)" },
                "contentBase64": { "type": "string", "description": "Base64 file bytes (file)" },
                "contentType": { "type": "string", "description": "MIME type (file)" },
                "url": { "type": "string", "description": "Page to fetch (url)" }
            },
            "required": ["repository", "inputKind"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let repository = repository_param(&params)?.to_string();
        let input: IngestInput = deserialize(params)?;
        let result = ctx.service.ingest_content(&repository, input).await?;
        Ok(serde_json::to_value(result)?)
    }
}

pub struct BrowseRepositoryTool;

#[async_trait]
impl Tool for BrowseRepositoryTool {
    fn name(&self) -> &str {
        "browse_repository"
    }

    fn description(&self) -> &str {
        "List a directory or read a file (read-only)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "repository": { "type": "string", "description": REPOSITORY_PROPERTY },
                "operation": { "type": "string", "enum": ["list_directory", "read_file"] },
                "path": { "type": "string", "description": "Repository-relative path", "default": "" }
            },
            "required": ["repository", "operation"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let repository = repository_param(&params)?;
        let op: BrowseOp = str_param(&params, "operation")
            .unwrap_or_default()
            .parse()
            .map_err(InvalidParams)?;
        let path = str_param(&params, "path").unwrap_or("");
        let result = ctx.service.browse(repository, op, path).await?;
        Ok(serde_json::to_value(result)?)
    }
}

pub struct SearchKnowledgeBaseTool;

#[async_trait]
impl Tool for SearchKnowledgeBaseTool {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn description(&self) -> &str {
        "Answer a question from the knowledge base"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "repository": { "type": "string", "description": REPOSITORY_PROPERTY },
                "query": { "type": "string", "description": "Question" }
            },
            "required": ["repository", "query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let repository = repository_param(&params)?;
        let query = str_param(&params, "query").unwrap_or("");
        if query.trim().is_empty() {
            bail!(InvalidParams("query must not be empty".to_string()));
        }
        let result = ctx.service.search_knowledge_base(repository, query).await?;
        Ok(serde_json::to_value(result)?)
    }
}

pub struct ListHistoryTool;

#[async_trait]
impl Tool for ListHistoryTool {
    fn name(&self) -> &str {
        "list_history"
    }

    fn description(&self) -> &str {
        "List recent changes, most recent first"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "repository": { "type": "string", "description": REPOSITORY_PROPERTY },
                "limit": { "type": "integer", "description": "Max changes", "minimum": 1 },
                "changeType": { "type": "string", "enum": ["file_upload", "knowledge_base_generation", "both"], "default": "both" },
                "includeReverted": { "type": "boolean", "default": false }
            },
            "required": ["repository"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let repository = repository_param(&params)?;
        let query = HistoryQuery {
            limit: params
                .get("limit")
                .and_then(Value::as_u64)
                .map(|n| n as usize),
            change_type: scope_param(&params, "changeType")?,
            include_reverted: params
                .get("includeReverted")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };
        let result = ctx.service.list_history(repository, &query).await?;
        Ok(serde_json::to_value(result)?)
    }
}

pub struct UndoChangesTool;

#[async_trait]
impl Tool for UndoChangesTool {
    fn name(&self) -> &str {
        "undo_changes"
    }

    fn description(&self) -> &str {
        "Revert changes selected by filename, change id or count"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "repository": { "type": "string", "description": REPOSITORY_PROPERTY },
                "filename": { "type": "string", "description": "Path, file name or glob" },
                "changeId": { "type": "string", "description": "Change or entry id" },
                "lastNChanges": { "type": "integer", "description": "Most recent N active changes", "minimum": 1 },
                "revertType": { "type": "string", "enum": ["file_upload", "knowledge_base_generation", "both"], "default": "both" },
                "regenerateAfterRevert": { "type": "boolean", "default": false },
                "dryRun": { "type": "boolean", "description": "Return the plan without reverting", "default": false }
            },
            "required": ["repository"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let repository = repository_param(&params)?.to_string();
        let dry_run = params
            .get("dryRun")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let request: UndoRequest = deserialize(params)?;
        if dry_run {
            let plan = ctx.service.preview_undo(&repository, &request).await?;
            return Ok(serde_json::to_value(plan)?);
        }
        let result = ctx.service.undo_changes(&repository, &request).await?;
        Ok(serde_json::to_value(result)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// The built-in capability table.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Box::new(ListRepositoriesTool))?;
        registry.register(Box::new(GetRepositoryDetailsTool))?;
        registry.register(Box::new(RegisterRepositoryTool))?;
        registry.register(Box::new(IngestContentTool))?;
        registry.register(Box::new(BrowseRepositoryTool))?;
        registry.register(Box::new(SearchKnowledgeBaseTool))?;
        registry.register(Box::new(ListHistoryTool))?;
        registry.register(Box::new(UndoChangesTool))?;
        Ok(registry)
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<()> {
        if self.find(tool.name()).is_some() {
            bail!("Duplicate tool name: {}", tool.name());
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Validate and dispatch one call.
    pub async fn call(&self, name: &str, params: Value, ctx: &ToolContext) -> Result<Value> {
        let tool = self
            .find(name)
            .ok_or_else(|| KbError::not_found("tool", name))?;
        let params = validate_params(&tool.parameters_schema(), &params)?;
        tool.execute(params, ctx).await
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
