//! HTTP and stdio transports over a memory-backed service.

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use kb_ledger::config::Config;
use kb_ledger::registry::RepositoryRegistry;
use kb_ledger::server::{router, serve_lines, ErrorBody};
use kb_ledger::service::{KnowledgeService, MemoryAdapterFactory};
use kb_ledger::summarizer::ExtractiveSummarizer;
use kb_ledger::tools::{ToolContext, ToolRegistry};

fn service(tmp: &TempDir) -> Arc<KnowledgeService> {
    let config = Config::with_state_dir(tmp.path());
    let registry = RepositoryRegistry::load(config.storage.registry_file()).unwrap();
    Arc::new(KnowledgeService::new(
        config,
        registry,
        Arc::new(ExtractiveSummarizer::new(3)),
        Arc::new(MemoryAdapterFactory),
    ))
}

/// Start the router on an ephemeral port and return its base URL.
async fn spawn_http(tmp: &TempDir) -> String {
    let tools = Arc::new(ToolRegistry::with_builtins().unwrap());
    let app = router(tools, ToolContext::new(service(tmp)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ============ HTTP ============

#[tokio::test]
async fn test_http_health_and_tool_list() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_http(&tmp).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let list: Value = client
        .get(format!("{}/tools/list", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = list["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"undo_changes"));
    assert!(names.contains(&"list_history"));
    assert_eq!(names.len(), 8);
}

#[tokio::test]
async fn test_http_register_ingest_and_errors() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_http(&tmp).await;
    let client = reqwest::Client::new();
    let call = |tool: &str| format!("{}/tools/{}", base, tool);

    let resp = client
        .post(call("register_repository"))
        .json(&json!({"name": "notes", "type": "local", "path": "/srv/notes"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(call("ingest_content"))
        .json(&json!({
            "repository": "notes",
            "inputKind": "text",
            "title": "Note",
            "content": "Hello world."
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["rawPath"], "raw/note.md");
    assert_eq!(body["result"]["knowledgeBaseUpdated"], true);

    // Unknown repository
    let resp = client
        .post(call("list_history"))
        .json(&json!({"repository": "missing"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let err: ErrorBody = resp.json().await.unwrap();
    assert_eq!(err.error.code, "not_found");

    // Reserved path
    let resp = client
        .post(call("browse_repository"))
        .json(&json!({"repository": "notes", "operation": "read_file", "path": ".git/config"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let err: ErrorBody = resp.json().await.unwrap();
    assert_eq!(err.error.code, "path_prohibited");

    // Missing required parameter
    let resp = client
        .post(call("search_knowledge_base"))
        .json(&json!({"repository": "notes"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: ErrorBody = resp.json().await.unwrap();
    assert_eq!(err.error.code, "invalid_params");

    // Two revert selectors at once
    let resp = client
        .post(call("undo_changes"))
        .json(&json!({"repository": "notes", "filename": "raw/note.md", "lastNChanges": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown tool
    let resp = client
        .post(call("does_not_exist"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ============ stdio ============

#[tokio::test]
async fn test_stdio_round_trip() {
    let tmp = TempDir::new().unwrap();
    let tools = ToolRegistry::with_builtins().unwrap();
    let ctx = ToolContext::new(service(&tmp));

    let input = [
        json!({"id": 1, "tool": "tools/list"}).to_string(),
        json!({"id": 2, "tool": "register_repository", "params": {"name": "n", "type": "local", "path": "/tmp/n"}}).to_string(),
        String::new(),
        "not json".to_string(),
        json!({"id": 3, "tool": "list_history", "params": {"repository": "n"}}).to_string(),
        json!({"id": 4, "tool": "list_history", "params": {}}).to_string(),
    ]
    .join("\n");

    let mut output: Vec<u8> = Vec::new();
    serve_lines(input.as_bytes(), &mut output, &tools, &ctx)
        .await
        .unwrap();

    let responses: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(responses.len(), 5);

    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[0]["result"]["tools"].as_array().unwrap().len(), 8);

    assert_eq!(responses[1]["id"], 2);
    assert_eq!(responses[1]["result"]["repository"]["name"], "n");

    assert!(responses[2]["id"].is_null());
    assert_eq!(responses[2]["error"]["code"], "bad_request");

    assert_eq!(responses[3]["id"], 3);
    assert_eq!(responses[3]["result"]["changes"], json!([]));

    assert_eq!(responses[4]["id"], 4);
    assert_eq!(responses[4]["error"]["code"], "invalid_params");
}
