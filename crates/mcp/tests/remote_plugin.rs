mod common;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use futures_util::stream;
use indexmap::IndexSet;
use serde_json::{Value, json};
use tempfile::TempDir;
use tendril_mcp::config::{ResolvedAuth, TransportConfig};
use tendril_mcp::{EngineError, PluginConfig, PluginEngine, PluginSet, PluginStatus};
use tokio::sync::broadcast;
use url::Url;

use common::{fast_settings, wait_for_status};

const TOKEN: &str = "good-token";
const SESSION: &str = "session-1";

struct FakeServer {
    tools: Mutex<Vec<String>>,
    pushes: broadcast::Sender<Value>,
    sessions_seen: Mutex<Vec<Option<String>>>,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(vec!["echo".to_string()]),
            pushes: broadcast::channel(16).0,
            sessions_seen: Mutex::new(Vec::new()),
        })
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {TOKEN}");
    headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) == Some(expected.as_str())
}

fn result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn rpc(State(server): State<Arc<FakeServer>>, headers: HeaderMap, Json(message): Json<Value>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let session = headers
        .get("mcp-session-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    server.sessions_seen.lock().unwrap().push(session);

    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    match message["method"].as_str() {
        Some("initialize") => (
            [("mcp-session-id", SESSION)],
            Json(result(
                &id,
                json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {"name": "fake-remote", "version": "0.1.0"},
                    "eventStream": "/events"
                }),
            )),
        )
            .into_response(),
        Some("ping") => Json(result(&id, json!({}))).into_response(),
        Some("tools/list") => {
            let tools: Vec<Value> = server
                .tools
                .lock()
                .unwrap()
                .iter()
                .map(|name| json!({"name": name, "inputSchema": {"type": "object"}}))
                .collect();
            Json(result(&id, json!({"tools": tools}))).into_response()
        }
        Some("tools/call") => match params["name"].as_str() {
            Some("echo") => Json(result(
                &id,
                json!({"content": [{"type": "text", "text": params["arguments"]["message"]}]}),
            ))
            .into_response(),
            // Reply through an event-stream body.
            Some("streamed") => {
                let reply = result(&id, json!({"content": [], "structuredContent": {"items": [1, 2, 3]}}));
                let body = format!("event: message\ndata: {reply}\n\n");
                ([(CONTENT_TYPE, "text/event-stream")], body).into_response()
            }
            _ => Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32602, "message": "Unknown tool"}
            }))
            .into_response(),
        },
        _ => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .into_response(),
    }
}

async fn events(
    State(server): State<Arc<FakeServer>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let receiver = server.pushes.subscribe();
    let stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(message) => return Some((Ok(Event::default().data(message.to_string())), receiver)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn serve(server: Arc<FakeServer>) -> SocketAddr {
    let app = Router::new()
        .route("/mcp", post(rpc))
        .route("/events", get(events))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    address
}

fn remote_plugin(name: &str, address: SocketAddr, token: &str) -> PluginConfig {
    PluginConfig {
        name: name.to_string(),
        transport: TransportConfig::Remote {
            base_url: Url::parse(&format!("http://{address}/mcp")).unwrap(),
            headers: IndexSet::new(),
            auth: Some(ResolvedAuth::Bearer { token: token.to_string() }),
        },
        disabled: false,
        tags: vec!["remote".into()],
    }
}

fn engine(dir: &TempDir, plugins: Vec<PluginConfig>) -> PluginEngine {
    let settings = fast_settings(dir);
    PluginEngine::new(PluginSet::from_configs(plugins, settings.clone()), settings)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn invokes_tools_over_http() {
    let server = FakeServer::new();
    let address = serve(Arc::clone(&server)).await;
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, vec![remote_plugin("remote", address, TOKEN)]);

    assert_eq!(engine.start("remote").await.unwrap(), PluginStatus::Running);
    let output = engine
        .invoke("remote", "echo", json!({"message": "over http"}))
        .await
        .unwrap();
    assert_eq!(output.text(), "over http");

    let missing = engine.invoke("remote", "nope", json!({})).await.unwrap_err();
    assert!(matches!(missing, EngineError::Tool(_)));
    assert_eq!(engine.status("remote").await.unwrap(), PluginStatus::Running);

    // Requests after the handshake carry the session id.
    let sessions = server.sessions_seen.lock().unwrap().clone();
    assert_eq!(sessions.first(), Some(&None));
    assert!(sessions[1..].iter().all(|session| session.as_deref() == Some(SESSION)));

    let detail = engine.detail("remote").await.unwrap();
    assert_eq!(detail.command_or_url, format!("http://{address}/mcp"));
    engine.shutdown().await;
}

#[tokio::test]
async fn event_stream_replies_are_matched_by_id() {
    let server = FakeServer::new();
    server.tools.lock().unwrap().push("streamed".to_string());
    let address = serve(Arc::clone(&server)).await;
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, vec![remote_plugin("remote", address, TOKEN)]);

    engine.start("remote").await.unwrap();
    let values = engine.fetch("remote", "streamed", json!({})).await.unwrap();
    assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    engine.shutdown().await;
}

#[tokio::test]
async fn list_changed_push_refreshes_providers() {
    let server = FakeServer::new();
    let address = serve(Arc::clone(&server)).await;
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, vec![remote_plugin("remote", address, TOKEN)]);

    engine.start("remote").await.unwrap();
    wait_until(|| engine.providers().len() == 1 && server.pushes.receiver_count() > 0).await;

    server.tools.lock().unwrap().push("search".to_string());
    server
        .pushes
        .send(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}))
        .unwrap();

    wait_until(|| engine.provider("remote", "search").is_some()).await;
    assert_eq!(engine.providers().len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn rejected_credentials_surface_as_auth_errors() {
    let server = FakeServer::new();
    let address = serve(Arc::clone(&server)).await;
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, vec![remote_plugin("remote", address, "wrong-token")]);

    let error = engine.start("remote").await.unwrap_err();
    assert!(error.is_auth(), "unexpected error: {error}");
    assert!(!error.user_message().contains("wrong-token"));

    let status = engine.status("remote").await.unwrap();
    assert!(status.is_failed(), "status was {status}");
    engine.shutdown().await;
    assert_eq!(engine.status("remote").await.unwrap(), PluginStatus::Stopped);
}

#[tokio::test]
async fn reload_with_revoked_credentials_disables_after_retries() {
    let server = FakeServer::new();
    let address = serve(Arc::clone(&server)).await;
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, vec![remote_plugin("remote", address, TOKEN)]);
    engine.start("remote").await.unwrap();

    let revoked = PluginSet::from_configs([remote_plugin("remote", address, "revoked")], fast_settings(&dir));
    engine.reload(revoked).await;
    assert_eq!(engine.status("remote").await.unwrap(), PluginStatus::Stopped);
    assert!(engine.start("remote").await.unwrap_err().is_auth());
    wait_for_status(&engine, "remote", PluginStatus::DisabledByFailure, Duration::from_secs(5)).await;
    engine.shutdown().await;
}
