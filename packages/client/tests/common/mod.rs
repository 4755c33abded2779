#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};

use opencode_ask_client::{ClientContext, Preferences, StaticServer};

pub const DIRECTORY_HEADER: &str = "x-opencode-directory";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub directory_header: Option<String>,
    pub content_type: Option<String>,
    pub accept: Option<String>,
    pub body: Option<Value>,
}

#[derive(Debug, Default)]
pub struct MockBehavior {
    pub health_delay: HashMap<String, Duration>,
    pub failing_directories: HashSet<String>,
    pub unhealthy_directories: HashSet<String>,
    pub prompt_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MockState {
    requests: Mutex<Vec<RecordedRequest>>,
    sessions_created: AtomicUsize,
    behavior: Mutex<MockBehavior>,
}

impl MockState {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == method && request.path == path)
            .collect()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn configure(&self, apply: impl FnOnce(&mut MockBehavior)) {
        apply(&mut self.behavior.lock().expect("behavior lock"));
    }
}

pub struct MockServer {
    pub url: String,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn context(&self) -> Arc<ClientContext> {
        self.context_with(Preferences::default())
    }

    pub fn context_with(&self, preferences: Preferences) -> Arc<ClientContext> {
        Arc::new(ClientContext::new(
            Arc::new(StaticServer::new(self.url.clone())),
            preferences,
        ))
    }
}

fn session_json(id: &str, title: &str, directory: &str, updated: i64) -> Value {
    json!({
        "id": id,
        "projectID": "prj_test",
        "directory": directory,
        "title": title,
        "version": "0.9.1",
        "time": { "created": updated - 100, "updated": updated }
    })
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let directory = header(DIRECTORY_HEADER).unwrap_or_default();
    let body: Option<Value> = serde_json::from_slice(&body).ok();
    let path = uri.path().to_string();

    state.requests.lock().expect("requests lock").push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query: query.clone(),
        directory_header: header(DIRECTORY_HEADER),
        content_type: header("content-type"),
        accept: header("accept"),
        body: body.clone(),
    });

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match (method.as_str(), segments.as_slice()) {
        ("GET", ["global", "health"]) => {
            let (delay, failing, unhealthy) = {
                let behavior = state.behavior.lock().expect("behavior lock");
                (
                    behavior.health_delay.get(&directory).copied(),
                    behavior.failing_directories.contains(&directory),
                    behavior.unhealthy_directories.contains(&directory),
                )
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if failing {
                return (StatusCode::SERVICE_UNAVAILABLE, "server overloaded").into_response();
            }
            Json(json!({ "healthy": !unhealthy, "version": format!("test+{directory}") }))
                .into_response()
        }
        ("GET", ["agent"]) => Json(json!([
            { "name": "build", "mode": "primary" },
            { "name": "general", "mode": "subagent" },
            { "name": "plan", "mode": "all" }
        ]))
        .into_response(),
        ("GET", ["provider"]) => Json(json!({
            "all": [{
                "id": "anthropic",
                "name": "Anthropic",
                "models": {
                    "claude-sonnet-4": { "id": "claude-sonnet-4", "providerID": "anthropic", "name": "Claude Sonnet 4" }
                }
            }],
            "default": { "anthropic": "claude-sonnet-4" }
        }))
        .into_response(),
        ("GET", ["session"]) => Json(json!([
            session_json("ses_old", "older", "/work/a", 1_000),
            session_json("ses_new", "newer", "/work/b", 5_000)
        ]))
        .into_response(),
        ("POST", ["session"]) => {
            let count = state.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
            let title = body
                .as_ref()
                .and_then(|body| body.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("New session")
                .to_string();
            Json(session_json(&format!("ses_{count}"), &title, &directory, 10_000)).into_response()
        }
        ("GET", ["session", "ses_missing"]) => {
            (StatusCode::NOT_FOUND, "Session not found: ses_missing").into_response()
        }
        ("GET", ["session", id]) => Json(session_json(id, "fetched", &directory, 2_000)).into_response(),
        ("DELETE", ["session", _]) => Json(json!(true)).into_response(),
        ("POST", ["session", _, "abort"]) => Json(json!(true)).into_response(),
        ("GET", ["session", id, "message"]) => {
            let mut messages = vec![
                json!({
                    "info": { "id": "msg_1", "sessionID": id, "role": "user" },
                    "parts": [{ "type": "text", "text": "hello" }]
                }),
                json!({
                    "info": { "id": "msg_2", "sessionID": id, "role": "assistant" },
                    "parts": [{ "type": "text", "text": "hi there" }]
                }),
            ];
            if let Some(limit) = query.get("limit").and_then(|limit| limit.parse::<usize>().ok()) {
                messages.truncate(limit);
            }
            Json(Value::Array(messages)).into_response()
        }
        ("POST", ["session", id, "message"]) => {
            let delay = state.behavior.lock().expect("behavior lock").prompt_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let text = body
                .as_ref()
                .and_then(|body| body.pointer("/parts/0/text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Json(json!({
                "info": { "id": "msg_reply", "sessionID": id, "role": "assistant" },
                "parts": [
                    { "type": "step-start", "id": "prt_0" },
                    { "type": "text", "id": "prt_1", "text": format!("echo: {text}") },
                    { "type": "tool", "id": "prt_2", "tool": "read" },
                    { "type": "text", "id": "prt_3", "text": "done" }
                ]
            }))
            .into_response()
        }
        _ => (StatusCode::NOT_FOUND, format!("no route for {method} {path}")).into_response(),
    }
}
