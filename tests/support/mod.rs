//! Shared test harness: an in-process mock exodus-gw.
//!
//! The mock implements just enough of the gateway surface for the
//! publish pipeline: whoami, publish creation and population, commit
//! tasks with polling, and the blob store (HEAD/PUT). Every request is
//! recorded so tests can assert on the exact traffic.

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::routing::{get, head, post, put};
use axum::{Json, Router};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct GatewayInner {
    /// Keys considered already present in the blob store.
    pub blobs: HashSet<String>,
    /// Keys received via blob PUT, in arrival order.
    pub uploads: Vec<String>,
    /// HEAD probes received, by key.
    pub head_probes: Vec<String>,
    /// Publish ids created via POST.
    pub created: Vec<String>,
    /// Items accumulated per publish id.
    pub items: HashMap<String, Vec<serde_json::Value>>,
    /// Size of every item batch received, in arrival order.
    pub batches: Vec<usize>,
    /// Commits received: (publish id, raw query).
    pub commits: Vec<(String, String)>,
    /// Task polls before the task reaches its terminal state.
    pub polls_before_done: u32,
    /// Terminal task state reported after polling.
    pub final_task_state: String,
    /// Status returned for blob PUTs (200 = accept).
    pub upload_status: u16,
    /// Status returned for HEAD probes of absent blobs.
    pub absent_status: u16,
    /// Status returned for publish creation (200 = accept).
    pub create_status: u16,
    /// Status returned for item addition (200 = accept).
    pub add_items_status: u16,
    /// Status returned for task polls (200 = answer normally).
    pub task_poll_status: u16,
    /// Number of whoami requests served.
    pub whoami_calls: usize,
    next_publish: u32,
}

#[derive(Clone, Default)]
pub struct GatewayState(pub Arc<Mutex<GatewayInner>>);

impl GatewayState {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, GatewayInner> {
        self.0.lock().expect("gateway state poisoned")
    }
}

pub struct MockGateway {
    pub url: String,
    pub state: GatewayState,
}

async fn whoami(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    state.lock().whoami_calls += 1;
    Json(serde_json::json!({"client": {"roles": ["test"], "authenticated": true}}))
}

async fn new_publish(
    State(state): State<GatewayState>,
    Path(env): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let mut inner = state.lock();
    let status = StatusCode::from_u16(inner.create_status).unwrap_or(StatusCode::OK);
    if !status.is_success() {
        return Err(status);
    }

    inner.next_publish += 1;
    let id = format!("publish-{}", inner.next_publish);
    inner.created.push(id.clone());

    Ok(Json(serde_json::json!({
        "id": id,
        "env": env,
        "state": "PENDING",
        "links": {
            "self": format!("/{env}/publish/{id}"),
            "commit": format!("/{env}/publish/{id}/commit"),
        },
    })))
}

async fn add_items(
    State(state): State<GatewayState>,
    Path((_env, id)): Path<(String, String)>,
    Json(batch): Json<Vec<serde_json::Value>>,
) -> StatusCode {
    let mut inner = state.lock();
    let status = StatusCode::from_u16(inner.add_items_status).unwrap_or(StatusCode::OK);
    if !status.is_success() {
        return status;
    }
    inner.batches.push(batch.len());
    inner.items.entry(id).or_default().extend(batch);
    StatusCode::OK
}

async fn commit(
    State(state): State<GatewayState>,
    Path((_env, id)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Json<serde_json::Value> {
    let mut inner = state.lock();
    inner.commits.push((id.clone(), query.unwrap_or_default()));

    Json(serde_json::json!({
        "id": format!("task-{id}"),
        "publish_id": id,
        "state": "NOT_STARTED",
        "links": {"self": format!("/task/task-{id}")},
    }))
}

async fn poll_task(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let mut inner = state.lock();
    let status = StatusCode::from_u16(inner.task_poll_status).unwrap_or(StatusCode::OK);
    if !status.is_success() {
        return Err(status);
    }
    let task_state = if inner.polls_before_done > 1 {
        inner.polls_before_done -= 1;
        "IN_PROGRESS".to_string()
    } else {
        inner.polls_before_done = 0;
        inner.final_task_state.clone()
    };

    Ok(Json(serde_json::json!({
        "id": id,
        "state": task_state,
        "links": {"self": format!("/task/{id}")},
    })))
}

async fn head_blob(
    State(state): State<GatewayState>,
    Path((_env, key)): Path<(String, String)>,
) -> StatusCode {
    let mut inner = state.lock();
    inner.head_probes.push(key.clone());
    if inner.blobs.contains(&key) {
        StatusCode::OK
    } else {
        StatusCode::from_u16(inner.absent_status).unwrap_or(StatusCode::NOT_FOUND)
    }
}

async fn put_blob(
    State(state): State<GatewayState>,
    Path((_env, key)): Path<(String, String)>,
    _body: axum::body::Bytes,
) -> StatusCode {
    let mut inner = state.lock();
    let status = StatusCode::from_u16(inner.upload_status).unwrap_or(StatusCode::OK);
    if status.is_success() {
        inner.uploads.push(key.clone());
        inner.blobs.insert(key);
    }
    status
}

/// Starts a mock gateway on an ephemeral port and returns its base URL
/// plus a handle on the recorded state.
pub async fn spawn_gateway() -> MockGateway {
    let state = GatewayState::default();
    {
        let mut inner = state.lock();
        inner.polls_before_done = 1;
        inner.final_task_state = "COMPLETE".to_string();
        inner.upload_status = 200;
        inner.absent_status = 404;
        inner.create_status = 200;
        inner.add_items_status = 200;
        inner.task_poll_status = 200;
    }

    let app = Router::new()
        .route("/whoami", get(whoami))
        .route("/upload/:env/:key", head(head_blob).put(put_blob))
        .route("/:env/publish", post(new_publish))
        .route("/:env/publish/:id", put(add_items))
        .route("/:env/publish/:id/commit", post(commit))
        .route("/task/:id", get(poll_task))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock gateway");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock gateway");
    });

    MockGateway {
        url: format!("http://{addr}"),
        state,
    }
}

/// Writes a config file pointing at the given gateway URL, with an
/// `exodus` environment prefix and fast polling. Extra YAML lines are
/// appended verbatim at the global level; environment extras are
/// indented under the `exodus` environment.
pub fn write_config(
    dir: &std::path::Path,
    gwurl: &str,
    global_extra: &str,
    env_extra: &str,
) -> std::path::PathBuf {
    let path = dir.join("exodus-rsync.conf");
    let mut file = std::fs::File::create(&path).expect("create config");
    writeln!(file, "gwurl: {gwurl}").expect("write config");
    writeln!(file, "gwenv: test-env").expect("write config");
    writeln!(file, "gwpollinterval: 10").expect("write config");
    for line in global_extra.lines() {
        writeln!(file, "{line}").expect("write config");
    }
    writeln!(file, "environments:").expect("write config");
    writeln!(file, "- prefix: exodus").expect("write config");
    for line in env_extra.lines() {
        writeln!(file, "  {line}").expect("write config");
    }
    path
}
