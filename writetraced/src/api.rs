//! Control API (spec §4.8): loopback-only HTTP surface over the PID
//! registry. Errors are converted to `{"error": "<message>"}` bodies with
//! the status codes spec §7 assigns to each registry error variant.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::registry::{KernelTidMap, PidRegistry, TrackedProcess};

pub struct ApiState<M: KernelTidMap> {
    pub registry: Arc<PidRegistry<M>>,
}

#[derive(Deserialize)]
struct RegisterRequest {
    pid: u32,
}

#[derive(Serialize)]
struct RegisterResponse {
    pid: u32,
    threads: usize,
    message: String,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct ProcessInfo {
    pid: u32,
    thread_count: usize,
    registered_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ProcessListResponse {
    processes: Vec<ProcessInfo>,
    total: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl From<&TrackedProcess> for ProcessInfo {
    fn from(p: &TrackedProcess) -> Self {
        ProcessInfo {
            pid: p.parent_pid,
            thread_count: p.thread_ids.len(),
            registered_at: p.registered_at_wall.into(),
        }
    }
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match e {
            RegistryError::ProcessNotFound(_) => StatusCode::BAD_REQUEST,
            RegistryError::AlreadyRegistered(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotRegistered(_) => StatusCode::NOT_FOUND,
            RegistryError::KernelMap(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

/// A missing or malformed `pid` field is a client error (spec §4.8: 400),
/// not axum's default 422 for body-deserialization failures.
impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError(StatusCode::BAD_REQUEST, e.to_string())
    }
}

async fn register_pid<M: KernelTidMap + 'static>(
    State(state): State<Arc<ApiState<M>>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let threads = state.registry.register(req.pid)?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            pid: req.pid,
            threads,
            message: format!("registered pid {} with {threads} threads", req.pid),
        }),
    ))
}

async fn unregister_pid<M: KernelTidMap + 'static>(
    State(state): State<Arc<ApiState<M>>>,
    Path(pid): Path<u32>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.unregister(pid)?;
    Ok(Json(MessageResponse {
        message: format!("unregistered pid {pid}"),
    }))
}

async fn list_pids<M: KernelTidMap + 'static>(
    State(state): State<Arc<ApiState<M>>>,
) -> Json<ProcessListResponse> {
    let processes: Vec<ProcessInfo> = state.registry.list().iter().map(ProcessInfo::from).collect();
    let total = processes.len();
    Json(ProcessListResponse { processes, total })
}

async fn get_pid<M: KernelTidMap + 'static>(
    State(state): State<Arc<ApiState<M>>>,
    Path(pid): Path<u32>,
) -> Result<Json<ProcessInfo>, ApiError> {
    state
        .registry
        .list()
        .iter()
        .find(|p| p.parent_pid == pid)
        .map(ProcessInfo::from)
        .map(Json)
        .ok_or_else(|| RegistryError::NotRegistered(pid).into())
}

pub fn router<M: KernelTidMap + 'static>(state: Arc<ApiState<M>>) -> Router {
    Router::new()
        .route("/pids", post(register_pid::<M>).get(list_pids::<M>))
        .route("/pids/{pid}", axum::routing::delete(unregister_pid::<M>).get(get_pid::<M>))
        .with_state(state)
}

pub async fn serve<M: KernelTidMap + 'static>(
    registry: Arc<PidRegistry<M>>,
    port: u16,
) -> std::io::Result<()> {
    let state = Arc::new(ApiState { registry });
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct FakeMap(Mutex<std::collections::HashSet<u32>>);

    impl KernelTidMap for FakeMap {
        fn insert(&self, tid: u32) -> Result<(), String> {
            self.0.lock().unwrap().insert(tid);
            Ok(())
        }
        fn remove(&self, tid: u32) -> Result<(), String> {
            self.0.lock().unwrap().remove(&tid);
            Ok(())
        }

        fn tid_count(&self) -> Result<usize, String> {
            Ok(self.0.lock().unwrap().len())
        }
    }

    fn test_registry() -> Arc<PidRegistry<FakeMap>> {
        Arc::new(PidRegistry::new(FakeMap(Mutex::new(Default::default()))))
    }

    #[tokio::test]
    async fn register_unknown_pid_returns_400() {
        let state = Arc::new(ApiState { registry: test_registry() });
        let app = router(state);
        let body = serde_json::to_vec(&serde_json::json!({"pid": 999_999_999u32})).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/pids")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_self_then_list_returns_it() {
        let registry = test_registry();
        registry.register(std::process::id()).unwrap();
        let state = Arc::new(ApiState { registry });
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/pids").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_missing_pid_field_returns_400() {
        let state = Arc::new(ApiState { registry: test_registry() });
        let app = router(state);
        let body = serde_json::to_vec(&serde_json::json!({})).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/pids")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unregister_unknown_pid_returns_404() {
        let state = Arc::new(ApiState { registry: test_registry() });
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/pids/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
