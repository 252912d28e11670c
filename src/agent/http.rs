//! Volume-driver HTTP API served to the container runtime.

use super::NodeAgent;
use crate::common::middleware::request_tracing_middleware;
use crate::common::Error;
use crate::coordinator::http::{VolumeGet, VolumeList};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriverRequest {
    pub name: String,
    #[serde(default)]
    pub opts: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriverResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    pub err: String,
}

impl DriverResponse {
    fn ok() -> Self {
        Self::default()
    }

    fn mountpoint(path: &Path) -> Self {
        Self {
            mountpoint: Some(path.to_string_lossy().into_owned()),
            err: String::new(),
        }
    }
}

/// Errors go back as `{"Err": "..."}` with the mapped status.
struct DriverError(Error);

impl IntoResponse for DriverError {
    fn into_response(self) -> Response {
        tracing::warn!("Volume driver call failed: {}", self.0);
        let status = self.0.to_http_status();
        let body = DriverResponse {
            mountpoint: None,
            err: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for DriverError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

type DriverResult<T> = std::result::Result<Json<T>, DriverError>;

pub fn create_router(agent: Arc<NodeAgent>) -> Router {
    Router::new()
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Get", post(get_volume))
        .route("/VolumeDriver.List", post(list))
        .route("/health", get(health))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

async fn create(
    State(agent): State<Arc<NodeAgent>>,
    Json(req): Json<DriverRequest>,
) -> DriverResult<DriverResponse> {
    agent.create(&req.name, req.opts.unwrap_or_default()).await?;
    Ok(Json(DriverResponse::ok()))
}

async fn remove(
    State(agent): State<Arc<NodeAgent>>,
    Json(req): Json<DriverRequest>,
) -> DriverResult<DriverResponse> {
    agent.remove(&req.name).await?;
    Ok(Json(DriverResponse::ok()))
}

async fn mount(
    State(agent): State<Arc<NodeAgent>>,
    Json(req): Json<DriverRequest>,
) -> DriverResult<DriverResponse> {
    let path = agent.mount(&req.name).await?;
    Ok(Json(DriverResponse::mountpoint(&path)))
}

async fn unmount(
    State(agent): State<Arc<NodeAgent>>,
    Json(req): Json<DriverRequest>,
) -> DriverResult<DriverResponse> {
    agent.unmount(&req.name).await?;
    Ok(Json(DriverResponse::ok()))
}

async fn path(
    State(agent): State<Arc<NodeAgent>>,
    Json(req): Json<DriverRequest>,
) -> DriverResult<DriverResponse> {
    let path = agent.path(&req.name).await?;
    Ok(Json(DriverResponse::mountpoint(&path)))
}

async fn get_volume(
    State(agent): State<Arc<NodeAgent>>,
    Json(req): Json<DriverRequest>,
) -> DriverResult<VolumeGet> {
    Ok(Json(agent.get(&req.name).await?))
}

async fn list(State(agent): State<Arc<NodeAgent>>) -> DriverResult<VolumeList> {
    Ok(Json(agent.list().await?))
}

async fn health(State(agent): State<Arc<NodeAgent>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "host": agent.host(),
            "mounted": agent.mounted(),
        })),
    )
}
