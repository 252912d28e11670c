//! HTTP API for the control plane
//!
//! Every mutating handler follows the same shape: validate, take a use lock,
//! drive the backend, update the volume record, release the lock. Failures
//! are reported as `<stage>: <error>` with the status from
//! [`Error::to_http_status`].

use crate::common::middleware::request_tracing_middleware;
use crate::common::{join_path, Config, Error, Result};
use crate::coordinator::lock::{LeasePrecondition, UseConfig, UseLocker, UseReason};
use crate::coordinator::metadata::{MetadataStore, RequestCreate, VolumeConfig, VolumeState};
use crate::storage::{CreateOutcome, VolumeBackend};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct MasterState {
    pub config: Arc<Config>,
    pub metadata: MetadataStore,
    pub locks: UseLocker,
    pub backend: Arc<dyn VolumeBackend>,
    /// Lease holder name for Create and Remove
    pub hostname: String,
}

/// `{tenant, volume}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub tenant: String,
    pub volume: String,
}

/// `{tenant, volume, host}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseRequest {
    pub tenant: String,
    pub volume: String,
    #[serde(alias = "hostname")]
    pub host: String,
}

/// Entry of `/list` and `/get`, shaped for the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeEntry {
    pub name: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeList {
    pub volumes: Vec<VolumeEntry>,
    pub err: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeGet {
    pub volume: VolumeEntry,
    pub err: String,
}

/// A failed stage of a handler.
pub struct ApiError {
    stage: &'static str,
    error: Error,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.to_http_status();
        if status.is_server_error() {
            error!("{}: {}", self.stage, self.error);
        } else {
            warn!("{}: {}", self.stage, self.error);
        }
        (status, format!("{}: {}", self.stage, self.error)).into_response()
    }
}

trait Stage<T> {
    fn stage(self, stage: &'static str) -> std::result::Result<T, ApiError>;
}

impl<T> Stage<T> for Result<T> {
    fn stage(self, stage: &'static str) -> std::result::Result<T, ApiError> {
        self.map_err(|error| ApiError { stage, error })
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(Error::from)
        .stage("Unmarshalling request")
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::MalformedRequest(format!("{} was blank", field)));
    }
    Ok(())
}

fn entry(state: &MasterState, config: &VolumeConfig) -> Result<VolumeEntry> {
    let path = state
        .backend
        .mount_path(&config.options.pool, &config.internal_name()?);
    Ok(VolumeEntry {
        name: config.name(),
        mountpoint: path.to_string_lossy().into_owned(),
    })
}

pub fn create_router(state: MasterState) -> Router {
    Router::new()
        .route("/create", post(handle_create))
        .route("/request", post(handle_request))
        .route("/mount", post(handle_mount))
        .route("/mount-report", post(handle_mount_report))
        .route("/unmount", post(handle_unmount))
        .route("/remove", post(handle_remove))
        .route("/list", get(handle_list))
        .route("/get/:tenant/:volume", get(handle_get))
        .route("/health", get(health))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Record the volume, provision it under a Create lease and mark it ready.
async fn handle_create(State(state): State<MasterState>, body: Bytes) -> ApiResult<Response> {
    let req: RequestCreate = parse(&body)?;
    require("tenant", &req.tenant).stage("Reading tenant")?;
    require("volume", &req.volume).stage("Reading volume")?;

    let tenant = state
        .metadata
        .get_tenant(&req.tenant)
        .await
        .stage("Retrieving tenant")?;
    let (config, _) = state
        .metadata
        .create_volume(&req, &tenant)
        .await
        .stage("Creating volume")?;

    if config.state == VolumeState::Ready {
        return Ok(Json(config).into_response());
    }

    let lease = UseConfig::for_volume(&config, &state.hostname, UseReason::Create);
    match state.locks.publish_use(&lease).await {
        Ok(()) => {}
        Err(Error::LockHeld { .. }) => {
            // Another create is provisioning this volume right now.
            info!(volume = %config.name(), "Create already in progress");
            return Ok(Json(config).into_response());
        }
        Err(e) => return Err(ApiError { stage: "Creating use lock", error: e }),
    }

    let result = provision(&state, config).await;

    if let Err(e) = state.locks.remove_use(&lease, false).await {
        error!(volume = %lease.name(), "Could not remove use lock on create: {}", e);
    }

    Ok(Json(result?).into_response())
}

async fn provision(state: &MasterState, mut config: VolumeConfig) -> ApiResult<VolumeConfig> {
    let tenant = state
        .metadata
        .get_tenant(&config.tenant)
        .await
        .stage("Retrieving tenant")?;
    let fs = tenant
        .filesystem(&config.options.filesystem)
        .stage("Reading filesystem")?;
    let spec = config.spec().stage("Creating volume")?;

    let outcome = state
        .backend
        .create(&spec, &fs, state.config.master.timeout())
        .await
        .stage("Creating volume")?;
    match outcome {
        CreateOutcome::Created => info!(volume = %config.name(), pool = %spec.pool, "Provisioned"),
        CreateOutcome::AlreadyExists => {
            info!(volume = %config.name(), pool = %spec.pool, "Image exists, publishing record")
        }
    }

    config.state = VolumeState::Ready;
    state
        .metadata
        .publish_volume(&config)
        .await
        .stage("Publishing volume")?;
    Ok(config)
}

async fn handle_request(State(state): State<MasterState>, body: Bytes) -> ApiResult<Response> {
    let req: VolumeRequest = parse(&body)?;
    match state.metadata.get_volume(&req.tenant, &req.volume).await {
        Ok(config) => Ok(Json(config).into_response()),
        Err(e) if e.is_not_found() => Ok(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err(ApiError {
            stage: "Retrieving volume",
            error: e,
        }),
    }
}

async fn publish_mount(
    state: &MasterState,
    body: &Bytes,
    precondition: LeasePrecondition,
) -> ApiResult<StatusCode> {
    let req: UseRequest = parse(body)?;
    require("host", &req.host).stage("Reading host")?;
    let config = state
        .metadata
        .get_volume(&req.tenant, &req.volume)
        .await
        .stage("Retrieving volume")?;

    let lease = UseConfig::for_volume(&config, req.host, UseReason::Mount);
    state
        .locks
        .publish_use_with_ttl(&lease, state.config.master.mount_ttl(), precondition)
        .await
        .stage("Could not publish mount information")?;
    Ok(StatusCode::OK)
}

async fn handle_mount(State(state): State<MasterState>, body: Bytes) -> ApiResult<StatusCode> {
    publish_mount(&state, &body, LeasePrecondition::MustNotExist).await
}

async fn handle_mount_report(
    State(state): State<MasterState>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    publish_mount(&state, &body, LeasePrecondition::MustExist).await
}

/// Release the mount lease if, and only if, the requesting host holds it.
async fn handle_unmount(State(state): State<MasterState>, body: Bytes) -> ApiResult<StatusCode> {
    let req: UseRequest = parse(&body)?;
    let current = state
        .locks
        .get_use(&req.tenant, &req.volume)
        .await
        .stage("Could not retrieve mount information")?;

    match current {
        None => {
            info!(volume = %join_path(&req.tenant, &req.volume), "No lease to release");
        }
        Some(holder) if holder.hostname == req.host => {
            let lease = UseConfig::new(req.tenant, req.volume, req.host, UseReason::Mount);
            state
                .locks
                .remove_use(&lease, false)
                .await
                .stage("Could not remove mount information")?;
        }
        Some(holder) => {
            warn!(
                volume = %holder.name(),
                holder = %holder.hostname,
                requester = %req.host,
                "Unmount from non-holder; lease left in place"
            );
        }
    }
    Ok(StatusCode::OK)
}

async fn handle_remove(State(state): State<MasterState>, body: Bytes) -> ApiResult<StatusCode> {
    let req: VolumeRequest = parse(&body)?;
    let config = state
        .metadata
        .get_volume(&req.tenant, &req.volume)
        .await
        .stage("Obtaining volume configuration")?;

    let lease = UseConfig::for_volume(&config, &state.hostname, UseReason::Remove);
    state
        .locks
        .publish_use(&lease)
        .await
        .stage("Creating use lock")?;

    let result = remove_volume(&state, &config).await;

    if let Err(e) = state.locks.remove_use(&lease, false).await {
        error!(volume = %lease.name(), "Could not remove use lock on remove: {}", e);
    }

    result.map(|()| StatusCode::OK)
}

async fn remove_volume(state: &MasterState, config: &VolumeConfig) -> ApiResult<()> {
    let spec = config.spec().stage("Removing image")?;
    state
        .backend
        .remove(&spec)
        .await
        .stage("Removing image")?;
    state
        .metadata
        .remove_volume(&config.tenant, &config.volume_name)
        .await
        .stage("Clearing volume records")?;
    info!(volume = %config.name(), "Removed volume");
    Ok(())
}

async fn handle_list(State(state): State<MasterState>) -> ApiResult<Json<VolumeList>> {
    let configs = state
        .metadata
        .list_all_volumes()
        .await
        .stage("Retrieving list")?;

    let mut volumes = Vec::with_capacity(configs.len());
    for config in &configs {
        volumes.push(entry(&state, config).stage("Retrieving list")?);
    }
    Ok(Json(VolumeList {
        volumes,
        err: String::new(),
    }))
}

async fn handle_get(
    State(state): State<MasterState>,
    Path((tenant, volume)): Path<(String, String)>,
) -> ApiResult<Response> {
    let config = match state.metadata.get_volume(&tenant, &volume).await {
        Ok(config) => config,
        Err(e) if e.is_not_found() => return Ok(StatusCode::NOT_FOUND.into_response()),
        Err(e) => {
            return Err(ApiError {
                stage: "Retrieving volume",
                error: e,
            })
        }
    };

    let volume = entry(&state, &config).stage("Retrieving volume")?;
    Ok(Json(VolumeGet {
        volume,
        err: String::new(),
    })
    .into_response())
}

async fn health(State(state): State<MasterState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "host": state.hostname,
        "backend": state.backend.name(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
