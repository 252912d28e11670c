//! Error types for blocklease

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Request Errors ===
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Invalid volume name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    // === Metadata Errors ===
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    // === Lock Errors ===
    #[error("Use lock for {volume} is already held")]
    LockHeld { volume: String },

    #[error("Use lock for {volume} is not held")]
    LockNotHeld { volume: String },

    #[error("Use lock for {volume} is held by {holder}, not {requester}")]
    LockOwnerMismatch {
        volume: String,
        holder: String,
        requester: String,
    },

    // === Storage Errors ===
    #[error("Pool {0:?} does not exist")]
    PoolNotFound(String),

    #[error("Snapshot {snapshot:?} already exists on {volume}")]
    SnapshotExists { volume: String, snapshot: String },

    #[error("Snapshot {snapshot:?} does not exist on {volume}")]
    SnapshotNotFound { volume: String, snapshot: String },

    #[error("Command `{command}` failed ({status}): {stderr}")]
    Subprocess {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to stat device {device}: {source}")]
    DeviceStat {
        device: String,
        source: std::io::Error,
    },

    // === Store Errors ===
    #[error("Store error: {0}")]
    Store(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Store(_) | Error::Http(_) | Error::LockHeld { .. }
        )
    }

    /// Does this error mean the thing looked up is simply absent?
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TenantNotFound(_) | Error::VolumeNotFound(_) | Error::SnapshotNotFound { .. }
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::TenantNotFound(_) | Error::VolumeNotFound(_) | Error::SnapshotNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Error::MalformedRequest(_) | Error::InvalidName { .. } | Error::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::LockHeld { .. }
            | Error::LockNotHeld { .. }
            | Error::LockOwnerMismatch { .. }
            | Error::SnapshotExists { .. } => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::VolumeNotFound("t/v".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::LockHeld {
                volume: "t/v".into()
            }
            .to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::MalformedRequest("tenant was blank".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Timeout("mkfs".into()).to_http_status(),
            StatusCode::REQUEST_TIMEOUT
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Store("unavailable".into()).is_retryable());
        assert!(!Error::PoolNotFound("rbd".into()).is_retryable());
    }
}
