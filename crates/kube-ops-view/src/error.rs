//! Error types for cluster access and the view server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for server operations.
pub type ViewResult<T> = Result<T, ViewError>;

/// HTTP status the API server uses for an expired resource version.
const GONE: u16 = 410;

/// Errors talking to a single cluster.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The requested resource version is too old to watch from.
    #[error("resource version expired: {0}")]
    Gone(String),

    /// The API server rejected or failed the request.
    #[error("kubernetes API error: {0}")]
    Api(#[source] kube::Error),

    /// The cluster could not be reached at all.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// Whether the caller must relist before watching again.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

impl From<kube::Error> for SourceError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == GONE => Self::Gone(response.message),
            other => Self::Api(other),
        }
    }
}

/// Errors that can occur in the view server.
#[derive(Debug, Error)]
pub enum ViewError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(std::net::SocketAddr, std::io::Error),

    /// No cluster produced a usable client.
    #[error("no clusters available, see previous errors")]
    NoClusters,

    /// A cluster operation failed.
    #[error("cluster {cluster}: {source}")]
    Cluster {
        /// Cluster the failure belongs to.
        cluster: String,
        /// Underlying failure.
        #[source]
        source: SourceError,
    },

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Too many connections.
    #[error("too many connections: {0} active, limit is {1}")]
    TooManyConnections(usize, usize),

    /// The server is draining.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ViewError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Self::TooManyConnections(_, _) => {
                (StatusCode::SERVICE_UNAVAILABLE, "too_many_connections")
            }
            Self::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            Self::Cluster { .. } => (StatusCode::BAD_GATEWAY, "cluster_error"),
            Self::BindFailed(_, _)
            | Self::NoClusters
            | Self::WebSocket(_)
            | Self::Serialization(_)
            | Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}

impl From<serde_json::Error> for ViewError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_too_many_connections_error_response() {
        let err = ViewError::TooManyConnections(100, 50);
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["error"], "too_many_connections");
        assert!(json["message"].as_str().unwrap().contains("limit is 50"));
    }

    #[tokio::test]
    async fn test_shutting_down_error_response() {
        let response = ViewError::ShuttingDown.into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cluster_error_response() {
        let err = ViewError::Cluster {
            cluster: "https://kube-1.example.org".to_string(),
            source: SourceError::Unavailable("connection refused".to_string()),
        };
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_internal_error_response() {
        let response = ViewError::Internal("something broke".to_string()).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_from_serde_error() {
        let serde_err = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err = ViewError::from(serde_err);

        assert!(matches!(err, ViewError::Serialization(_)));
    }

    #[test]
    fn test_gone_detection() {
        assert!(SourceError::Gone("too old".to_string()).is_gone());
        assert!(!SourceError::Unavailable("down".to_string()).is_gone());
    }

    #[test]
    fn test_error_display() {
        let err = ViewError::Cluster {
            cluster: "c1".to_string(),
            source: SourceError::Unavailable("timeout".to_string()),
        };
        assert_eq!(err.to_string(), "cluster c1: cluster unavailable: timeout");
        assert_eq!(
            ViewError::NoClusters.to_string(),
            "no clusters available, see previous errors"
        );
    }
}
