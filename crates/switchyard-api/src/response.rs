//! Response envelope and error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use switchyard_controller::{ControllerError, RollbackOutcome};

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error class: validation, not_found, concurrency, operational, fatal, internal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        })
    }
}

pub fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            kind: None,
        }),
    )
        .into_response()
}

pub fn status_for(e: &ControllerError) -> StatusCode {
    match e {
        ControllerError::Validation(_) => StatusCode::BAD_REQUEST,
        ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
        ControllerError::Concurrency(_) => StatusCode::CONFLICT,
        ControllerError::Operational { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ControllerError::Fatal(_) | ControllerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a controller error onto the envelope. Operational failures carry
/// what happened to traffic in `data`.
pub fn controller_error(e: ControllerError) -> Response {
    let status = status_for(&e);
    let kind = e.kind();
    let message = e.to_string();
    let rollback: Option<RollbackOutcome> = match e {
        ControllerError::Operational { rollback, .. } => rollback,
        _ => None,
    };
    (
        status,
        Json(ApiResponse {
            success: false,
            data: rollback,
            error: Some(message),
            kind: Some(kind),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn statuses_follow_error_class() {
        assert_eq!(
            status_for(&ControllerError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ControllerError::Concurrency("busy".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ControllerError::operational("unhealthy")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&ControllerError::Fatal("stuck".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn operational_error_reports_rollback() {
        let resp = controller_error(ControllerError::Operational {
            reason: "target unhealthy at 50%".to_string(),
            rollback: Some(RollbackOutcome::restored(Some(4))),
        });
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["kind"], "operational");
        assert_eq!(json["data"]["restored"], true);
        assert_eq!(json["data"]["revision"], 4);
    }
}
