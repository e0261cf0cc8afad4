use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use clipforge_infra::service::SubmitError;
use clipforge_ledger::LedgerError;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    let status = match &err {
        SubmitError::Invalid(_) => StatusCode::BAD_REQUEST,
        SubmitError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        SubmitError::IdempotencyConflict(_) | SubmitError::JobActive(_) => StatusCode::CONFLICT,
        SubmitError::NotFound(_) => StatusCode::NOT_FOUND,
        SubmitError::Ledger(LedgerError::UnknownUser(_)) => {
            return json_error(StatusCode::NOT_FOUND, "unknown_user", err.to_string());
        }
        SubmitError::Ledger(LedgerError::AmountOutOfRange { .. }) => StatusCode::BAD_REQUEST,
        SubmitError::Enqueue(_) => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::Ledger(_) | SubmitError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(error = %err, code = err.code(), "request failed");
    }
    json_error(status, err.code(), err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
