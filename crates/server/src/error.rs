use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ledgerline_import::{PipelineError, StoreError};
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    /// A rejection with its own status, e.g. from multipart extraction.
    Rejected(StatusCode, String),
    Pipeline(PipelineError),
    Store(StoreError),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        AppError::BadRequest(msg.into())
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        AppError::Pipeline(e)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::Rejected(status, msg) => (status, json!({ "error": msg })),
            AppError::Pipeline(e) => match e {
                PipelineError::Validation(_) | PipelineError::Parse(_) => {
                    (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
                }
                PipelineError::Conflict { existing_import_id }
                | PipelineError::InProgress { existing_import_id } => (
                    StatusCode::CONFLICT,
                    json!({ "error": e.to_string(), "existing_import_id": existing_import_id }),
                ),
                PipelineError::NotImplemented(format) => (
                    StatusCode::NOT_IMPLEMENTED,
                    json!({ "error": e.to_string(), "format": format }),
                ),
                PipelineError::Stage {
                    import_file_id,
                    ref message,
                } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": "Import failed",
                        "import_file_id": import_file_id,
                        "message": message,
                    }),
                ),
                PipelineError::Store(ref store) => {
                    error!(error = %store, "storage error during import");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({ "error": "Internal storage error" }),
                    )
                }
            },
            AppError::Store(e) => {
                error!(error = %e, "storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal storage error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
