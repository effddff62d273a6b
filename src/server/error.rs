use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::Error;

/// API错误类型
pub struct AppError {
    pub status: StatusCode,
    pub error: anyhow::Error,
}

impl AppError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self { status, error: error.into() }
    }
}

fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::Decode(_) | Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::CorruptIndex(_) => StatusCode::SERVICE_UNAVAILABLE,
        // 请求里只有图片，维度不符只可能来自向量化服务
        Error::Embed(_) | Error::DimensionMismatch { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.error.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let status = error.downcast_ref::<Error>().map_or(StatusCode::INTERNAL_SERVER_ERROR, status_of);
        Self { status, error }
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
