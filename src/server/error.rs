//! 错误到HTTP响应的映射

use crate::core::error::CohdError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// 处理函数的错误类型
#[derive(Debug)]
pub struct ApiError(pub CohdError);

impl From<CohdError> for ApiError {
    fn from(e: CohdError) -> Self {
        ApiError(e)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError(CohdError::Internal(anyhow::anyhow!("后台任务异常: {}", e)))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_client_error() {
            tracing::debug!("请求被拒绝: {}", self.0);
        }
        match self.0 {
            CohdError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            CohdError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            CohdError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            e => {
                tracing::error!("请求处理失败: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}
