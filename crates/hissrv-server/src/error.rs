use crate::scheduler::SchedulerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hissrv_collector::CollectorError;
use hissrv_timeseries::QueryError;
use serde_json::json;
use std::fmt;

/// API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 请求参数错误
    BadRequest(String),
    /// 资源不存在（未知任务、未知采集组、无数据）
    NotFound(String),
    /// 与正在进行的操作冲突
    Conflict(String),
    /// 查询超过截止时间
    Timeout(String),
    /// 时序库查询失败
    Backend(String),
    /// 内部错误
    InternalError(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "validation",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Timeout(_) => "timeout",
            ApiError::Backend(_) => "backend",
            ApiError::InternalError(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Backend(_) => StatusCode::BAD_GATEWAY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::Timeout(msg)
            | ApiError::Backend(msg)
            | ApiError::InternalError(msg) => msg,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.message(),
            "kind": self.kind(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Validation(e) => ApiError::BadRequest(e.to_string()),
            QueryError::NotFound(msg) => ApiError::NotFound(msg),
            e @ QueryError::Timeout(_) => ApiError::Timeout(e.to_string()),
            QueryError::Backend(e) => ApiError::Backend(e.to_string()),
        }
    }
}

impl From<CollectorError> for ApiError {
    fn from(err: CollectorError) -> Self {
        match err {
            e @ CollectorError::UnknownGroup(_) => ApiError::NotFound(e.to_string()),
            e @ CollectorError::CycleInProgress(_) => ApiError::Conflict(e.to_string()),
            e @ CollectorError::InvalidPattern { .. } => ApiError::InternalError(e.to_string()),
            CollectorError::Source(e) => ApiError::Backend(e.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            e @ SchedulerError::UnknownJob(_) => ApiError::NotFound(e.to_string()),
            e @ SchedulerError::AlreadyRunning(_) => ApiError::Conflict(e.to_string()),
            e @ SchedulerError::Interrupted(..) => ApiError::InternalError(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
