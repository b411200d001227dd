use thiserror::Error;

/// 时序库访问错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("time-series store unavailable: {0}")]
    Unavailable(String),

    #[error("time-series store request timed out: {0}")]
    Timeout(String),

    #[error("time-series store rejected credentials: {0}")]
    Unauthorized(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("time-series store rejected request: {0}")]
    Rejected(String),

    #[error("unexpected time-series store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// 超时、连接失败、限流、5xx 视为瞬时错误，可重试
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else if err.is_builder() {
            StoreError::Rejected(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}
