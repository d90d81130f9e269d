use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 限流核心的错误类型。
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("时长格式错误 {input:?}: {reason}")]
    MalformedDuration { input: String, reason: &'static str },

    #[error("等待配额超时: model={model}，已尝试 {attempts} 次")]
    AdmissionTimeout { model: String, attempts: u64 },

    #[error("没有可选的凭据: model={model}")]
    NoCandidates { model: String },

    #[error("响应缺少配额信息: {field}")]
    MissingQuotaMetadata { field: String },
}

impl LimiterError {
    pub fn malformed_duration(input: impl Into<String>, reason: &'static str) -> Self {
        Self::MalformedDuration {
            input: input.into(),
            reason,
        }
    }

    pub fn missing_metadata(field: impl Into<String>) -> Self {
        Self::MissingQuotaMetadata {
            field: field.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AdmissionTimeout { .. })
    }
}

/// 网关对外的错误类型。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("后端请求失败: {0}")]
    Backend(String),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Backend(_) => StatusCode::BAD_GATEWAY,
            AppError::Limiter(e) if e.is_timeout() => StatusCode::TOO_MANY_REQUESTS,
            AppError::Limiter(LimiterError::NoCandidates { .. }) => StatusCode::BAD_REQUEST,
            AppError::Limiter(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::Config(_) => "config",
            AppError::Backend(_) => "backend",
            AppError::Limiter(e) if e.is_timeout() => "rate_limit_timeout",
            AppError::Limiter(_) => "limiter",
            AppError::Anyhow(_) => "internal",
        }
    }
}

impl From<crate::client::ClientError> for AppError {
    fn from(e: crate::client::ClientError) -> Self {
        use crate::client::ClientError;
        match e {
            ClientError::MissingModel => Self::bad_request("请求体缺少 model 字段"),
            ClientError::Limiter(inner) => Self::Limiter(inner),
            ClientError::Transport(inner) => Self::backend(inner.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: Some(self.kind().to_string()),
            },
        };

        (status, Json(body)).into_response()
    }
}
