//! 带配额控制的上游客户端。
//!
//! 一次调用的流程：选择凭据（多凭据时）→ 等待准入 → 发出请求 → 采集响应头中的配额信息。

use crate::config::Config;
use crate::error::LimiterError;
use crate::ingest::{self, CompletedCall};
use crate::ledger::{self, AdmissionSettings, QuotaLedger};
use crate::logging::{self, LogLevel};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
pub const EMBEDDINGS_PATH: &str = "/embeddings";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("请求体缺少 model 字段")]
    MissingModel,

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// 单次调用的参数。
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// 调用方预估的 token 消耗。
    pub token_cost: u64,
    /// 指定凭据；为空时从客户端配置的凭据中选择。
    pub credential: Option<String>,
}

impl CallOptions {
    pub fn with_cost(token_cost: u64) -> Self {
        Self {
            token_cost,
            credential: None,
        }
    }

    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct LimitedClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Vec<String>,
    ledger: Arc<QuotaLedger>,
    settings: AdmissionSettings,
    log_level: LogLevel,
}

impl LimitedClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        credentials: Vec<String>,
        ledger: Arc<QuotaLedger>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            ledger,
            settings: AdmissionSettings::default(),
            log_level: LogLevel::Off,
        }
    }

    pub fn from_config(cfg: &Config, ledger: Arc<QuotaLedger>) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));
        if let Some(timeout) = http_timeout(cfg) {
            builder = builder.timeout(timeout);
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }
        let http = builder.build()?;

        Ok(
            Self::new(http, &cfg.upstream_base_url, cfg.api_keys.clone(), ledger)
                .with_settings(cfg.admission_settings())
                .with_log_level(cfg.log_level()),
        )
    }

    pub fn with_settings(mut self, settings: AdmissionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn credentials(&self) -> &[String] {
        &self.credentials
    }

    pub async fn chat_completions(
        &self,
        body: Vec<u8>,
        opts: CallOptions,
    ) -> Result<reqwest::Response, ClientError> {
        self.post_json(CHAT_COMPLETIONS_PATH, body, opts).await
    }

    pub async fn embeddings(
        &self,
        body: Vec<u8>,
        opts: CallOptions,
    ) -> Result<reqwest::Response, ClientError> {
        self.post_json(EMBEDDINGS_PATH, body, opts).await
    }

    /// 以 JSON 方式 POST 到上游 `path`，并在发出前等待配额。
    ///
    /// 上游返回非 2xx 时照常返回响应，由调用方处理状态码。
    pub async fn post_json(
        &self,
        path: &str,
        body: Vec<u8>,
        opts: CallOptions,
    ) -> Result<reqwest::Response, ClientError> {
        let (model, credential) = prepare_call(
            &self.ledger,
            &self.credentials,
            &body,
            opts.credential,
            opts.token_cost,
        )?;

        ledger::await_admission(
            &self.ledger,
            &model,
            &credential,
            opts.token_cost,
            self.settings,
        )
        .await?;

        let url = format!("{}{}", self.base_url, path);
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &url, &model, &credential);
        }

        let start = Instant::now();
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&credential)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body.clone())
            .send()
            .await?;

        if self.log_level.backend_enabled() {
            logging::backend_response(resp.status().as_u16(), start.elapsed(), resp.headers());
        }

        ingest::ingest_completed_call(
            &self.ledger,
            CompletedCall {
                credential: &credential,
                admitted_model: Some(&model),
                response_headers: resp.headers(),
                request_headers: None,
                request_body: Some(&body),
            },
        );

        Ok(resp)
    }
}

/// 读取请求体中的模型名，并确定本次调用使用的凭据（未指定时从候选中选择）。
pub(crate) fn prepare_call(
    ledger: &QuotaLedger,
    credentials: &[String],
    body: &[u8],
    pinned: Option<String>,
    token_cost: u64,
) -> Result<(String, String), ClientError> {
    let model = ingest::model_from_body(body).ok_or(ClientError::MissingModel)?;
    let credential = match pinned {
        Some(c) => c,
        None => ledger::choose_credential(ledger, &model, credentials, token_cost)?,
    };
    Ok((model, credential))
}

/// 上游请求超时；配置为 0 时不设置。
pub(crate) fn http_timeout(cfg: &Config) -> Option<Duration> {
    (cfg.timeout_ms > 0).then(|| Duration::from_millis(cfg.timeout_ms))
}
