//! 同步版本的带配额客户端，供不在 tokio 运行时内的调用方使用。
//!
//! 与 [`LimitedClient`](crate::client::LimitedClient) 共用同一个 [`QuotaLedger`]：
//! 同步线程与异步任务看到的是同一份配额，也按同一规则准入。

use crate::client::{self, CHAT_COMPLETIONS_PATH, CallOptions, ClientError, EMBEDDINGS_PATH};
use crate::config::Config;
use crate::ingest::{self, CompletedCall};
use crate::ledger::{self, AdmissionSettings, QuotaLedger};
use crate::logging::{self, LogLevel};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BlockingLimitedClient {
    http: reqwest::blocking::Client,
    base_url: String,
    credentials: Vec<String>,
    ledger: Arc<QuotaLedger>,
    settings: AdmissionSettings,
    log_level: LogLevel,
}

impl BlockingLimitedClient {
    pub fn new(
        http: reqwest::blocking::Client,
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

    /// 不能在异步运行时内部调用（reqwest 的同步客户端会自建运行时）。
    pub fn from_config(cfg: &Config, ledger: Arc<QuotaLedger>) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::blocking::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));
        // 同步客户端默认带 30s 超时，这里以配置为准。
        builder = builder.timeout(client::http_timeout(cfg));
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

    pub fn chat_completions(
        &self,
        body: Vec<u8>,
        opts: CallOptions,
    ) -> Result<reqwest::blocking::Response, ClientError> {
        self.post_json(CHAT_COMPLETIONS_PATH, body, opts)
    }

    pub fn embeddings(
        &self,
        body: Vec<u8>,
        opts: CallOptions,
    ) -> Result<reqwest::blocking::Response, ClientError> {
        self.post_json(EMBEDDINGS_PATH, body, opts)
    }

    /// 阻塞当前线程直到获得配额，然后 POST 到上游 `path`。
    pub fn post_json(
        &self,
        path: &str,
        body: Vec<u8>,
        opts: CallOptions,
    ) -> Result<reqwest::blocking::Response, ClientError> {
        let (model, credential) = client::prepare_call(
            &self.ledger,
            &self.credentials,
            &body,
            opts.credential,
            opts.token_cost,
        )?;

        ledger::wait_for_admission_blocking(
            &self.ledger,
            &model,
            &credential,
            opts.token_cost,
            self.settings,
        )?;

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
            .send()?;

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
