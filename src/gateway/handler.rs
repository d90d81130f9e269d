use crate::client::{CHAT_COMPLETIONS_PATH, CallOptions, EMBEDDINGS_PATH, LimitedClient};
use crate::duration::format_duration_ms;
use crate::error::AppError;
use crate::ingest;
use crate::logging::{self, LogLevel};
use crate::util::id;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// 客户端通过该请求头告知本次调用预估的 token 数。
pub const HEADER_TOKEN_ESTIMATE: &str = "x-token-estimate";

/// 网关共享状态。
#[derive(Debug)]
pub struct GatewayState {
    pub client: LimitedClient,
    pub log_level: LogLevel,
}

pub async fn handle_health() -> &'static str {
    "ok"
}

pub async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    forward(&state, CHAT_COMPLETIONS_PATH, &headers, body).await
}

pub async fn handle_embeddings(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    forward(&state, EMBEDDINGS_PATH, &headers, body).await
}

async fn forward(
    state: &GatewayState,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request_id = id::request_id();
    let start = Instant::now();
    let token_cost = token_estimate(headers)?;
    if state.log_level.client_enabled() {
        logging::client_request("POST", path, headers, token_cost);
    }

    let mut opts = CallOptions::with_cost(token_cost);
    // 网关未配置凭据时，透传客户端自己的 Bearer key。
    if state.client.credentials().is_empty() {
        let Some(key) = ingest::credential_from_headers(headers) else {
            return Err(AppError::bad_request("缺少 Authorization: Bearer <key>"));
        };
        opts = opts.credential(key);
    }

    let resp = match state.client.post_json(path, body.to_vec(), opts).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(request_id = %request_id, path, error = %e, "转发失败");
            return Err(e.into());
        }
    };

    let status = resp.status();
    let mut out_headers = HeaderMap::new();
    for (name, value) in resp.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        out_headers.append(name.clone(), value.clone());
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| AppError::backend(e.to_string()))?;

    if state.log_level.raw_enabled() {
        logging::backend_response_raw(status.as_u16(), start.elapsed(), &bytes);
    }
    tracing::debug!(
        request_id = %request_id,
        path,
        status = status.as_u16(),
        elapsed_ms = logging::elapsed_ms(start.elapsed()),
        "转发完成"
    );

    Ok((status, out_headers, bytes).into_response())
}

fn token_estimate(headers: &HeaderMap) -> Result<u64, AppError> {
    let Some(v) = headers.get(HEADER_TOKEN_ESTIMATE) else {
        return Ok(0);
    };
    v.to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| AppError::bad_request(format!("{HEADER_TOKEN_ESTIMATE} 必须是非负整数")))
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection" | "transfer-encoding" | "content-length" | "keep-alive"
    )
}

/// `/v1/limits` 返回的单条台账视图（凭据已脱敏）。
#[derive(Debug, Serialize)]
pub struct LimitView {
    pub model: String,
    pub credential: String,
    pub requests_limit: u64,
    pub requests_remaining: u64,
    pub tokens_limit: u64,
    pub tokens_remaining: u64,
    pub requests_reset_in: String,
    pub tokens_reset_in: String,
}

fn reset_in(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let ms = (at - now).num_milliseconds().max(0) as u64;
    format_duration_ms(ms)
}

pub async fn handle_limits(State(state): State<Arc<GatewayState>>) -> Json<Vec<LimitView>> {
    let now = Utc::now();
    let views = state
        .client
        .ledger()
        .snapshot_at(now)
        .into_iter()
        .map(|e| LimitView {
            model: e.model,
            credential: logging::mask_credential(&e.credential),
            requests_limit: e.snapshot.requests_limit,
            requests_remaining: e.snapshot.requests_remaining,
            tokens_limit: e.snapshot.tokens_limit,
            tokens_remaining: e.snapshot.tokens_remaining,
            requests_reset_in: reset_in(e.snapshot.requests_reset_at, now),
            tokens_reset_in: reset_in(e.snapshot.tokens_reset_at, now),
        })
        .collect();
    Json(views)
}

pub async fn handle_reset_limits(State(state): State<Arc<GatewayState>>) -> StatusCode {
    state.client.ledger().reset();
    tracing::info!("配额台账已清空");
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::router;
    use crate::ingest::*;
    use crate::ledger::{AdmissionSettings, QuotaLedger, QuotaSnapshot};
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::{Value, json};

    async fn spawn_gateway(upstream: &MockServer, keys: &[&str]) -> (String, Arc<QuotaLedger>) {
        let ledger = Arc::new(QuotaLedger::new());
        let client = LimitedClient::new(
            reqwest::Client::new(),
            upstream.base_url(),
            keys.iter().map(|k| k.to_string()).collect(),
            ledger.clone(),
        )
        .with_settings(AdmissionSettings::from_secs_f64(0.05, 0.01));
        let state = Arc::new(GatewayState {
            client,
            log_level: LogLevel::Off,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{addr}"), ledger)
    }

    fn chat_body() -> Value {
        json!({"model": "gpt-4-0613", "messages": [{"role": "user", "content": "hi"}]})
    }

    #[tokio::test]
    async fn proxies_and_exposes_learned_limits() {
        let upstream = MockServer::start_async().await;
        let mock = upstream
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer sk-configured-0001");
                then.status(200)
                    .header(HEADER_RESPONSE_MODEL, "gpt-4-0613")
                    .header(HEADER_LIMIT_REQUESTS, "200")
                    .header(HEADER_REMAINING_REQUESTS, "199")
                    .header(HEADER_LIMIT_TOKENS, "40000")
                    .header(HEADER_REMAINING_TOKENS, "39950")
                    .header(HEADER_RESET_REQUESTS, "1m")
                    .header(HEADER_RESET_TOKENS, "75ms")
                    .json_body(json!({"id": "chatcmpl-1"}));
            })
            .await;

        let (base, ledger) = spawn_gateway(&upstream, &["sk-configured-0001"]).await;
        let http = reqwest::Client::new();
        let resp = http
            .post(format!("{base}/v1/chat/completions"))
            .header(HEADER_TOKEN_ESTIMATE, "50")
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers()
                .get(HEADER_REMAINING_REQUESTS)
                .and_then(|v| v.to_str().ok()),
            Some("199")
        );
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["id"], "chatcmpl-1");
        mock.assert_hits_async(1).await;
        assert_eq!(
            ledger
                .peek("gpt-4-0613", "sk-configured-0001")
                .unwrap()
                .tokens_remaining,
            39950
        );

        let limits: Value = http
            .get(format!("{base}/v1/limits"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(limits[0]["model"], "gpt-4-0613");
        assert_eq!(limits[0]["credential"], "sk-c***0001");
        assert_eq!(limits[0]["requests_remaining"], 199);

        let status = http
            .delete(format!("{base}/v1/limits"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status.as_u16(), 204);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn admission_timeout_returns_429() {
        let upstream = MockServer::start_async().await;
        let (base, ledger) = spawn_gateway(&upstream, &["sk-0"]).await;
        let now = Utc::now();
        ledger.merge(
            "gpt-4-0613",
            "sk-0",
            QuotaSnapshot {
                requests_limit: 1,
                requests_remaining: 0,
                tokens_limit: 10,
                tokens_remaining: 0,
                requests_reset_at: now + chrono::Duration::hours(1),
                tokens_reset_at: now + chrono::Duration::hours(1),
            },
        );

        let resp = reqwest::Client::new()
            .post(format!("{base}/v1/chat/completions"))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 429);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "rate_limit_timeout");
    }

    #[tokio::test]
    async fn client_key_is_used_when_gateway_has_none() {
        let upstream = MockServer::start_async().await;
        let mock = upstream
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embeddings")
                    .header("authorization", "Bearer sk-client");
                then.status(200).json_body(json!({"data": []}));
            })
            .await;
        let (base, _ledger) = spawn_gateway(&upstream, &[]).await;
        let http = reqwest::Client::new();
        let body = json!({"model": "text-embedding-ada-002", "input": "hello"});

        let resp = http
            .post(format!("{base}/v1/embeddings"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        let resp = http
            .post(format!("{base}/v1/embeddings"))
            .bearer_auth("sk-client")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn invalid_token_estimate_is_rejected() {
        let upstream = MockServer::start_async().await;
        let (base, _ledger) = spawn_gateway(&upstream, &["sk-0"]).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/v1/chat/completions"))
            .header(HEADER_TOKEN_ESTIMATE, "lots")
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[test]
    fn reset_in_never_goes_negative() {
        let now = Utc::now();
        assert_eq!(reset_in(now - chrono::Duration::seconds(5), now), "0ms");
        assert_eq!(reset_in(now + chrono::Duration::seconds(61), now), "1m1s");
    }
}
