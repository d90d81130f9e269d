//! 从上游响应头采集配额信息并写入台账。
//!
//! 采集失败只记日志，不影响这次调用本身的结果。

use crate::duration::parse_duration_ms;
use crate::error::LimiterError;
use crate::ledger::{QuotaLedger, QuotaSnapshot};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::Deserialize;

pub const HEADER_RESPONSE_MODEL: &str = "openai-model";
pub const HEADER_REQUEST_MODEL: &str = "x-model";
pub const HEADER_LIMIT_REQUESTS: &str = "x-ratelimit-limit-requests";
pub const HEADER_LIMIT_TOKENS: &str = "x-ratelimit-limit-tokens";
pub const HEADER_REMAINING_REQUESTS: &str = "x-ratelimit-remaining-requests";
pub const HEADER_REMAINING_TOKENS: &str = "x-ratelimit-remaining-tokens";
pub const HEADER_RESET_REQUESTS: &str = "x-ratelimit-reset-requests";
pub const HEADER_RESET_TOKENS: &str = "x-ratelimit-reset-tokens";

/// 解析一组响应头为配额快照（不写入台账）。
pub fn parse_quota_headers(
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<QuotaSnapshot, LimiterError> {
    let requests_limit = header_u64(headers, HEADER_LIMIT_REQUESTS)?;
    let tokens_limit = header_u64(headers, HEADER_LIMIT_TOKENS)?;
    let requests_remaining = header_u64(headers, HEADER_REMAINING_REQUESTS)?;
    let tokens_remaining = header_u64(headers, HEADER_REMAINING_TOKENS)?;
    let requests_reset_at = reset_at(headers, HEADER_RESET_REQUESTS, now)?;
    let tokens_reset_at = reset_at(headers, HEADER_RESET_TOKENS, now)?;

    Ok(QuotaSnapshot {
        requests_limit,
        // 保持 remaining <= limit。
        requests_remaining: requests_remaining.min(requests_limit),
        tokens_limit,
        tokens_remaining: tokens_remaining.min(tokens_limit),
        requests_reset_at,
        tokens_reset_at,
    })
}

/// 解析响应头并整体覆盖 (model, credential) 的台账条目。
///
/// 任一字段缺失或格式错误时返回错误，台账保持不变。
pub fn ingest(
    ledger: &QuotaLedger,
    model: &str,
    credential: &str,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<QuotaSnapshot, LimiterError> {
    let snapshot = parse_quota_headers(headers, now)?;
    ledger.merge(model, credential, snapshot.clone());
    Ok(snapshot)
}

/// 一次完成的上游调用（响应头 + 发出的请求）。
#[derive(Debug, Clone, Copy)]
pub struct CompletedCall<'a> {
    pub credential: &'a str,
    /// 发出前用于等待准入的模型名。与响应头中的模型不同时（别名 vs 带日期的版本），
    /// 两个键都会写入，保证下一次准入检查能看到上游给出的配额。
    pub admitted_model: Option<&'a str>,
    pub response_headers: &'a HeaderMap,
    pub request_headers: Option<&'a HeaderMap>,
    pub request_body: Option<&'a [u8]>,
}

/// 采集一次完成调用的配额信息；失败只记日志。
///
/// 返回是否成功写入台账。
pub fn ingest_completed_call(ledger: &QuotaLedger, call: CompletedCall<'_>) -> bool {
    let Some(model) = resolve_model(call.response_headers, call.request_headers, call.request_body)
    else {
        tracing::warn!("无法确定响应对应的模型，跳过配额采集");
        return false;
    };

    match ingest(
        ledger,
        &model,
        call.credential,
        call.response_headers,
        Utc::now(),
    ) {
        Ok(snap) => {
            if let Some(alias) = call.admitted_model.filter(|m| *m != model) {
                ledger.merge(alias, call.credential, snap.clone());
            }
            tracing::debug!(
                model = %model,
                requests_remaining = snap.requests_remaining,
                tokens_remaining = snap.tokens_remaining,
                "配额台账已更新"
            );
            true
        }
        Err(e) => {
            tracing::warn!(model = %model, error = %e, "配额信息解析失败，跳过采集");
            false
        }
    }
}

/// 按优先级确定模型：响应头 `openai-model` → 请求体 `model` 字段 → 请求头 `x-model`。
pub fn resolve_model(
    response_headers: &HeaderMap,
    request_headers: Option<&HeaderMap>,
    request_body: Option<&[u8]>,
) -> Option<String> {
    if let Some(m) = header_str(response_headers, HEADER_RESPONSE_MODEL) {
        return Some(m.to_string());
    }
    if let Some(m) = request_body.and_then(model_from_body) {
        return Some(m);
    }
    request_headers
        .and_then(|h| header_str(h, HEADER_REQUEST_MODEL))
        .map(str::to_string)
}

#[derive(Deserialize)]
struct ModelField {
    #[serde(default)]
    model: Option<String>,
}

/// 从 JSON 请求体中读取 `model` 字段。
pub fn model_from_body(body: &[u8]) -> Option<String> {
    let parsed: ModelField = sonic_rs::from_slice(body).ok()?;
    parsed.model.filter(|m| !m.trim().is_empty())
}

/// 从 `Authorization: Bearer <key>` 中取出凭据（scheme 不区分大小写）。
pub fn credential_from_authorization(value: &str) -> Option<&str> {
    let (scheme, key) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }
    let key = key.trim();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some(key)
}

/// 从请求头中取出 Bearer 凭据。
pub fn credential_from_headers(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    credential_from_authorization(value)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let v = headers.get(name)?.to_str().ok()?.trim();
    if v.is_empty() { None } else { Some(v) }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<u64, LimiterError> {
    header_str(headers, name)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| LimiterError::missing_metadata(name))
}

fn reset_at(
    headers: &HeaderMap,
    name: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, LimiterError> {
    let raw = header_str(headers, name).ok_or_else(|| LimiterError::missing_metadata(name))?;
    let ms = parse_duration_ms(raw).map_err(|_| LimiterError::missing_metadata(name))?;
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| LimiterError::missing_metadata(name))
}
