use reqwest::header::HeaderMap;
use std::time::Duration;

/// 日志等级：
/// - off：不输出请求/响应细节
/// - low：输出客户端请求（脱敏）
/// - medium：额外输出后端请求与配额响应头
/// - high：额外输出后端原始响应体
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn elapsed_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// 凭据只保留首尾少量字符。
pub fn mask_credential(credential: &str) -> String {
    const KEEP: usize = 4;
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= KEEP * 2 {
        return "***".to_string();
    }
    let head: String = chars[..KEEP].iter().collect();
    let tail: String = chars[chars.len() - KEEP..].iter().collect();
    format!("{head}***{tail}")
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, token_cost: u64) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path} token_cost={token_cost}\n[客户端请求头]\n{}=========================================================",
        format_headers(headers),
    );
}

pub fn backend_request(method: &str, url: &str, model: &str, credential: &str) {
    tracing::info!(
        "[后端请求] {method} {url} model={model} key={}",
        mask_credential(credential)
    );
}

pub fn backend_response(status: u16, duration: Duration, headers: &HeaderMap) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n[配额响应头]\n{}==========================================================",
        status,
        elapsed_ms(duration),
        format_quota_headers(headers),
    );
}

pub fn backend_response_raw(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n=================== 后端响应（RAW） ===================\n[后端响应] {} {}ms\n{}\n=========================================================",
        status,
        elapsed_ms(duration),
        String::from_utf8_lossy(body),
    );
}

fn is_redacted(name: &str) -> bool {
    matches!(
        name,
        "authorization" | "proxy-authorization" | "x-api-key" | "cookie"
    )
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let val = if key == "authorization" || key == "proxy-authorization" {
            "Bearer ***"
        } else if is_redacted(key) {
            "***"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(val);
        out.push('\n');
    }
    out
}

fn format_quota_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        if !(key.starts_with("x-ratelimit-") || key == crate::ingest::HEADER_RESPONSE_MODEL) {
            continue;
        }
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<binary>"));
        out.push('\n');
    }
    out
}
