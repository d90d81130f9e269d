use crate::ledger::AdmissionSettings;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8046;
const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_LIMIT_AWAIT_TIMEOUT: f64 = 60.0;
const DEFAULT_LIMIT_AWAIT_SLEEP: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub upstream_base_url: String,
    pub api_keys: Vec<String>,

    pub timeout_ms: u64,
    pub proxy: String,

    /// 等待配额的超时（秒）。
    pub limit_await_timeout: f64,
    /// 等待配额的轮询间隔（秒）。
    pub limit_await_sleep: f64,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "UPSTREAM_BASE_URL")]
    upstream_base_url: Option<String>,
    #[serde(alias = "API_KEYS")]
    api_keys: Option<String>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "LIMIT_AWAIT_TIMEOUT")]
    limit_await_timeout: Option<f64>,
    #[serde(alias = "LIMIT_AWAIT_SLEEP")]
    limit_await_sleep: Option<f64>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            upstream_base_url: raw
                .upstream_base_url
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string()),
            api_keys: parse_api_keys(raw.api_keys.as_deref()),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            limit_await_timeout: raw
                .limit_await_timeout
                .unwrap_or(DEFAULT_LIMIT_AWAIT_TIMEOUT),
            limit_await_sleep: raw.limit_await_sleep.unwrap_or(DEFAULT_LIMIT_AWAIT_SLEEP),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings::from_secs_f64(self.limit_await_timeout, self.limit_await_sleep)
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

fn parse_api_keys(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for part in value.split(',') {
        let p = part.trim();
        if p.is_empty() || out.iter().any(|k| k == p) {
            continue;
        }
        out.push(p.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let cfg = Config::from_raw(RawEnv::default());
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.upstream_base_url, DEFAULT_UPSTREAM_BASE_URL);
        assert!(cfg.api_keys.is_empty());
        let s = cfg.admission_settings();
        assert_eq!(s.timeout, Duration::from_secs(60));
        assert_eq!(s.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn api_keys_are_split_trimmed_and_deduplicated() {
        assert_eq!(
            parse_api_keys(Some(" sk-a, sk-b,,sk-a ")),
            vec!["sk-a".to_string(), "sk-b".to_string()]
        );
        assert!(parse_api_keys(Some(" , ")).is_empty());
    }

    #[test]
    fn upstream_trailing_slash_is_removed() {
        let cfg = Config::from_raw(RawEnv {
            upstream_base_url: Some("http://localhost:9000/v1/".to_string()),
            ..RawEnv::default()
        });
        assert_eq!(cfg.upstream_base_url, "http://localhost:9000/v1");
    }
}
