//! 准入控制：按固定间隔轮询台账，直到预留成功或超时。
//!
//! 台账不会主动唤醒等待者，新配额的发现延迟上限为一个轮询间隔。

use crate::error::LimiterError;
use crate::ledger::QuotaLedger;
use std::time::Duration;

const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_AWAIT_SLEEP: Duration = Duration::from_millis(10);

/// 单次准入请求的等待参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl AdmissionSettings {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// 以秒为单位构造；负数、NaN 按 0 处理。
    pub fn from_secs_f64(timeout: f64, poll_interval: f64) -> Self {
        Self::new(secs_or_zero(timeout), secs_or_zero(poll_interval))
    }

    /// 最大尝试次数 = floor(timeout / poll_interval)。
    ///
    /// poll_interval 为 0 时只尝试一次。
    pub fn max_attempts(&self) -> u64 {
        let poll = self.poll_interval.as_nanos();
        if poll == 0 {
            return 1;
        }
        (self.timeout.as_nanos() / poll).min(u64::MAX as u128) as u64
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self::new(DEFAULT_AWAIT_TIMEOUT, DEFAULT_AWAIT_SLEEP)
    }
}

fn secs_or_zero(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

/// 异步等待准入（tokio 任务中使用）。
///
/// 两次尝试之间让出执行权；外层 future 被 drop 时轮询立即终止，台账不留任何中间状态。
pub async fn await_admission(
    ledger: &QuotaLedger,
    model: &str,
    credential: &str,
    token_cost: u64,
    settings: AdmissionSettings,
) -> Result<(), LimiterError> {
    let max_attempts = settings.max_attempts();
    for attempt in 1..=max_attempts {
        if ledger.try_reserve(model, credential, token_cost) {
            log_admitted(model, token_cost, attempt);
            return Ok(());
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
    Err(timeout_error(model, token_cost, max_attempts))
}

/// 同步等待准入（普通线程中使用），与异步版本共用同一把台账锁。
pub fn wait_for_admission_blocking(
    ledger: &QuotaLedger,
    model: &str,
    credential: &str,
    token_cost: u64,
    settings: AdmissionSettings,
) -> Result<(), LimiterError> {
    let max_attempts = settings.max_attempts();
    for attempt in 1..=max_attempts {
        if ledger.try_reserve(model, credential, token_cost) {
            log_admitted(model, token_cost, attempt);
            return Ok(());
        }
        std::thread::sleep(settings.poll_interval);
    }
    Err(timeout_error(model, token_cost, max_attempts))
}

fn log_admitted(model: &str, token_cost: u64, attempt: u64) {
    if attempt > 1 {
        tracing::debug!(model, token_cost, attempt, "等待后获得配额");
    }
}

fn timeout_error(model: &str, token_cost: u64, attempts: u64) -> LimiterError {
    tracing::warn!(model, token_cost, attempts, "等待配额超时");
    LimiterError::AdmissionTimeout {
        model: model.to_string(),
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::QuotaSnapshot;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use std::time::Instant;

    fn exhausted(now: DateTime<Utc>) -> QuotaSnapshot {
        QuotaSnapshot {
            requests_limit: 10,
            requests_remaining: 0,
            tokens_limit: 1_000,
            tokens_remaining: 0,
            requests_reset_at: now + chrono::Duration::hours(1),
            tokens_reset_at: now + chrono::Duration::hours(1),
        }
    }

    #[test]
    fn max_attempts_is_floor_of_ratio() {
        assert_eq!(AdmissionSettings::from_secs_f64(0.05, 0.01).max_attempts(), 5);
        assert_eq!(AdmissionSettings::from_secs_f64(0.055, 0.01).max_attempts(), 5);
        assert_eq!(AdmissionSettings::default().max_attempts(), 6_000);
        assert_eq!(AdmissionSettings::from_secs_f64(0.005, 0.01).max_attempts(), 0);
        assert_eq!(AdmissionSettings::from_secs_f64(1.0, 0.0).max_attempts(), 1);
        assert_eq!(AdmissionSettings::from_secs_f64(-1.0, 0.01).max_attempts(), 0);
    }

    #[tokio::test]
    async fn unknown_pair_is_admitted_immediately() {
        let ledger = QuotaLedger::new();
        let settings = AdmissionSettings::from_secs_f64(0.05, 0.01);
        await_admission(&ledger, "gpt-4", "k", 100, settings)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_pair_times_out_after_all_attempts() {
        let ledger = QuotaLedger::new();
        ledger.merge("gpt-4", "k", exhausted(Utc::now()));
        let settings = AdmissionSettings::from_secs_f64(0.05, 0.01);

        let start = Instant::now();
        let err = await_admission(&ledger, "gpt-4", "k", 1, settings)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        match err {
            LimiterError::AdmissionTimeout { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(45), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert_eq!(ledger.peek("gpt-4", "k").unwrap().requests_remaining, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiter_picks_up_capacity_from_a_later_merge() {
        let ledger = Arc::new(QuotaLedger::new());
        let now = Utc::now();
        ledger.merge("gpt-4", "k", exhausted(now));

        let refresher = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let mut fresh = exhausted(Utc::now());
                fresh.requests_remaining = 1;
                fresh.tokens_remaining = 1_000;
                ledger.merge("gpt-4", "k", fresh);
            })
        };

        let settings = AdmissionSettings::from_secs_f64(2.0, 0.01);
        await_admission(&ledger, "gpt-4", "k", 10, settings)
            .await
            .unwrap();
        refresher.await.unwrap();

        let s = ledger.peek("gpt-4", "k").unwrap();
        assert_eq!(s.requests_remaining, 0);
        assert_eq!(s.tokens_remaining, 990);
    }

    #[tokio::test]
    async fn dropping_the_waiter_stops_polling() {
        let ledger = QuotaLedger::new();
        ledger.merge("gpt-4", "k", exhausted(Utc::now()));
        let settings = AdmissionSettings::from_secs_f64(10.0, 0.01);

        let start = Instant::now();
        let res = tokio::time::timeout(
            Duration::from_millis(30),
            await_admission(&ledger, "gpt-4", "k", 1, settings),
        )
        .await;
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn blocking_waiter_times_out_too() {
        let ledger = QuotaLedger::new();
        ledger.merge("gpt-4", "k", exhausted(Utc::now()));
        let settings = AdmissionSettings::from_secs_f64(0.03, 0.01);
        let err = wait_for_admission_blocking(&ledger, "gpt-4", "k", 1, settings).unwrap_err();
        assert!(err.is_timeout());

        ledger.reset();
        wait_for_admission_blocking(&ledger, "gpt-4", "k", 1, settings).unwrap();
    }
}
