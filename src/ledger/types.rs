use chrono::{DateTime, Utc};
use serde::Serialize;

/// 凭据在某个模型上最近一次观测到的配额状态。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    /// 每个窗口内的请求数上限（RPM）。
    pub requests_limit: u64,
    pub requests_remaining: u64,
    /// 每个窗口内的 token 上限（TPM）。
    pub tokens_limit: u64,
    pub tokens_remaining: u64,
    /// 请求窗口重置时间（绝对时间）。
    pub requests_reset_at: DateTime<Utc>,
    /// token 窗口重置时间（绝对时间）。
    pub tokens_reset_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    /// 到达重置时间的维度恢复为满额。
    ///
    /// 返回是否发生了重置。
    pub fn refill_expired(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if now >= self.requests_reset_at && self.requests_remaining != self.requests_limit {
            self.requests_remaining = self.requests_limit;
            changed = true;
        }
        if now >= self.tokens_reset_at && self.tokens_remaining != self.tokens_limit {
            self.tokens_remaining = self.tokens_limit;
            changed = true;
        }
        changed
    }

    /// 是否还能容纳一次 `token_cost` 的调用。
    ///
    /// token 比较为严格大于：为计数误差留出余量。
    pub fn can_admit(&self, token_cost: u64) -> bool {
        self.requests_remaining > 0 && self.tokens_remaining > token_cost
    }
}

/// 诊断用的台账条目。
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub model: String,
    pub credential: String,
    pub snapshot: QuotaSnapshot,
}
