use crate::ledger::types::{LedgerEntry, QuotaSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// 配额台账：model -> credential -> 最近观测到的配额快照。
///
/// 同步调用方（线程）与异步调用方（tokio 任务）共用同一把互斥锁，
/// 临界区只做内存读写，不在持锁期间 await 或 sleep。
#[derive(Debug, Default)]
pub struct QuotaLedger {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    models: HashMap<String, HashMap<String, QuotaSnapshot>>,
}

impl Inner {
    fn entry_mut(
        &mut self,
        model: &str,
        credential: &str,
        now: DateTime<Utc>,
    ) -> Option<&mut QuotaSnapshot> {
        let snap = self.models.get_mut(model)?.get_mut(credential)?;
        snap.refill_expired(now);
        Some(snap)
    }
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // 每个临界区结束时 map 都是一致的，中毒后直接取回内部数据即可。
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 用最新观测值整体覆盖 (model, credential) 的快照。
    pub fn merge(&self, model: &str, credential: &str, snapshot: QuotaSnapshot) {
        let mut inner = self.lock();
        inner
            .models
            .entry(model.to_string())
            .or_default()
            .insert(credential.to_string(), snapshot);
    }

    /// 读取快照（先按需惰性重置窗口并写回）。`None` 表示从未观测过。
    pub fn peek(&self, model: &str, credential: &str) -> Option<QuotaSnapshot> {
        self.peek_at(model, credential, Utc::now())
    }

    pub fn peek_at(
        &self,
        model: &str,
        credential: &str,
        now: DateTime<Utc>,
    ) -> Option<QuotaSnapshot> {
        let mut inner = self.lock();
        inner.entry_mut(model, credential, now).cloned()
    }

    /// 一次性读取多个凭据的快照，保证它们来自同一时刻的台账视图。
    pub fn peek_many_at(
        &self,
        model: &str,
        credentials: &[String],
        now: DateTime<Utc>,
    ) -> Vec<Option<QuotaSnapshot>> {
        let mut inner = self.lock();
        credentials
            .iter()
            .map(|c| inner.entry_mut(model, c, now).cloned())
            .collect()
    }

    /// 原子地检查并预留一次调用所需的配额。
    ///
    /// - 未观测过的组合：放行且不记账（先调用一次才能学到真实上限）。
    /// - 已观测：仅当 `requests_remaining > 0` 且 `tokens_remaining > token_cost` 时扣减并放行。
    pub fn try_reserve(&self, model: &str, credential: &str, token_cost: u64) -> bool {
        self.try_reserve_at(model, credential, token_cost, Utc::now())
    }

    pub fn try_reserve_at(
        &self,
        model: &str,
        credential: &str,
        token_cost: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(snap) = inner.entry_mut(model, credential, now) else {
            return true;
        };
        if !snap.can_admit(token_cost) {
            return false;
        }
        snap.requests_remaining -= 1;
        snap.tokens_remaining -= token_cost;
        true
    }

    /// 清空整个台账。
    pub fn reset(&self) {
        self.lock().models.clear();
    }

    /// 导出全部条目（已应用惰性重置），按 model、credential 排序。
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        for (model, creds) in inner.models.iter_mut() {
            for (credential, snap) in creds.iter_mut() {
                snap.refill_expired(now);
                out.push(LedgerEntry {
                    model: model.clone(),
                    credential: credential.clone(),
                    snapshot: snap.clone(),
                });
            }
        }
        out.sort_by(|a, b| (&a.model, &a.credential).cmp(&(&b.model, &b.credential)));
        out
    }

    pub fn len(&self) -> usize {
        self.lock().models.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
