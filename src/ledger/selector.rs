//! 凭据选择：优先在“明确可用”的凭据中均匀随机选择，没有时退化为在全部候选中随机。
//!
//! 退化分支宁可让调用方随后排队等待，也不直接拒绝请求。

use crate::error::LimiterError;
use crate::ledger::QuotaLedger;
use chrono::{DateTime, Utc};

/// 为一次预计消耗 `token_cost` 的调用选择凭据。
pub fn choose_credential(
    ledger: &QuotaLedger,
    model: &str,
    candidates: &[String],
    token_cost: u64,
) -> Result<String, LimiterError> {
    let mut rng = fastrand::Rng::new();
    choose_credential_with(ledger, model, candidates, token_cost, &mut rng)
}

/// 使用调用方提供的随机源（可固定种子，便于测试复现）。
pub fn choose_credential_with(
    ledger: &QuotaLedger,
    model: &str,
    candidates: &[String],
    token_cost: u64,
    rng: &mut fastrand::Rng,
) -> Result<String, LimiterError> {
    choose_credential_at(ledger, model, candidates, token_cost, rng, Utc::now())
}

pub fn choose_credential_at(
    ledger: &QuotaLedger,
    model: &str,
    candidates: &[String],
    token_cost: u64,
    rng: &mut fastrand::Rng,
    now: DateTime<Utc>,
) -> Result<String, LimiterError> {
    match candidates {
        [] => {
            return Err(LimiterError::NoCandidates {
                model: model.to_string(),
            });
        }
        [only] => return Ok(only.clone()),
        _ => {}
    }

    let snapshots = ledger.peek_many_at(model, candidates, now);
    // 未观测过的凭据同样视为明确可用。
    let clearly_free: Vec<&String> = candidates
        .iter()
        .zip(&snapshots)
        .filter(|(_, snap)| match snap {
            Some(s) => s.can_admit(token_cost),
            None => true,
        })
        .map(|(credential, _)| credential)
        .collect();

    if clearly_free.is_empty() {
        tracing::debug!(model, token_cost, "没有明确可用的凭据，随机选择一个等待配额");
        return Ok(candidates[rng.usize(..candidates.len())].clone());
    }
    Ok(clearly_free[rng.usize(..clearly_free.len())].clone())
}
