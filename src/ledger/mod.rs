//! 配额台账（Quota Ledger）模块。
//!
//! 按 (model, credential) 记录服务端返回的 RPM/TPM 余量，在每次调用前原子地预留配额，
//! 并在多凭据场景下挑选更可能有余量的凭据。

mod admission;
mod selector;
mod store;
mod types;

pub use admission::{AdmissionSettings, await_admission, wait_for_admission_blocking};
pub use selector::{choose_credential, choose_credential_at, choose_credential_with};
pub use store::QuotaLedger;
pub use types::{LedgerEntry, QuotaSnapshot};
