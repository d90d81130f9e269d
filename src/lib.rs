//! OpenAI 兼容接口的配额控制：根据响应头记录每个 (model, key) 的 RPM/TPM 余量，
//! 在发出请求前等待配额，并在多个 key 之间挑选更可能有余量的一个。

pub mod blocking;
pub mod client;
pub mod config;
pub mod duration;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod ledger;
pub mod logging;
pub mod util;

pub use blocking::BlockingLimitedClient;
pub use client::{CallOptions, ClientError, LimitedClient};
pub use duration::{format_duration_ms, parse_duration_ms};
pub use error::LimiterError;
pub use ingest::{CompletedCall, ingest, ingest_completed_call};
pub use ledger::{
    AdmissionSettings, LedgerEntry, QuotaLedger, QuotaSnapshot, await_admission,
    choose_credential, choose_credential_with, wait_for_admission_blocking,
};
