//! Infrastructure layer: resilience, rates, storage, orchestration, config.

pub mod config;
pub mod fanout;
pub mod ledger_service;
pub mod rates;
pub mod resilience;
pub mod store;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, LedgerConfig};
pub use fanout::{FanoutError, FanoutExecutor, FanoutOutput, FanoutStream, FanoutTask};
pub use ledger_service::{
    DEFAULT_FUNDS_CHECK_TIMEOUT, ErrorKind, LedgerDeps, LedgerService, TransferError,
    TransferReceipt,
};
