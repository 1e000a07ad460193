//! `smalledger-core` — domain building blocks for point-to-point transfers.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod currency;
pub mod error;
pub mod id;
pub mod transfer;

pub use currency::{ConversionRate, CurrencyCode};
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, IdempotencyKey};
pub use transfer::{AccountBalance, AccountSide, Transfer};
