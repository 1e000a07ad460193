pub mod rates;
pub mod system;
pub mod transactions;
