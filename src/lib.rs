pub mod alert;
pub mod amount;
pub mod analytics;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod csv;
pub mod fraud;
pub mod locks;
pub mod model;
pub mod repository;

pub use alert::Alert;
pub use amount::Amount;
pub use coordinator::{CoordinatorError, Request, TransactionCoordinator};
pub use model::{Currency, Transaction, TransactionKind, TxId, Wallet, WalletId};
