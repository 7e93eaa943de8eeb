//! Error types for transaction coordination.

use thiserror::Error;

use crate::model::WalletId;
use crate::repository::StoreError;

/// Fatal error returned by [`TransactionCoordinator::handle`](super::TransactionCoordinator::handle).
///
/// Fraud rejections are not errors; they come back as a
/// [`Alert::TransactionCanceled`](crate::alert::Alert::TransactionCanceled).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),

    #[error("store failure for wallet {wallet}: {source}")]
    Persistence { wallet: WalletId, source: StoreError },

    #[error("wallet {wallet} still locked after {attempts} attempts")]
    LockContentionExceeded { wallet: WalletId, attempts: u32 },
}
