//! Transaction coordination.
//!
//! The coordinator applies one transaction at a time per wallet:
//! lock the wallet, load it, screen the transaction, then either report the
//! rejection or persist the wallet, fold the transaction into analytics and
//! derive alerts. Calls for different wallets run fully in parallel.

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tokio::time::timeout;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertEngine, RateProvider, Screened};
use crate::analytics::AnalyticsEngine;
use crate::config::{ConfigError, CoordinatorConfig, EngineConfig};
use crate::fraud::Verdict;
use crate::locks::KeyedLocks;
use crate::model::{Transaction, TxId, WalletId};
use crate::repository::{WalletRepository, WalletStore};

mod error;
pub use error::CoordinatorError;

mod stage;
pub use stage::Stage;

/// A transaction addressed to a wallet.
#[derive(Debug, Clone)]
pub struct Request {
    pub wallet_id: WalletId,
    pub transaction: Transaction,
}

/// Result of one request processed by [`TransactionCoordinator::run`].
#[derive(Debug)]
pub struct Outcome {
    pub wallet_id: WalletId,
    pub tx: TxId,
    pub result: Result<Alert, CoordinatorError>,
}

/// Serializes transaction application per wallet.
pub struct TransactionCoordinator<S, R> {
    repository: WalletRepository<S>,
    analytics: AnalyticsEngine,
    alerts: AlertEngine<R>,
    wallet_locks: KeyedLocks<WalletId>,
    settings: CoordinatorConfig,
}

/// Public API
impl<S: WalletStore, R: RateProvider> TransactionCoordinator<S, R> {
    /// Build a coordinator over `store`.
    ///
    /// Fraud rules travel with each wallet's detector: `config.fraud` is
    /// validated here but only takes effect for wallets created with
    /// [`Wallet::with_rules`](crate::model::Wallet::with_rules).
    pub fn new(store: S, rates: R, config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            repository: WalletRepository::new(store, config.cache_capacity()?),
            analytics: AnalyticsEngine::new(),
            alerts: AlertEngine::new(rates, config.alerts),
            wallet_locks: KeyedLocks::new(),
            settings: config.coordinator.clone(),
        })
    }

    pub fn repository(&self) -> &WalletRepository<S> {
        &self.repository
    }

    pub fn analytics(&self) -> &AnalyticsEngine {
        &self.analytics
    }

    /// Apply `tx` to the wallet and report the resulting alert.
    ///
    /// A fraud rejection is returned as `Ok(Alert::TransactionCanceled)` and
    /// leaves stored state untouched. The wallet lock is released on every path.
    pub async fn handle(
        &self,
        tx: Transaction,
        wallet_id: &WalletId,
    ) -> Result<Alert, CoordinatorError> {
        debug!(wallet = %wallet_id, tx = tx.id, stage = %Stage::Pending);
        let _guard = self.lock_wallet(wallet_id).await?;
        debug!(wallet = %wallet_id, tx = tx.id, stage = %Stage::Locked);

        let tx_id = tx.id;
        let result = self.apply(tx, wallet_id).await;
        Self::log_result(wallet_id, tx_id, &result);
        result
    }

    /// Process a stream of requests in arrival order. Fatal errors are
    /// collected into the outcomes and do not stop the stream.
    pub async fn run(&self, mut stream: impl Stream<Item = Request> + Unpin) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some(Request {
            wallet_id,
            transaction,
        }) = stream.next().await
        {
            let tx = transaction.id;
            let result = self.handle(transaction, &wallet_id).await;
            outcomes.push(Outcome {
                wallet_id,
                tx,
                result,
            });
        }
        outcomes
    }
}

/// Private API
impl<S: WalletStore, R: RateProvider> TransactionCoordinator<S, R> {
    /// Take the wallet lock, waiting at most `lock_timeout` per attempt.
    async fn lock_wallet(
        &self,
        wallet_id: &WalletId,
    ) -> Result<OwnedMutexGuard<()>, CoordinatorError> {
        let lock = self.wallet_locks.get(wallet_id);
        let attempts = self.settings.max_lock_retries + 1;

        for attempt in 1..=attempts {
            match timeout(self.settings.lock_timeout(), Arc::clone(&lock).lock_owned()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => warn!(wallet = %wallet_id, attempt, attempts, "wallet busy"),
            }
        }

        Err(CoordinatorError::LockContentionExceeded {
            wallet: wallet_id.clone(),
            attempts,
        })
    }

    /// Load, screen, persist, analyse. Must run under the wallet lock.
    async fn apply(&self, tx: Transaction, wallet_id: &WalletId) -> Result<Alert, CoordinatorError> {
        let mut wallet = self
            .repository
            .try_get(wallet_id)
            .await
            .map_err(|source| CoordinatorError::Persistence {
                wallet: wallet_id.clone(),
                source,
            })?
            .ok_or_else(|| CoordinatorError::WalletNotFound(wallet_id.clone()))?;
        let base_currency = wallet.base_currency();

        if let Verdict::Rejected(reason) = wallet.screen(&tx) {
            debug!(wallet = %wallet_id, tx = tx.id, stage = %Stage::FraudRejected);
            return Ok(self
                .alerts
                .derive(&tx, wallet_id, base_currency, Screened::Rejected(reason)));
        }

        wallet.append(tx.clone());
        self.repository
            .save(&wallet)
            .await
            .map_err(|source| CoordinatorError::Persistence {
                wallet: wallet_id.clone(),
                source,
            })?;
        debug!(wallet = %wallet_id, tx = tx.id, stage = %Stage::Persisted);

        // folded only once the wallet is stored, so a failed save leaves no trace
        let snapshot = self.analytics.update(wallet_id, &tx);
        Ok(self
            .alerts
            .derive(&tx, wallet_id, base_currency, Screened::Accepted(&snapshot)))
    }

    /// Small helper to log `handle` results
    fn log_result(wallet_id: &WalletId, tx: TxId, result: &Result<Alert, CoordinatorError>) {
        match result {
            Ok(Alert::TransactionCanceled {
                reason,
                transaction,
                ..
            }) => {
                info!(
                    wallet = %wallet_id,
                    tx = tx,
                    amount = %transaction.amount,
                    currency = %transaction.currency,
                    reason = %reason,
                    stage = %Stage::Completed,
                    "transaction rejected"
                );
            }
            Ok(alert) => {
                info!(
                    wallet = %wallet_id,
                    tx = tx,
                    alerts = alert.iter().count(),
                    stage = %Stage::Completed,
                    "transaction applied"
                );
            }
            Err(e) => {
                warn!(wallet = %wallet_id, tx = tx, reason = %e, "transaction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::alert::FixedRates;
    use crate::fraud::{FraudRejection, FraudRules};
    use crate::model::{Currency, Wallet};
    use crate::repository::{InMemoryStore, StoreError};
    use chrono::{DateTime, TimeZone, Utc};

    // test utils

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn deposit(id: TxId, secs: i64, amount: f64) -> Transaction {
        Transaction::deposit(id, at(secs), Amount::from_float(amount), Currency::USD)
    }

    fn withdrawal(id: TxId, secs: i64, amount: f64) -> Transaction {
        Transaction::withdrawal(id, at(secs), Amount::from_float(amount), Currency::USD)
    }

    fn wallet_id() -> WalletId {
        "w1".to_string()
    }

    fn coordinator_with<S: WalletStore>(
        store: S,
        config: &EngineConfig,
    ) -> TransactionCoordinator<S, FixedRates> {
        TransactionCoordinator::new(store, FixedRates::default(), config).unwrap()
    }

    fn coordinator() -> TransactionCoordinator<InMemoryStore, FixedRates> {
        let store = InMemoryStore::with_wallets([Wallet::new("w1", Currency::USD)]);
        coordinator_with(store, &EngineConfig::default())
    }

    async fn stored_wallet<S: WalletStore, R: RateProvider>(
        coordinator: &TransactionCoordinator<S, R>,
    ) -> Wallet {
        coordinator
            .repository()
            .try_get(&wallet_id())
            .await
            .unwrap()
            .unwrap()
    }

    /// Serves reads from an inner store and fails every write.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: InMemoryStore,
    }

    impl WalletStore for ReadOnlyStore {
        async fn get(&self, wallet_id: &WalletId) -> Result<Option<Wallet>, StoreError> {
            self.inner.get(wallet_id).await
        }

        async fn put(&self, wallet: &Wallet) -> Result<(), StoreError> {
            Err(StoreError::Rejected {
                wallet: wallet.id().clone(),
                reason: "read only".into(),
            })
        }
    }

    // Accepted path

    #[tokio::test]
    async fn accepted_deposit_is_persisted_and_analysed() {
        let coordinator = coordinator();
        let alert = coordinator.handle(deposit(1, 0, 100.0), &wallet_id()).await.unwrap();

        assert!(!alert.is_canceled());
        assert_eq!(coordinator.repository().store().writes(), 1);
        assert_eq!(stored_wallet(&coordinator).await.transaction_count(), 1);
        assert_eq!(
            coordinator.analytics().net_balance(&wallet_id(), Currency::USD),
            Some(Amount::from_float(100.0))
        );
    }

    #[tokio::test]
    async fn low_balance_shows_up_in_composite() {
        let coordinator = coordinator();
        coordinator.handle(deposit(1, 0, 100.0), &wallet_id()).await.unwrap();
        let alert = coordinator
            .handle(withdrawal(2, 60, 95.0), &wallet_id())
            .await
            .unwrap();

        assert!(matches!(alert, Alert::Composite(_)));
        assert!(alert.iter().any(|a| matches!(
            a,
            Alert::BalanceBelow { balance, .. } if *balance == Amount::from_float(5.0)
        )));
    }

    #[tokio::test]
    async fn healthy_wallet_is_all_good() {
        let coordinator = coordinator();
        let alert = coordinator.handle(deposit(1, 0, 500.0), &wallet_id()).await.unwrap();
        // 500 < 1000 minimum balance
        assert!(!alert.is_all_good());
        assert!(alert.iter().any(|a| matches!(a, Alert::BalanceBelow { .. })));

        let alert = coordinator.handle(deposit(2, 60, 600.0), &wallet_id()).await.unwrap();
        assert!(alert.is_all_good());
    }

    // Rejected path

    #[tokio::test]
    async fn round_trip_is_canceled_without_side_effects() {
        let coordinator = coordinator();
        coordinator.handle(deposit(1, 0, 100.0), &wallet_id()).await.unwrap();

        let alert = coordinator
            .handle(withdrawal(2, 10, 10.0), &wallet_id())
            .await
            .unwrap();

        assert!(matches!(
            alert,
            Alert::TransactionCanceled {
                reason: FraudRejection::SuspiciousRoundTrip,
                ..
            }
        ));
        assert_eq!(coordinator.repository().store().writes(), 1);
        assert_eq!(stored_wallet(&coordinator).await.transaction_count(), 1);
        assert_eq!(
            coordinator.analytics().net_balance(&wallet_id(), Currency::USD),
            Some(Amount::from_float(100.0))
        );
    }

    #[tokio::test]
    async fn burst_of_withdrawals_hits_rate_limit() {
        let coordinator = coordinator();
        coordinator.handle(deposit(1, 0, 100.0), &wallet_id()).await.unwrap();

        for (i, secs) in [40, 50, 60, 70, 80].into_iter().enumerate() {
            let alert = coordinator
                .handle(withdrawal(2 + i as TxId, secs, 50.0), &wallet_id())
                .await
                .unwrap();
            assert!(!alert.is_canceled(), "withdrawal at {secs}s");
        }

        let alert = coordinator
            .handle(withdrawal(10, 90, 50.0), &wallet_id())
            .await
            .unwrap();
        assert!(matches!(
            alert,
            Alert::TransactionCanceled {
                reason: FraudRejection::RateLimitExceeded,
                ..
            }
        ));
        assert_eq!(stored_wallet(&coordinator).await.transaction_count(), 6);
    }

    // Fatal errors

    #[tokio::test]
    async fn screening_uses_the_wallet_rules() {
        let strict = FraudRules {
            rate_limit_window: 0,
            ..FraudRules::default()
        };
        let store = InMemoryStore::with_wallets([Wallet::with_rules("w1", Currency::USD, strict)]);
        let coordinator = coordinator_with(store, &EngineConfig::default());

        let first = coordinator.handle(withdrawal(1, 0, 10.0), &wallet_id()).await.unwrap();
        assert!(!first.is_canceled());

        let second = coordinator.handle(withdrawal(2, 60, 10.0), &wallet_id()).await.unwrap();
        assert!(matches!(
            second,
            Alert::TransactionCanceled {
                reason: FraudRejection::RateLimitExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_wallet_is_fatal() {
        let coordinator = coordinator();
        let result = coordinator.handle(deposit(1, 0, 10.0), &"ghost".to_string()).await;
        assert!(matches!(result, Err(CoordinatorError::WalletNotFound(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn persistence_failure_is_fatal_and_leaves_no_trace() {
        let store = ReadOnlyStore {
            inner: InMemoryStore::with_wallets([Wallet::new("w1", Currency::USD)]),
        };
        let coordinator = coordinator_with(store, &EngineConfig::default());

        let result = coordinator.handle(deposit(1, 0, 10.0), &wallet_id()).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::Persistence {
                source: StoreError::Rejected { .. },
                ..
            })
        ));
        assert_eq!(coordinator.analytics().net_balance(&wallet_id(), Currency::USD), None);
        assert_eq!(stored_wallet(&coordinator).await.transaction_count(), 0);

        // the lock was released: the next call fails the same way instead of timing out
        let again = coordinator.handle(deposit(2, 60, 10.0), &wallet_id()).await;
        assert!(matches!(again, Err(CoordinatorError::Persistence { .. })));
    }

    #[tokio::test]
    async fn lock_contention_is_bounded() {
        let mut config = EngineConfig::default();
        config.coordinator.max_lock_retries = 2;
        config.coordinator.lock_timeout_ms = 10;
        let store = InMemoryStore::with_wallets([Wallet::new("w1", Currency::USD)]);
        let coordinator = coordinator_with(store, &config);

        let held = coordinator.wallet_locks.get(&wallet_id()).lock_owned().await;
        let result = coordinator.handle(deposit(1, 0, 10.0), &wallet_id()).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::LockContentionExceeded { attempts: 3, .. })
        ));
        assert_eq!(coordinator.repository().store().reads(), 0);

        drop(held);
        assert!(coordinator.handle(deposit(1, 0, 10.0), &wallet_id()).await.is_ok());
    }

    #[tokio::test]
    async fn waiter_proceeds_once_lock_is_released() {
        let mut config = EngineConfig::default();
        config.coordinator.lock_timeout_ms = 1_000;
        let store = InMemoryStore::with_wallets([Wallet::new("w1", Currency::USD)]);
        let coordinator = Arc::new(coordinator_with(store, &config));

        let held = coordinator.wallet_locks.get(&wallet_id()).lock_owned().await;
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.handle(deposit(1, 0, 10.0), &wallet_id()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    // Concurrency

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_on_one_wallet_lose_no_updates() {
        let mut config = EngineConfig::default();
        config.coordinator.lock_timeout_ms = 5_000;
        let store = InMemoryStore::with_wallets([Wallet::new("w1", Currency::USD)]);
        let coordinator = Arc::new(coordinator_with(store, &config));

        let mut handles = Vec::new();
        for i in 0..32u32 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .handle(deposit(i, i as i64 * 60, 10.0), &wallet_id())
                    .await
            }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap().unwrap().is_canceled());
        }

        let wallet = stored_wallet(&coordinator).await;
        assert_eq!(wallet.transaction_count(), 32);
        assert_eq!(wallet.detector().stats(Currency::USD).unwrap().count(), 32);
        assert_eq!(coordinator.repository().store().writes(), 32);
        assert_eq!(
            coordinator.analytics().net_balance(&wallet_id(), Currency::USD),
            Some(Amount::from_float(320.0))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_wallets_run_independently() {
        let store = InMemoryStore::with_wallets(
            (0..8).map(|i| Wallet::new(format!("w{i}"), Currency::USD)),
        );
        let coordinator = Arc::new(coordinator_with(store, &EngineConfig::default()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                let id = format!("w{i}");
                for n in 0..5u32 {
                    coordinator
                        .handle(deposit(n, n as i64 * 60, 20.0), &id)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..8 {
            assert_eq!(
                coordinator.analytics().net_balance(&format!("w{i}"), Currency::USD),
                Some(Amount::from_float(100.0))
            );
        }
    }

    // Stream

    #[tokio::test]
    async fn run_continues_past_fatal_errors() {
        let coordinator = coordinator();
        let requests = vec![
            Request {
                wallet_id: wallet_id(),
                transaction: deposit(1, 0, 100.0),
            },
            Request {
                wallet_id: "ghost".to_string(),
                transaction: deposit(2, 0, 100.0),
            },
            Request {
                wallet_id: wallet_id(),
                transaction: deposit(3, 60, 100.0),
            },
        ];

        let outcomes = coordinator.run(tokio_stream::iter(requests)).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(CoordinatorError::WalletNotFound(_))
        ));
        assert_eq!(outcomes[2].tx, 3);
        assert_eq!(
            coordinator.analytics().net_balance(&wallet_id(), Currency::USD),
            Some(Amount::from_float(200.0))
        );
    }
}
