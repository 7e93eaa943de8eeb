//! Cache-aside access to wallets.
//!
//! Reads go to the LRU cache first and fall back to the backing store; writes go
//! through to the store and then refresh the cache. Store access for a wallet is
//! serialized by a per-wallet lock that is separate from the cache's own locks.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::cache::LruCache;
use crate::locks::KeyedLocks;
use crate::model::{Wallet, WalletId};

/// Error reported by a backing store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected wallet {wallet}: {reason}")]
    Rejected { wallet: WalletId, reason: String },
}

/// Durable key-value persistence for wallets.
pub trait WalletStore: Send + Sync {
    fn get(
        &self,
        wallet_id: &WalletId,
    ) -> impl Future<Output = Result<Option<Wallet>, StoreError>> + Send;

    fn put(&self, wallet: &Wallet) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Process-local store, used by the binary and in tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    wallets: RwLock<HashMap<WalletId, Wallet>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wallets(wallets: impl IntoIterator<Item = Wallet>) -> Self {
        let wallets = wallets
            .into_iter()
            .map(|wallet| (wallet.id().clone(), wallet))
            .collect();
        Self {
            wallets: RwLock::new(wallets),
            ..Self::default()
        }
    }

    /// Number of `get` calls served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `put` calls served.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl WalletStore for InMemoryStore {
    async fn get(&self, wallet_id: &WalletId) -> Result<Option<Wallet>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.wallets.read().await.get(wallet_id).cloned())
    }

    async fn put(&self, wallet: &Wallet) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.wallets
            .write()
            .await
            .insert(wallet.id().clone(), wallet.clone());
        Ok(())
    }
}

/// Wallet repository fronting a [`WalletStore`] with an [`LruCache`].
///
/// Store misses are cached too, so a repeated lookup of an unknown wallet does
/// not reach the store until the wallet is saved through this repository.
pub struct WalletRepository<S> {
    store: S,
    cache: LruCache<WalletId, Option<Wallet>>,
    store_locks: KeyedLocks<WalletId>,
}

impl<S: WalletStore> WalletRepository<S> {
    pub fn new(store: S, cache_capacity: NonZeroUsize) -> Self {
        Self {
            store,
            cache: LruCache::new(cache_capacity),
            store_locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load a wallet, from the cache when possible.
    pub async fn try_get(&self, wallet_id: &WalletId) -> Result<Option<Wallet>, StoreError> {
        if let Some(cached) = self.cache.get(wallet_id).await {
            debug!(wallet = %wallet_id, found = cached.is_some(), "cache hit");
            return Ok(cached);
        }

        let lock = self.store_locks.get(wallet_id);
        let _guard = lock.lock().await;

        let loaded = self.store.get(wallet_id).await?;
        debug!(wallet = %wallet_id, found = loaded.is_some(), "cache miss, loaded from store");
        // populate under the store lock so a concurrent save cannot be overwritten
        self.cache.put(wallet_id.clone(), loaded.clone()).await;
        Ok(loaded)
    }

    /// Write a wallet through to the store, then refresh its cache entry.
    ///
    /// Store failures are returned as is; the cache is left untouched.
    pub async fn save(&self, wallet: &Wallet) -> Result<(), StoreError> {
        let lock = self.store_locks.get(wallet.id());
        let _guard = lock.lock().await;

        self.store.put(wallet).await?;
        self.cache
            .put(wallet.id().clone(), Some(wallet.clone()))
            .await;
        Ok(())
    }
}
