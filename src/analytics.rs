//! Incrementally maintained wallet analytics.
//!
//! For every wallet and currency the engine keeps the net balance, a running
//! average of transaction value per day and the highest signed transaction
//! value. Each accepted transaction is folded in once; nothing is recomputed
//! from the wallet's log.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::Amount;
use crate::model::{Currency, Transaction, WalletId};

/// Running average of signed transaction values for one day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyAverage {
    pub average: f64,
    pub count: u32,
}

impl DailyAverage {
    fn first(value: Amount) -> Self {
        Self {
            average: value.to_float(),
            count: 1,
        }
    }

    fn fold(&mut self, value: Amount) {
        let count = self.count as f64;
        self.average = (self.average * count + value.to_float()) / (count + 1.0);
        self.count += 1;
    }

    /// Sum of the day's signed values.
    pub fn volume(&self) -> f64 {
        self.average * self.count as f64
    }
}

#[derive(Debug, Clone)]
struct CurrencyMetrics {
    net_balance: Amount,
    daily: BTreeMap<NaiveDate, DailyAverage>,
    highest_value: Amount,
}

impl CurrencyMetrics {
    fn first(tx: &Transaction) -> Self {
        let value = tx.signed_amount();
        Self {
            net_balance: value,
            daily: BTreeMap::from([(tx.timestamp.date_naive(), DailyAverage::first(value))]),
            highest_value: value,
        }
    }

    fn fold(&mut self, tx: &Transaction) {
        let value = tx.signed_amount();
        self.net_balance += value;
        self.daily
            .entry(tx.timestamp.date_naive())
            .and_modify(|day| day.fold(value))
            .or_insert_with(|| DailyAverage::first(value));
        self.highest_value = self.highest_value.max(value);
    }
}

/// Metrics for one wallet and currency right after a transaction was folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsSnapshot {
    pub currency: Currency,
    pub net_balance: Amount,
    pub highest_value: Amount,
    pub date: NaiveDate,
    pub daily_average: DailyAverage,
}

/// Per-wallet analytics. State is kept for every wallet ever updated.
#[derive(Debug, Default)]
pub struct AnalyticsEngine {
    wallets: DashMap<WalletId, HashMap<Currency, CurrencyMetrics>>,
}

impl AnalyticsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an accepted transaction into the wallet's metrics.
    pub fn update(&self, wallet_id: &WalletId, tx: &Transaction) -> AnalyticsSnapshot {
        let mut wallet = self.wallets.entry(wallet_id.clone()).or_default();
        let metrics = wallet
            .entry(tx.currency)
            .and_modify(|metrics| metrics.fold(tx))
            .or_insert_with(|| CurrencyMetrics::first(tx));

        let date = tx.timestamp.date_naive();
        AnalyticsSnapshot {
            currency: tx.currency,
            net_balance: metrics.net_balance,
            highest_value: metrics.highest_value,
            date,
            daily_average: metrics
                .daily
                .get(&date)
                .copied()
                .unwrap_or(DailyAverage::first(tx.signed_amount())),
        }
    }

    pub fn net_balance(&self, wallet_id: &WalletId, currency: Currency) -> Option<Amount> {
        self.with_metrics(wallet_id, currency, |m| Some(m.net_balance))
    }

    pub fn highest_value(&self, wallet_id: &WalletId, currency: Currency) -> Option<Amount> {
        self.with_metrics(wallet_id, currency, |m| Some(m.highest_value))
    }

    pub fn daily_average(
        &self,
        wallet_id: &WalletId,
        currency: Currency,
        date: NaiveDate,
    ) -> Option<DailyAverage> {
        self.with_metrics(wallet_id, currency, |m| m.daily.get(&date).copied())
    }

    /// Count-weighted average over the inclusive date range.
    pub fn average_between(
        &self,
        wallet_id: &WalletId,
        currency: Currency,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Option<f64> {
        if start > end {
            return None;
        }
        self.with_metrics(wallet_id, currency, |m| {
            let (volume, count) = m
                .daily
                .range(start..=end)
                .fold((0.0, 0u64), |(volume, count), (_, day)| {
                    (volume + day.volume(), count + day.count as u64)
                });
            (count > 0).then(|| volume / count as f64)
        })
    }

    /// Day with the largest summed value; the earliest one wins ties.
    pub fn highest_volume_day(&self, wallet_id: &WalletId, currency: Currency) -> Option<NaiveDate> {
        self.with_metrics(wallet_id, currency, |m| {
            let mut best: Option<(NaiveDate, f64)> = None;
            for (date, day) in &m.daily {
                if best.is_none_or(|(_, volume)| day.volume() > volume) {
                    best = Some((*date, day.volume()));
                }
            }
            best.map(|(date, _)| date)
        })
    }

    /// Day with the most transactions; the earliest one wins ties.
    pub fn busiest_day(&self, wallet_id: &WalletId, currency: Currency) -> Option<NaiveDate> {
        self.with_metrics(wallet_id, currency, |m| {
            let mut best: Option<(NaiveDate, u32)> = None;
            for (date, day) in &m.daily {
                if best.is_none_or(|(_, count)| day.count > count) {
                    best = Some((*date, day.count));
                }
            }
            best.map(|(date, _)| date)
        })
    }

    fn with_metrics<T>(
        &self,
        wallet_id: &WalletId,
        currency: Currency,
        f: impl FnOnce(&CurrencyMetrics) -> Option<T>,
    ) -> Option<T> {
        let wallet = self.wallets.get(wallet_id)?;
        wallet.get(&currency).and_then(f)
    }
}
