//! Alert derivation.
//!
//! Alerts are computed fresh for each transaction from the fraud outcome, the
//! wallet's analytics and an exchange rate. Thresholds are expressed in the
//! wallet's base currency.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use tracing::debug;

use crate::Amount;
use crate::analytics::AnalyticsSnapshot;
use crate::fraud::FraudRejection;
use crate::model::{Currency, Transaction, WalletId};

/// Source of exchange rates. Values may change between calls.
pub trait RateProvider: Send + Sync {
    /// Rate converting an amount in `other` into `base`.
    fn rate(&self, base: Currency, other: Currency) -> f64;
}

/// A fixed rate table. Same-currency pairs are always 1; missing pairs use the fallback.
#[derive(Debug, Clone)]
pub struct FixedRates {
    rates: HashMap<(Currency, Currency), f64>,
    fallback: f64,
}

impl FixedRates {
    pub fn new(fallback: f64) -> Self {
        Self {
            rates: HashMap::new(),
            fallback,
        }
    }

    pub fn with_rate(mut self, base: Currency, other: Currency, rate: f64) -> Self {
        self.rates.insert((base, other), rate);
        self
    }
}

impl Default for FixedRates {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl RateProvider for FixedRates {
    fn rate(&self, base: Currency, other: Currency) -> f64 {
        if base == other {
            return 1.0;
        }
        self.rates
            .get(&(base, other))
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// Alert thresholds, in the wallet's base currency.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub value_exceeds: f64,
    pub balance_below: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            value_exceeds: 1000.0,
            balance_below: 1000.0,
        }
    }
}

/// Outcome reported back for a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// The converted transaction value reached the threshold.
    ValueExceeds {
        value: Amount,
        currency: Currency,
        threshold: Amount,
        base_currency: Currency,
        rate: f64,
    },
    /// The converted net balance dropped below the threshold.
    BalanceBelow {
        balance: Amount,
        currency: Currency,
        threshold: Amount,
        base_currency: Currency,
        rate: f64,
    },
    /// The transaction was rejected by fraud screening and not applied.
    TransactionCanceled {
        reason: FraudRejection,
        transaction: Transaction,
        base_currency: Currency,
    },
    Composite(Vec<Alert>),
    AllGood,
}

impl Alert {
    pub fn is_all_good(&self) -> bool {
        matches!(self, Alert::AllGood)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Alert::TransactionCanceled { .. })
    }

    /// Individual alerts: the members of a composite, nothing for `AllGood`,
    /// the alert itself otherwise.
    pub fn iter(&self) -> impl Iterator<Item = &Alert> {
        let alerts: &[Alert] = match self {
            Alert::Composite(alerts) => alerts,
            Alert::AllGood => &[],
            other => std::slice::from_ref(other),
        };
        alerts.iter()
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::ValueExceeds {
                value,
                currency,
                threshold,
                base_currency,
                rate,
            } => write!(
                f,
                "value {value} {currency} exceeds the threshold of {threshold} {base_currency} by {} {base_currency}",
                value.convert(*rate) - *threshold
            ),
            Alert::BalanceBelow {
                balance,
                currency,
                threshold,
                base_currency,
                rate,
            } => write!(
                f,
                "{currency} balance of {balance} is below the minimum of {threshold} {base_currency} by {} {base_currency}",
                *threshold - balance.convert(*rate)
            ),
            Alert::TransactionCanceled {
                reason,
                transaction,
                ..
            } => write!(
                f,
                "transaction {} canceled: {reason} (date {}, time {}, currency {}, type {}, amount {})",
                transaction.id,
                transaction.timestamp.format("%Y-%m-%d"),
                transaction.timestamp.format("%H:%M:%S"),
                transaction.currency,
                transaction.kind,
                transaction.amount
            ),
            Alert::Composite(alerts) => {
                for (i, alert) in alerts.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{alert}")?;
                }
                Ok(())
            }
            Alert::AllGood => f.write_str("all good"),
        }
    }
}

/// What the alert engine knows about a screened transaction.
#[derive(Debug, Clone, Copy)]
pub enum Screened<'a> {
    Accepted(&'a AnalyticsSnapshot),
    Rejected(FraudRejection),
}

/// Derives alerts from screening and analytics results.
#[derive(Debug)]
pub struct AlertEngine<R> {
    rates: R,
    thresholds: AlertThresholds,
}

impl<R: RateProvider> AlertEngine<R> {
    pub fn new(rates: R, thresholds: AlertThresholds) -> Self {
        Self { rates, thresholds }
    }

    pub fn derive(
        &self,
        tx: &Transaction,
        wallet_id: &WalletId,
        base_currency: Currency,
        screened: Screened<'_>,
    ) -> Alert {
        let snapshot = match screened {
            Screened::Rejected(reason) => {
                return Alert::TransactionCanceled {
                    reason,
                    transaction: tx.clone(),
                    base_currency,
                };
            }
            Screened::Accepted(snapshot) => snapshot,
        };

        let rate = self.rates.rate(base_currency, tx.currency);
        let value_threshold = Amount::from_float(self.thresholds.value_exceeds);
        let balance_threshold = Amount::from_float(self.thresholds.balance_below);
        let mut alerts = Vec::new();

        if snapshot.net_balance.convert(rate) < balance_threshold {
            alerts.push(Alert::BalanceBelow {
                balance: snapshot.net_balance,
                currency: tx.currency,
                threshold: balance_threshold,
                base_currency,
                rate,
            });
        }

        let value = tx.signed_amount();
        if value.convert(rate) >= value_threshold {
            alerts.push(Alert::ValueExceeds {
                value,
                currency: tx.currency,
                threshold: value_threshold,
                base_currency,
                rate,
            });
        }

        debug!(wallet = %wallet_id, tx = tx.id, rate, triggered = alerts.len(), "alerts derived");
        if alerts.is_empty() {
            Alert::AllGood
        } else {
            Alert::Composite(alerts)
        }
    }
}
