//! Streaming fraud detection.
//!
//! The detector keeps rolling statistics per currency (count, sum and sum of
//! squares of the unsigned amounts) instead of the transaction history, plus a
//! short window of recent withdrawal timestamps used for rate limiting.
//!
//! Checks run in a fixed order: rate limit, round trip, statistical anomaly.
//! Only accepted transactions are folded into the statistics.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::Amount;
use crate::model::{Currency, Transaction, TransactionKind};

/// Tunables for the detector.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct FraudRules {
    /// A transaction further than this many standard deviations from the mean is anomalous.
    pub std_dev_multiplier: f64,
    /// Withdrawals are rate limited once the window holds more than this many entries.
    pub rate_limit_window: usize,
    /// Period the oldest windowed withdrawal must be older than for a new one to pass.
    pub rate_limit_period_secs: i64,
    /// Minimum gap between a deposit and a withdrawal (either direction).
    pub round_trip_secs: i64,
}

impl Default for FraudRules {
    fn default() -> Self {
        Self {
            std_dev_multiplier: 3.0,
            rate_limit_window: 4,
            rate_limit_period_secs: 120,
            round_trip_secs: 30,
        }
    }
}

/// Why a transaction was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FraudRejection {
    RateLimitExceeded,
    SuspiciousRoundTrip,
    AnomalousTransaction,
}

impl fmt::Display for FraudRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FraudRejection::RateLimitExceeded => {
                f.write_str("too many withdrawals in a short window")
            }
            FraudRejection::SuspiciousRoundTrip => {
                f.write_str("deposit and withdrawal too close to each other")
            }
            FraudRejection::AnomalousTransaction => {
                f.write_str("amount deviates too far from the usual pattern")
            }
        }
    }
}

/// Outcome of screening a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(FraudRejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Running statistics for one currency.
///
/// Sums are kept over scaled amounts in `i128` so that folding and unfolding
/// the same amount is exact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrencyStats {
    count: u64,
    sum: i128,
    sum_sq: i128,
    recent_withdrawals: VecDeque<DateTime<Utc>>,
}

impl CurrencyStats {
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Running sum, saturated to the range of [`Amount`].
    pub fn sum(&self) -> Amount {
        let clamped = self.sum.clamp(i64::MIN as i128, i64::MAX as i128);
        Amount::from_scaled(clamped as i64)
    }

    pub fn window_len(&self) -> usize {
        self.recent_withdrawals.len()
    }

    fn fold(&mut self, amount: Amount) {
        let x = amount.scaled() as i128;
        self.count += 1;
        self.sum += x;
        self.sum_sq += x * x;
    }

    fn unfold(&mut self, amount: Amount) {
        let x = amount.scaled() as i128;
        self.count -= 1;
        self.sum -= x;
        self.sum_sq -= x * x;
    }

    /// Mean in scaled units.
    fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Population standard deviation in scaled units; zero below two samples.
    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self.sum_sq as f64 / self.count as f64 - mean * mean;
        variance.max(0.0).sqrt()
    }

    fn is_anomalous(&self, amount: Amount, multiplier: f64) -> bool {
        (amount.scaled() as f64 - self.mean()).abs() > multiplier * self.std_dev()
    }
}

/// Per-wallet streaming detector. Must see a wallet's transactions one at a
/// time, in timestamp order.
#[derive(Debug, Clone)]
pub struct StreamingFraudDetector {
    rules: FraudRules,
    stats: HashMap<Currency, CurrencyStats>,
    last_deposit: Option<DateTime<Utc>>,
    last_withdrawal: Option<DateTime<Utc>>,
}

impl StreamingFraudDetector {
    pub fn new(rules: FraudRules) -> Self {
        Self {
            rules,
            stats: HashMap::new(),
            last_deposit: None,
            last_withdrawal: None,
        }
    }

    pub fn rules(&self) -> &FraudRules {
        &self.rules
    }

    pub fn stats(&self, currency: Currency) -> Option<&CurrencyStats> {
        self.stats.get(&currency)
    }

    /// Screen `tx` and, if accepted, fold it into the rolling state.
    ///
    /// A rejected transaction leaves the detector exactly as it was.
    pub fn evaluate(&mut self, tx: &Transaction) -> Verdict {
        let rules = self.rules;
        let round_trip = Duration::seconds(rules.round_trip_secs);
        let stats = self.stats.entry(tx.currency).or_default();

        match tx.kind {
            TransactionKind::Withdrawal => {
                // inspect only, the oldest entry is popped on the accept path below
                if stats.recent_withdrawals.len() > rules.rate_limit_window {
                    if let Some(oldest) = stats.recent_withdrawals.front() {
                        if *oldest + Duration::seconds(rules.rate_limit_period_secs)
                            >= tx.timestamp
                        {
                            return Verdict::Rejected(FraudRejection::RateLimitExceeded);
                        }
                    }
                }
                if self
                    .last_deposit
                    .is_some_and(|deposit| deposit + round_trip >= tx.timestamp)
                {
                    return Verdict::Rejected(FraudRejection::SuspiciousRoundTrip);
                }
            }
            TransactionKind::Deposit => {
                if self
                    .last_withdrawal
                    .is_some_and(|withdrawal| withdrawal + round_trip >= tx.timestamp)
                {
                    return Verdict::Rejected(FraudRejection::SuspiciousRoundTrip);
                }
            }
        }

        stats.fold(tx.amount);
        if stats.is_anomalous(tx.amount, rules.std_dev_multiplier) {
            stats.unfold(tx.amount);
            return Verdict::Rejected(FraudRejection::AnomalousTransaction);
        }

        match tx.kind {
            TransactionKind::Deposit => self.last_deposit = Some(tx.timestamp),
            TransactionKind::Withdrawal => {
                if stats.recent_withdrawals.len() > rules.rate_limit_window {
                    stats.recent_withdrawals.pop_front();
                }
                stats.recent_withdrawals.push_back(tx.timestamp);
                self.last_withdrawal = Some(tx.timestamp);
            }
        }
        Verdict::Accepted
    }
}

impl Default for StreamingFraudDetector {
    fn default() -> Self {
        Self::new(FraudRules::default())
    }
}
