//! Core domain types for the wallet engine.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::Amount;
use crate::fraud::{FraudRules, StreamingFraudDetector, Verdict};

/// Wallet identifier.
pub type WalletId = String;

/// Transaction identifier.
pub type TxId = u32;

/// Currencies a wallet can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum Currency {
    USD,
    EUR,
    GBP,
    IRC,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::IRC => "IRC",
        };
        f.write_str(code)
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "GBP" => Ok(Currency::GBP),
            "IRC" => Ok(Currency::IRC),
            other => Err(format!("unknown currency '{other}'")),
        }
    }
}

/// Direction of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Credit funds to the wallet.
    Deposit,
    /// Debit funds from the wallet.
    Withdrawal,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Deposit => f.write_str("deposit"),
            TransactionKind::Withdrawal => f.write_str("withdrawal"),
        }
    }
}

/// An immutable transaction as received from the edge.
///
/// `amount` is always a non-negative magnitude; the direction lives in `kind`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TxId,
    pub timestamp: DateTime<Utc>,
    pub amount: Amount,
    pub kind: TransactionKind,
    pub currency: Currency,
}

impl Transaction {
    pub fn deposit(id: TxId, timestamp: DateTime<Utc>, amount: Amount, currency: Currency) -> Self {
        Self {
            id,
            timestamp,
            amount,
            kind: TransactionKind::Deposit,
            currency,
        }
    }

    pub fn withdrawal(
        id: TxId,
        timestamp: DateTime<Utc>,
        amount: Amount,
        currency: Currency,
    ) -> Self {
        Self {
            id,
            timestamp,
            amount,
            kind: TransactionKind::Withdrawal,
            currency,
        }
    }

    /// Amount with the direction applied: positive for deposits, negative for withdrawals.
    pub fn signed_amount(&self) -> Amount {
        match self.kind {
            TransactionKind::Deposit => self.amount,
            TransactionKind::Withdrawal => -self.amount,
        }
    }
}

/// A wallet: its transaction log, partitioned by currency, and the fraud
/// detector that screens every transaction applied to it.
///
/// The detector is owned by the wallet and travels with it through the cache
/// and the store.
#[derive(Debug, Clone)]
pub struct Wallet {
    id: WalletId,
    base_currency: Currency,
    transactions: HashMap<Currency, Vec<Transaction>>,
    detector: StreamingFraudDetector,
}

impl Wallet {
    pub fn new(id: impl Into<WalletId>, base_currency: Currency) -> Self {
        Self::with_rules(id, base_currency, FraudRules::default())
    }

    pub fn with_rules(id: impl Into<WalletId>, base_currency: Currency, rules: FraudRules) -> Self {
        Self {
            id: id.into(),
            base_currency,
            transactions: HashMap::new(),
            detector: StreamingFraudDetector::new(rules),
        }
    }

    pub fn id(&self) -> &WalletId {
        &self.id
    }

    pub fn base_currency(&self) -> Currency {
        self.base_currency
    }

    /// Logged transactions for one currency, in application order.
    pub fn transactions_for(&self, currency: Currency) -> &[Transaction] {
        self.transactions
            .get(&currency)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.values().map(Vec::len).sum()
    }

    /// Screen a transaction against this wallet's fraud state.
    pub fn screen(&mut self, tx: &Transaction) -> Verdict {
        self.detector.evaluate(tx)
    }

    /// Append an accepted transaction to the log.
    pub fn append(&mut self, tx: Transaction) {
        self.transactions.entry(tx.currency).or_default().push(tx);
    }

    pub fn detector(&self) -> &StreamingFraudDetector {
        &self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn signed_amount_follows_kind() {
        let dep = Transaction::deposit(1, at(0), Amount::from_float(10.0), Currency::USD);
        let wd = Transaction::withdrawal(2, at(0), Amount::from_float(10.0), Currency::USD);
        assert_eq!(dep.signed_amount(), Amount::from_float(10.0));
        assert_eq!(wd.signed_amount(), Amount::from_float(-10.0));
    }

    #[test]
    fn log_is_partitioned_by_currency() {
        let mut wallet = Wallet::new("w1", Currency::USD);
        wallet.append(Transaction::deposit(1, at(0), Amount::from_float(1.0), Currency::USD));
        wallet.append(Transaction::deposit(2, at(1), Amount::from_float(2.0), Currency::EUR));
        wallet.append(Transaction::deposit(3, at(2), Amount::from_float(3.0), Currency::USD));

        let usd: Vec<TxId> = wallet.transactions_for(Currency::USD).iter().map(|t| t.id).collect();
        assert_eq!(usd, vec![1, 3]);
        assert_eq!(wallet.transactions_for(Currency::EUR).len(), 1);
        assert!(wallet.transactions_for(Currency::GBP).is_empty());
        assert_eq!(wallet.transaction_count(), 3);
    }

    #[test]
    fn currency_parses_case_insensitively() {
        assert_eq!("usd".parse::<Currency>(), Ok(Currency::USD));
        assert_eq!("GBP".parse::<Currency>(), Ok(Currency::GBP));
        assert!("XYZ".parse::<Currency>().is_err());
    }
}
