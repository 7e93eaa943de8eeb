use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::alert::Alert;
use crate::coordinator::{Outcome, Request};
use crate::fraud::FraudRules;
use crate::model::{Currency, Transaction, TransactionKind, TxId, Wallet, WalletId};
use crate::Amount;

/// Errors that can occur when reading csv input
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized transaction type '{tx_type}'")]
    UnrecognizedType { line: usize, tx_type: String },

    #[error("line {line}: {reason}")]
    InvalidCurrency { line: usize, reason: String },

    #[error("line {line}: negative amount {amount}")]
    NegativeAmount { line: usize, amount: f64 },

    #[error("line {line}: amount {amount} is not a representable value")]
    InvalidAmount { line: usize, amount: f64 },
}

/// Largest amount that fits an [`Amount`] after scaling.
const MAX_AMOUNT: f64 = (i64::MAX / Amount::SCALE) as f64;

#[derive(Debug, Deserialize)]
struct WalletRow {
    wallet: WalletId,
    base_currency: String,
}

#[derive(Debug, Deserialize)]
struct TransactionRow {
    wallet: WalletId,
    tx: TxId,
    timestamp: DateTime<Utc>,
    r#type: String,
    amount: f64,
    currency: String,
}

#[derive(Debug, Serialize)]
struct OutcomeRow<'a> {
    wallet: &'a str,
    tx: TxId,
    status: &'static str,
    alert: String,
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })
}

fn parse_currency(line: usize, value: &str) -> Result<Currency, CsvError> {
    value
        .parse()
        .map_err(|reason| CsvError::InvalidCurrency { line, reason })
}

/// Read wallet definitions (`wallet,base_currency`) from a csv file
pub fn read_wallets(
    path: impl AsRef<Path>,
    rules: FraudRules,
) -> Result<impl Iterator<Item = Result<Wallet, CsvError>>, CsvError> {
    let reader = open(path.as_ref())?;

    Ok(reader
        .into_deserialize::<WalletRow>()
        .enumerate()
        .map(move |(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let currency = parse_currency(line, &row.base_currency)?;
            Ok(Wallet::with_rules(row.wallet, currency, rules))
        }))
}

/// Read transaction requests (`wallet,tx,timestamp,type,amount,currency`) from a csv file
pub fn read_requests(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Request, CsvError>>, CsvError> {
    let reader = open(path.as_ref())?;

    Ok(reader
        .into_deserialize::<TransactionRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let kind = match row.r#type.as_str() {
                "deposit" => TransactionKind::Deposit,
                "withdrawal" => TransactionKind::Withdrawal,
                other => {
                    return Err(CsvError::UnrecognizedType {
                        line,
                        tx_type: other.to_string(),
                    });
                }
            };
            if !row.amount.is_finite() || row.amount.abs() > MAX_AMOUNT {
                return Err(CsvError::InvalidAmount {
                    line,
                    amount: row.amount,
                });
            }
            if row.amount < 0.0 {
                return Err(CsvError::NegativeAmount {
                    line,
                    amount: row.amount,
                });
            }
            let currency = parse_currency(line, &row.currency)?;
            Ok(Request {
                wallet_id: row.wallet,
                transaction: Transaction {
                    id: row.tx,
                    timestamp: row.timestamp,
                    amount: Amount::from_float(row.amount),
                    kind,
                    currency,
                },
            })
        }))
}

/// Write outcomes in csv format (`wallet,tx,status,alert`)
pub fn write_outcomes<'a>(
    outcomes: impl IntoIterator<Item = &'a Outcome>,
    writer: impl io::Write,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for outcome in outcomes {
        let (status, alert) = match &outcome.result {
            Ok(alert @ Alert::TransactionCanceled { .. }) => ("canceled", alert.to_string()),
            Ok(Alert::AllGood) => ("ok", Alert::AllGood.to_string()),
            Ok(alert) => ("alert", alert.to_string().replace('\n', "; ")),
            Err(e) => ("failed", e.to_string()),
        };
        writer.serialize(OutcomeRow {
            wallet: &outcome.wallet_id,
            tx: outcome.tx,
            status,
            alert,
        })?;
    }

    writer.flush()?;
    Ok(())
}
