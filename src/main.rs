use std::env;
use std::io;
use std::process::ExitCode;

use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use wallet_engine::alert::FixedRates;
use wallet_engine::config::{EngineConfig, load_config};
use wallet_engine::coordinator::TransactionCoordinator;
use wallet_engine::csv::{read_requests, read_wallets, write_outcomes};
use wallet_engine::repository::InMemoryStore;

const USAGE: &str = "usage: wallet-engine <wallets.csv> <transactions.csv> [config.toml]";

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let (wallets_path, requests_path) = match (args.first(), args.get(1)) {
        (Some(wallets), Some(requests)) => (wallets.clone(), requests.clone()),
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    let config = match args.get(2) {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(2);
            }
        },
        None => EngineConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(io::stderr)
        .init();

    let wallets = match read_wallets(&wallets_path, config.fraud) {
        Ok(rows) => rows.filter_map(|row| row.inspect_err(|e| warn!("{e}")).ok()),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let store = InMemoryStore::with_wallets(wallets);

    let coordinator = match TransactionCoordinator::new(store, FixedRates::default(), &config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let requests = match read_requests(requests_path) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (request_sender, request_receiver) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        for result in requests {
            match result {
                Ok(request) => {
                    if request_sender.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let outcomes = coordinator.run(ReceiverStream::new(request_receiver)).await;

    if let Err(e) = write_outcomes(&outcomes, io::stdout().lock()) {
        eprintln!("failed to write output: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
