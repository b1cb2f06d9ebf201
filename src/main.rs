use std::sync::Arc;

use budgetdb::{
    api::{self, AppState},
    auth::{AuthState, CallerIdentity, UserRegistry},
    config::{CliArgs, Command, Config, LoggingConfig},
    engine::BalanceEngine,
    reports::LedgerReports,
};
use budgetdb_core::{LedgerStore, ReportValue, Role};
use budgetdb_sqlite::SqliteStorage;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_logging(&config.logging);

    let storage: Arc<dyn LedgerStore> = Arc::new(SqliteStorage::new(&config.database.path)?);
    tracing::debug!(path = %config.database.path, "Opened ledger store");

    // commands issued from the shell run with full rights
    let operator = CallerIdentity::new("cli", Role::Admin);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, storage).await?,
        Command::AddUser {
            username,
            password,
            role,
        } => {
            UserRegistry::new(storage).register(&username, &password, role)?;
            println!("User '{}' added with role {}", username, role);
        }
        Command::CloseBalance { range, min_profit } => {
            let balance = BalanceEngine::new(storage).create_balance_if_profitable(&operator, range, min_profit)?;
            println!("{}", ReportValue::Balances(vec![balance]));
        }
        Command::DropUnprofitable => {
            let balance = BalanceEngine::new(storage).delete_most_unprofitable_balance(&operator)?;
            println!("{}", ReportValue::Balances(vec![balance]));
        }
        Command::Report { query } => {
            println!("{}", LedgerReports::new(storage).run(&query)?);
        }
        Command::Check => {
            let drifted = LedgerReports::new(storage).inconsistent_balances()?;
            if !drifted.is_empty() {
                println!("{}", ReportValue::Balances(drifted.clone()));
                return Err(format!("{} balance(s) disagree with their operations", drifted.len()).into());
            }
            println!("All balances match their operations");
        }
    }

    Ok(())
}

async fn serve(config: Config, storage: Arc<dyn LedgerStore>) -> Result<(), BoxError> {
    let metrics = PrometheusBuilder::new().install_recorder()?;

    if config.auth.enabled {
        tracing::info!(api_keys = config.auth.api_keys.len(), "Authentication enabled");
    } else {
        tracing::warn!("Authentication disabled, every caller acts as admin");
    }

    let state = Arc::new(AppState {
        engine: BalanceEngine::new(storage.clone()),
        reports: LedgerReports::new(storage.clone()),
        metrics: Some(metrics),
    });
    let auth = Arc::new(AuthState {
        config: config.auth.clone(),
        users: UserRegistry::new(storage),
    });
    let app = api::router(state, auth);

    let addr = config.listen_addr()?;
    tracing::info!(%addr, "API listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
