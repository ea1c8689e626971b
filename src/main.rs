use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use loyalty_rs::accrual::{AccrualClient, AccrualProcessor, ReconciliationService};
use loyalty_rs::auth::JwtKeys;
use loyalty_rs::config::Config;
use loyalty_rs::db;
use loyalty_rs::repos::{
    BalanceRepo, OrderRepo, UserRepo, BALANCE_REPO, ORDER_REPO, USER_REPO,
};
use loyalty_rs::routes::{self, AppState};
use loyalty_rs::services::{BalanceService, OrderService, UserService};
use loyalty_rs::uow::{factory, UnitOfWork};

/// Bounds each request to the accrual provider.
const ACCRUAL_API_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => {
            tracing::info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "service failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_for_signals(shutdown.clone()));

    tracing::info!("connecting to database...");
    let pool = db::connect_with_retry(&config.database_uri, &shutdown).await?;

    tracing::info!("running migrations...");
    db::run_migrations(&pool, &config.migrations_dir).await?;

    let mut uow = UnitOfWork::new(pool.clone());
    uow.register(USER_REPO, factory(UserRepo::new))?;
    uow.register(ORDER_REPO, factory(OrderRepo::new))?;
    uow.register(BALANCE_REPO, factory(BalanceRepo::new))?;
    let uow = Arc::new(uow);

    let jwt = JwtKeys::from_secret(config.jwt_secret.as_bytes());
    let users = Arc::new(UserService::new(&uow, jwt.clone())?);
    let orders = Arc::new(OrderService::new(uow.clone())?);
    let balances = Arc::new(BalanceService::new(uow.clone())?);

    let accrual_client = AccrualClient::new(&config.accrual_address, ACCRUAL_API_TIMEOUT)?;
    let reconciliation: Arc<dyn ReconciliationService> = orders.clone();
    let processor = AccrualProcessor::new(reconciliation, Arc::new(accrual_client));
    let processor_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { processor.run(shutdown).await }
    });

    let state = AppState {
        users,
        orders,
        balances,
        jwt,
    };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.run_address).await?;
    tracing::info!(address = %config.run_address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await?;

    // The server is down; make sure the processor follows even when the
    // serve loop ended on its own.
    shutdown.cancel();
    processor_handle.await.ok();

    Ok(())
}

async fn watch_for_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
