use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tally::adapters::{HttpPriceOracle, HttpSettlementGateway, PostgresStore};
use tally::cli::{Cli, Commands};
use tally::clock::{Clock, SystemClock};
use tally::config::AppConfig;
use tally::domain::CalendarPolicy;
use tally::engine::{ExecutionEngine, FeeSchedule, OrderStateMachine};
use tally::error::Result;
use tally::ledger::LedgerStore;
use tally::notify::{LogNotifier, NotificationSink, WebhookNotifier};
use tally::oracle::OracleGateway;
use tally::schedulers::{CopyTradePropagator, RecurringBuyScheduler};
use tally::services::{EvaluatorConfig, HealthServer, HealthState, Metrics, OrderEvaluator};
use tally::transfers::FundTransferService;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;
    init_logging(&config);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Config error: {}", e);
        }
        std::process::exit(1);
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::CheckConfig => {
            info!("Configuration OK");
            Ok(())
        }
        Commands::Migrate => {
            let store =
                PostgresStore::new(&config.database.url, config.database.max_connections).await?;
            store.migrate().await?;
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new());

    let store = Arc::new(
        PostgresStore::new(&config.database.url, config.database.max_connections).await?,
    );
    store.migrate().await?;

    let notifier: Arc<dyn NotificationSink> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let oracle = Arc::new(OracleGateway::new(
        Arc::new(HttpPriceOracle::new(config.oracle.url.clone())),
        Duration::from_millis(config.oracle.timeout_ms),
    ));

    let ledger = Arc::new(LedgerStore::new(clock.clone(), Some(store.clone())));
    for (account, positions) in store.load_accounts().await? {
        ledger.register_account(account, positions);
    }
    info!(accounts = ledger.account_ids().len(), "Ledger restored");

    let orders = Arc::new(OrderStateMachine::new(
        ledger.clone(),
        oracle.clone(),
        clock.clone(),
        Some(store.clone()),
        notifier.clone(),
        metrics.clone(),
    ));

    let engine = Arc::new(ExecutionEngine::new(
        orders.clone(),
        ledger.clone(),
        oracle.clone(),
        FeeSchedule::from_config(&config.fees),
        clock.clone(),
        Some(store.clone()),
        notifier.clone(),
        metrics.clone(),
    ));

    let transfers = Arc::new(FundTransferService::new(
        ledger.clone(),
        Arc::new(HttpSettlementGateway::new(
            config.transfers.settlement_url.clone(),
        )),
        clock.clone(),
        Some(store.clone()),
        notifier.clone(),
        metrics.clone(),
        chrono::Duration::hours(config.transfers.time_lock_hours),
        Duration::from_millis(config.transfers.settlement_timeout_ms),
    ));
    for destination in store.load_destinations().await? {
        transfers.register_destination(destination);
    }

    for algo in store.load_working_algo_orders().await? {
        // Surfaced for operator attention rather than silently restarted
        // mid-schedule with an unknown amount already placed
        warn!(algo_id = %algo.id, "Algo order was working at shutdown, needs restart");
    }

    let propagator = Arc::new(CopyTradePropagator::new(
        orders.clone(),
        engine.clone(),
        metrics.clone(),
    ));
    for subscription in store.load_subscriptions().await? {
        if let Err(e) = propagator.register_subscription(subscription) {
            warn!("Skipping bad subscription: {}", e);
        }
    }
    tokio::spawn(propagator.clone().run());

    let recurring = Arc::new(RecurringBuyScheduler::new(
        orders.clone(),
        engine.clone(),
        oracle.clone(),
        clock.clone(),
        Some(store.clone()),
        metrics.clone(),
        CalendarPolicy::ClampToMonthEnd,
    ));
    for schedule in store.load_schedules().await? {
        if let Err(e) = recurring.register_schedule(schedule) {
            warn!("Skipping bad schedule: {}", e);
        }
    }
    tokio::spawn(recurring.clone().run(Duration::from_secs(
        config.scheduler.recurring_interval_secs,
    )));

    let evaluator = Arc::new(OrderEvaluator::new(
        orders.clone(),
        engine.clone(),
        clock.clone(),
        EvaluatorConfig {
            interval_ms: config.execution.evaluator_interval_ms,
            idempotency_window_secs: config.execution.idempotency_window_secs,
        },
    ));
    evaluator.clone().start();

    let health_state = Arc::new(HealthState::new(metrics.clone()));
    health_state.set_db_connected(true);
    if let Some(port) = config.health_port {
        let state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = HealthServer::serve(state, port).await {
                error!("Health server failed: {}", e);
            }
        });
    }

    info!("Engine running; ctrl-c to stop");
    signal::ctrl_c().await?;

    info!("Shutting down");
    evaluator.stop();
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match &config.logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "tally.log");
            if config.logging.json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(appender)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(appender)
                    .with_ansi(false)
                    .init();
            }
        }
        None => {
            if config.logging.json {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
    }
}
