//! Courier CLI entry point.
//!
//! Provides `start` to run the relay service and `check` to validate the
//! configuration and the backend roster without connecting any account.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use courier::accounts::{merge_accounts, AccountManager, RosterSource};
use courier::admin::{self, AdminState};
use courier::backend::BackendClient;
use courier::config::Config;
use courier::pipeline::media::{AssetStore, MediaDeduplicator};
use courier::pipeline::photo_cache::PhotoCache;
use courier::pipeline::queue::{Deliver, DeliveryQueue};
use courier::pipeline::retry::RetryExecutor;
use courier::pipeline::EventPipeline;
use courier::protocol::bot_api::BotApiFactory;
use courier::registry::Registry;
use courier::supervisor::Supervisor;

/// Courier relays Telegram bot traffic to an ingestion backend.
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the relay service.
    Start,
    /// Validate configuration, fetch the roster and exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Check => handle_check().await,
    }
}

/// Run the relay until SIGINT or SIGTERM.
async fn handle_start() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _logging_guard = courier::logging::init_production(&config.logging.dir)?;
    let admin_addr = config.admin_addr()?;

    let registry = Arc::new(Registry::new());
    let backend = Arc::new(BackendClient::new(
        config.backend_config(),
        Arc::clone(&registry),
    ));
    let retry = RetryExecutor::new(config.retry_policy());
    let queue = Arc::new(DeliveryQueue::new(config.queue_config()));

    let media = config.media.enabled.then(|| {
        MediaDeduplicator::new(
            Arc::clone(&backend) as Arc<dyn AssetStore>,
            retry.clone(),
            config.media.max_bytes,
        )
    });
    let photos = config
        .photos
        .enabled
        .then(|| PhotoCache::new(Duration::from_secs(config.photos.ttl_secs)));
    let pipeline = Arc::new(EventPipeline::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        media,
        photos,
    ));

    let factory = Arc::new(BotApiFactory::new(config.bot_api_config()));
    let manager = Arc::new(
        AccountManager::new(
            Arc::clone(&registry),
            factory,
            pipeline,
            Duration::from_millis(config.supervisor.connect_spacing_ms),
        )
        .with_roster(Arc::clone(&backend) as Arc<dyn RosterSource>)
        .with_env_accounts(config.env_accounts()),
    );

    info!(
        backend = %config.backend.base_url,
        admin = %admin_addr,
        "courier starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = tokio::spawn(Arc::clone(&queue).run(
        Arc::clone(&backend) as Arc<dyn Deliver>,
        retry,
        shutdown_rx.clone(),
    ));

    let loaded = manager.load_accounts().await;
    if loaded == 0 {
        warn!("no accounts configured, waiting for a reload");
    }
    manager.connect_all().await;

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&manager),
        Duration::from_secs(config.supervisor.probe_interval_secs),
    ))
    .spawn();

    let state = AdminState::new(Arc::clone(&manager), Arc::clone(&queue), &config.admin.secret);
    let mut admin_task = tokio::spawn(admin::serve(admin_addr, state, shutdown_rx));

    tokio::select! {
        () = wait_for_signal() => {
            info!("received shutdown signal, initiating graceful shutdown");
        }
        result = &mut admin_task => {
            match result {
                Ok(Ok(())) => warn!("admin server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "admin server failed"),
                Err(e) => error!(error = %e, "admin server task panicked"),
            }
        }
    }

    supervisor.stop().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatcher.await {
        warn!(error = %e, "dispatcher task ended abnormally");
    }
    manager.shutdown_all().await;
    if !admin_task.is_finished() {
        if let Ok(Err(e)) = admin_task.await {
            warn!(error = %e, "admin server stopped with error");
        }
    }

    let stats = queue.stats();
    info!(
        processed = stats.processed,
        failed = stats.failed,
        retried = stats.retried,
        dropped = stats.dropped,
        "courier shut down cleanly"
    );
    Ok(())
}

/// Validate configuration and report the accounts a start would connect.
async fn handle_check() -> anyhow::Result<()> {
    courier::logging::init_cli();

    let config = Config::load().context("failed to load configuration")?;
    config.admin_addr()?;

    let registry = Arc::new(Registry::new());
    let backend = BackendClient::new(config.backend_config(), registry);
    let roster = backend
        .fetch_roster()
        .await
        .with_context(|| format!("failed to fetch roster from {}", config.backend.base_url))?;

    let env_accounts = config.env_accounts();
    let roster_count = roster.len();
    let merged = merge_accounts(&env_accounts, roster);

    println!("configuration ok");
    println!("  backend:  {}", config.backend.base_url);
    println!("  admin:    {}", config.admin.bind);
    println!(
        "  accounts: {} ({} from roster, {} from environment)",
        merged.len(),
        roster_count,
        env_accounts.len()
    );
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
