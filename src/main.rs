//! courier CLI
//!
//! `serve` accepts uploads, `work` processes them, `run` does both in one
//! process.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use courier::config::{Cli, Command, Settings};
use courier::{
    Daemon, InMemoryJobQueue, IntakeServer, JobProducer, JobQueue, ReqwestHttpClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courier=info")))
        .init();

    let cli = Cli::parse();
    let settings = cli.settings;
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Command::Serve => {
            let queue = durable_queue(&settings).await?;
            serve(queue, &settings, shutdown).await
        }
        Command::Work => {
            let queue = durable_queue(&settings).await?;
            work(queue, &settings, shutdown).await
        }
        Command::Run => {
            if settings.database_url.is_some() {
                let queue = durable_queue(&settings).await?;
                run_both(queue, &settings, shutdown).await
            } else {
                tracing::warn!("DATABASE_URL not set, using an in-process queue");
                run_both(Arc::new(InMemoryJobQueue::new()), &settings, shutdown).await
            }
        }
    }
}

fn load_dotenv() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e).context("Failed to load .env"),
    }
}

#[cfg(feature = "postgres")]
async fn durable_queue(settings: &Settings) -> Result<Arc<courier::PostgresJobQueue>> {
    let url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for this command")?;
    let queue = courier::PostgresJobQueue::connect(url).await?;
    queue.migrate().await?;
    tracing::info!("Connected to queue database");
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "postgres"))]
async fn durable_queue(_settings: &Settings) -> Result<Arc<InMemoryJobQueue>> {
    anyhow::bail!("This build has no durable queue; rebuild with the `postgres` feature or use `run`")
}

async fn serve<Q: JobQueue + 'static>(
    queue: Arc<Q>,
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<()> {
    let producer = Arc::new(JobProducer::new(
        queue,
        settings.resolver()?,
        settings.producer_config(),
    ));
    IntakeServer::new(settings.server_config(), producer)
        .start(shutdown)
        .await?;
    Ok(())
}

async fn work<Q: JobQueue + 'static>(
    queue: Arc<Q>,
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<()> {
    let daemon = Arc::new(Daemon::new(
        queue,
        ReqwestHttpClient::new(),
        settings.resolver()?,
        settings.daemon_config(),
        shutdown.clone(),
    ));
    let mut task = tokio::spawn(daemon.run());

    tokio::select! {
        result = &mut task => {
            result??;
            return Ok(());
        }
        _ = shutdown.cancelled() => {}
    }

    // The daemon stops claiming on cancel; wait for the job it is running.
    match settings.shutdown_timeout() {
        None => {
            task.await??;
        }
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(result) => {
                result??;
            }
            Err(_) => tracing::warn!(
                timeout_secs = limit.as_secs(),
                "In-flight job did not finish before the shutdown timeout"
            ),
        },
    }
    Ok(())
}

async fn run_both<Q: JobQueue + 'static>(
    queue: Arc<Q>,
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<()> {
    tokio::try_join!(
        serve(queue.clone(), settings, shutdown.clone()),
        work(queue, settings, shutdown),
    )?;
    Ok(())
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutting down");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
