/// Orchestration worker entry point: the process that actually drains
/// `orchestration`/`orchestration.retry` and runs the VM Provisioner and
/// Campaign Engine pipelines. Grounded on
/// `original_source/ats/kyaraben/worker/main.py`.
mod handler;

use clap::Parser;
use orchestration_core::broker::AmqpTaskBroker;
use orchestration_core::config::{OrchestrationConfig, RetryConfig};
use orchestration_core::dispatcher::Dispatcher;
use orchestration_core::drivers::amqp_admin::HttpAmqpAdmin;
use orchestration_core::drivers::container::ComposeContainerRunner;
use orchestration_core::drivers::heat::HttpHeatClient;
use orchestration_core::drivers::openstack::OpenstackGateway;
use orchestration_core::lock::LockGuard;
use orchestration_core::retry::{RetryCollector, RetryDecision};
use sqlx::sqlite::SqlitePoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use handler::CombinedHandler;

#[derive(Parser, Debug)]
#[command(name = "orchestration-worker", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the process singleton lock socket
    #[arg(long, value_name = "PATH", default_value = "/tmp/orchestration-worker.lock")]
    lock_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .init();

    info!("starting orchestration worker");

    let config = OrchestrationConfig::load_or_default(args.config.as_deref().and_then(|p| p.to_str()))?;
    config.validate()?;

    let _lock = LockGuard::acquire("orchestration-worker", &args.lock_path)?;

    let pool = SqlitePoolOptions::new().connect(&config.db.dsn).await?;
    orchestration_core::migrations::check_current(&pool).await?;

    let gateway = Arc::new(OpenstackGateway::new(&config.openstack)?);
    gateway.authenticate().await?;

    let heat = HttpHeatClient::new(gateway);
    let amqp_admin = HttpAmqpAdmin::new(&config.amqp);
    let container = ComposeContainerRunner {
        docker_host: config.worker.docker_host.clone(),
        compose_file: config.worker.compose_file.clone(),
    };

    let amqp_url = format!(
        "amqp://{}:{}@{}/%2f",
        config.amqp.admin_username, config.amqp.admin_password, config.amqp.hostname
    );
    let broker = AmqpTaskBroker::connect(&amqp_url).await?;

    let provisioner = orchestration_core::provisioner::VmProvisioner::new(
        amqp_admin.clone(),
        heat.clone(),
        container.clone(),
        broker.clone(),
        config.amqp.clone(),
        config.openstack.clone(),
        config.orchestration.clone(),
    );
    let campaign = orchestration_core::campaign_engine::CampaignEngine::new(
        broker.clone(),
        container.clone(),
        amqp_admin,
        heat,
        config.amqp.clone(),
        config.openstack.clone(),
        config.orchestration.clone(),
        config.quota.clone(),
    );
    let command = orchestration_core::command_engine::CommandEngine::new(container);
    let combined: Arc<dyn orchestration_core::dispatcher::TaskHandler> =
        Arc::new(CombinedHandler::new(provisioner, campaign, command));
    let dispatcher =
        Arc::new(Dispatcher::new(pool, broker.clone(), combined, config.worker.heat_poll_interval));

    let dispatch_rx = broker.consume().await?;
    let dispatch_handle = tokio::spawn(run_dispatch_loop(dispatcher, dispatch_rx));

    let retry_rx = broker.consume_retry().await?;
    let retry_handle = tokio::spawn(run_retry_loop(broker, config.retry.clone(), retry_rx));

    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
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
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
        res = dispatch_handle => {
            if let Err(e) = res {
                error!(error = %e, "dispatch loop panicked");
            }
        }
        res = retry_handle => {
            if let Err(e) = res {
                error!(error = %e, "retry loop panicked");
            }
        }
    }

    info!("orchestration worker stopped");
    Ok(())
}

/// Drains `orchestration` and runs every delivery through the dispatcher,
/// one at a time per the prefetch-1 QoS set at connect time.
async fn run_dispatch_loop(
    dispatcher: Arc<Dispatcher<AmqpTaskBroker>>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<orchestration_core::broker::Delivery>,
) {
    while let Some(delivery) = rx.recv().await {
        if let Err(e) = dispatcher.dispatch(delivery).await {
            error!(error = %e, "dispatch failed");
        }
    }
}

/// Drains `orchestration.retry`: reinjects into `orchestration` after the
/// computed backoff, or nacks past-deadline messages into
/// `orchestration.failed` via the queue's own dead-letter binding
/// (SPEC_FULL.md §2, Retry Collector).
async fn run_retry_loop(
    broker: AmqpTaskBroker,
    retry_config: RetryConfig,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<orchestration_core::broker::Delivery>,
) {
    use orchestration_core::broker::TaskBroker;

    let collector = RetryCollector::new(retry_config);
    while let Some(delivery) = rx.recv().await {
        let age_secs = (chrono::Utc::now().timestamp() - delivery.timestamp).max(0) as u64;
        let decision = collector.decide(age_secs, delivery.retries);
        match &decision {
            RetryDecision::Reinject { .. } => {
                if let Err(e) = collector.publish_retry(&broker, &delivery, &decision).await {
                    error!(error = %e, "failed to reinject retried task");
                    continue;
                }
                if let Err(e) = broker.ack(delivery.ack_token).await {
                    error!(error = %e, "failed to ack reinjected task");
                }
            }
            RetryDecision::Discard => {
                if let Err(e) = broker.nack_to_dead_letter(delivery.ack_token).await {
                    error!(error = %e, "failed to dead-letter expired retry");
                }
            }
        }
    }
}
