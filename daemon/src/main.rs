/// Orchestration daemon entry point: config, logging, the process
/// singleton lock, and the status HTTP server, torn down on SIGTERM/^C.
use clap::Parser;
use orchestration_core::config::OrchestrationConfig;
use orchestration_core::lock::LockGuard;
use orchestration_daemon::StatusServer;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orchestration-daemon", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the process singleton lock socket
    #[arg(long, value_name = "PATH", default_value = "/tmp/orchestration-daemon.lock")]
    lock_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .init();

    info!("starting orchestration daemon v{}", orchestration_daemon::VERSION);

    let config = OrchestrationConfig::load_or_default(args.config.as_deref().and_then(|p| p.to_str()))?;
    config.validate()?;

    let _lock = LockGuard::acquire("orchestration-daemon", &args.lock_path)?;

    let pool = SqlitePoolOptions::new().connect(&config.db.dsn).await?;
    orchestration_core::migrations::check_current(&pool).await?;

    let server = StatusServer::new(config, pool);
    let server_handle = tokio::spawn(server.run());

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
        res = server_handle => {
            if let Ok(Err(e)) = res {
                tracing::error!(error = %e, "status server exited");
            }
        }
    }

    info!("orchestration daemon stopped");
    Ok(())
}
