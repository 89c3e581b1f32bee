use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uihost_agent::{Agent, config::AgentConfig, task_tracker::TracingSink};
use uihost_types::TaskState;

fn init_tracing(config: &AgentConfig) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "uihost-agent.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env();
    let _log_guard = init_tracing(&config)?;
    tracing::info!(
        data_root = %config.data_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        "uihost-agent starting"
    );

    let agent = Agent::open(config, Arc::new(TracingSink)).await?;
    tracing::info!(
        installations = agent.instances.list_all().len(),
        processes = agent.supervisor.list().len(),
        "agent ready"
    );

    tokio::signal::ctrl_c().await?;

    // Supervised processes are left running; the next start reconciles them.
    let tasks = agent.tracker.list_all();
    let running = tasks
        .iter()
        .filter(|t| matches!(t.status, TaskState::Running | TaskState::Pending))
        .count();
    tracing::info!(tracked = tasks.len(), running, "uihost-agent shutting down");
    Ok(())
}
