mod cli;
mod shutdown;

use std::time::Duration;

use clap::Parser;
use tracing::info;

use renderq_core::config::{load_config, OrchestratorConfig};
use renderq_engine::{TaskKind, TaskState};

use crate::cli::{Cli, Command, SubmitArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Submit(args) => submit(config, args).await,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

async fn serve(config: OrchestratorConfig) -> anyhow::Result<()> {
    let orchestrator = renderq_engine::start(config)?;
    info!(version = env!("CARGO_PKG_VERSION"), "renderq serving");

    shutdown::wait_for_interrupt(&orchestrator).await;
    orchestrator.shutdown().await;
    Ok(())
}

async fn submit(config: OrchestratorConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let kind: TaskKind = args.kind.parse()?;
    let orchestrator = renderq_engine::start(config)?;

    let receipt = orchestrator.enqueue(kind, args.to_params())?;
    println!(
        "task {} queued at position {} (estimated wait {:.0}s)",
        receipt.task_id, receipt.queue_position, receipt.estimated_wait_secs
    );

    let finished = loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Some(task) = orchestrator.task_status(&receipt.task_id) else {
            orchestrator.shutdown().await;
            anyhow::bail!("task {} disappeared from history", receipt.task_id);
        };
        match task.status {
            TaskState::Completed | TaskState::Failed => break task,
            TaskState::Queued | TaskState::Running => {}
        }
    };
    orchestrator.shutdown().await;

    match finished.status {
        TaskState::Completed => {
            println!(
                "completed: {}",
                finished.output_filename.unwrap_or_default()
            );
            Ok(())
        }
        _ => anyhow::bail!("task failed: {}", finished.status_message),
    }
}
