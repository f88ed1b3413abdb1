use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use slideflow::activation::ActivationState;
use slideflow::backend::models::{InstallRequest, RuntimeDescriptor};
use slideflow::config::Config;
use slideflow::events::NotificationKind;
use slideflow::orchestrator::Orchestrator;
use slideflow::workflow::WorkflowPanel;

#[derive(Parser)]
#[command(name = "slideflow", about = "Orchestration client for slide AI pipelines")]
enum Cli {
    /// List known task nodes with their live status
    Nodes,
    /// Register and start a task node
    Activate {
        node: String,
        /// Entry point; defaults to the cached descriptor's
        #[arg(long)]
        service_path: Option<String>,
        #[arg(long)]
        env_name: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        dependency_path: Option<String>,
        #[arg(long)]
        install_deps: bool,
    },
    /// Stop a running task node
    Deactivate { node: String },
    /// Download and install a node bundle, then activate it
    Install {
        #[arg(long)]
        model: String,
        #[arg(long)]
        source_uri: String,
        #[arg(long)]
        filename: String,
        #[arg(long)]
        entry_path: String,
        #[arg(long)]
        size_bytes: Option<u64>,
        #[arg(long)]
        checksum: Option<String>,
    },
    /// Run a workflow described by a panels JSON file against a dataset
    Run {
        /// Target dataset handle (h5 path)
        #[arg(long)]
        target: String,
        /// JSON file with the ordered panel list
        panels: PathBuf,
    },
    /// Stop the workflow running against a dataset
    Stop {
        #[arg(long)]
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("slideflow=info,reqwest=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let orchestrator = Orchestrator::connect(&config)?;

    let result = dispatch(cli, &orchestrator).await;
    orchestrator.shutdown().await;
    result
}

async fn dispatch(cli: Cli, orchestrator: &Orchestrator) -> Result<()> {
    match cli {
        Cli::Nodes => {
            orchestrator.activation.refresh_registry().await;
            for node in orchestrator.registry.nodes().await {
                let status = orchestrator.activation.status(&node.name).await;
                println!(
                    "{:<12} {:<28} {}",
                    node.category,
                    node.name,
                    render_status(&status)
                );
            }
            Ok(())
        }
        Cli::Activate {
            node,
            service_path,
            env_name,
            port,
            dependency_path,
            install_deps,
        } => {
            orchestrator.registry.refresh().await;
            let cached = orchestrator.registry.runtime_descriptor(&node).await;
            let descriptor = match (service_path, cached) {
                (Some(service_path), cached) => RuntimeDescriptor {
                    service_path,
                    env_name: env_name.or(cached.as_ref().and_then(|c| c.env_name.clone())),
                    port: port.or(cached.as_ref().and_then(|c| c.port)),
                    dependency_path: dependency_path
                        .or(cached.and_then(|c| c.dependency_path)),
                },
                (None, Some(cached)) => cached,
                (None, None) => bail!(
                    "no cached runtime for '{node}'; pass --service-path to activate it manually"
                ),
            };

            let mut rx = orchestrator.subscribe();
            orchestrator
                .activation
                .activate(&node, &descriptor, install_deps)
                .await?;
            println!("activating {node}...");

            loop {
                match rx.recv().await {
                    Ok(n) => {
                        if let NotificationKind::NodeStatusChanged { node: name, status } = n.kind
                        {
                            if name != node {
                                continue;
                            }
                            match status {
                                ActivationState::Running => {
                                    println!("{node} is running");
                                    return Ok(());
                                }
                                ActivationState::Failed(meta) => {
                                    bail!(
                                        "activation failed (logs: {})",
                                        meta.log_path.as_deref().unwrap_or("unavailable")
                                    );
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        bail!("notification bus closed")
                    }
                }
            }
        }
        Cli::Deactivate { node } => {
            orchestrator.registry.refresh().await;
            match orchestrator.activation.deactivate(&node).await? {
                slideflow::activation::DeactivateOutcome::Stopped => {
                    println!("{node} stopped");
                }
                slideflow::activation::DeactivateOutcome::StillReported => {
                    println!("{node} is still reported running; check the node list again later");
                }
            }
            Ok(())
        }
        Cli::Install {
            model,
            source_uri,
            filename,
            entry_path,
            size_bytes,
            checksum,
        } => {
            let install_id = orchestrator
                .install
                .install(InstallRequest {
                    model_name: model,
                    source_uri,
                    filename,
                    entry_path,
                    size_bytes,
                    checksum,
                })
                .await?;
            println!("install {install_id} started");

            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let Some(job) = orchestrator.install.snapshot().await else {
                    bail!("install was dismissed");
                };
                if let Some(percent) = job.download_percent() {
                    println!("downloading... {percent}%");
                }
                if job.is_terminal() {
                    if job.succeeded() {
                        println!("install complete, node active");
                        return Ok(());
                    }
                    bail!(
                        "install failed at step {:?}: {}",
                        job.failed_step(),
                        job.error.as_deref().unwrap_or("no details")
                    );
                }
            }
        }
        Cli::Run { target, panels } => {
            let content = std::fs::read_to_string(&panels)
                .with_context(|| format!("failed to read {}", panels.display()))?;
            let panels: Vec<WorkflowPanel> =
                serde_json::from_str(&content).context("failed to parse panel list")?;

            orchestrator.registry.refresh().await;
            let mut rx = orchestrator.subscribe();
            let run_id = orchestrator.workflow.run(panels, &target).await?;
            println!("run {run_id} started against {target}");

            loop {
                match rx.recv().await {
                    Ok(n) => match n.kind {
                        NotificationKind::WorkflowProgress { node, status, progress, .. } => {
                            println!(
                                "  {node}: {status:?}{}",
                                progress.map(|p| format!(" ({p}%)")).unwrap_or_default()
                            );
                        }
                        NotificationKind::WorkflowFinished { .. } => {
                            println!("workflow finished");
                            return Ok(());
                        }
                        _ => {}
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        bail!("notification bus closed")
                    }
                }
            }
        }
        Cli::Stop { target } => {
            let summary = orchestrator.workflow.stop(&target).await?;
            println!(
                "stopped {} process(es){}",
                summary.stopped_processes,
                if summary.rollback_performed {
                    ", rollback performed"
                } else {
                    ""
                }
            );
            for node in summary.restarted_nodes {
                println!("  restarted: {node}");
            }
            Ok(())
        }
    }
}

fn render_status(status: &ActivationState) -> String {
    match status {
        ActivationState::Unregistered => "unregistered".to_string(),
        ActivationState::Inactive => "inactive".to_string(),
        ActivationState::Activating => "activating".to_string(),
        ActivationState::Running => "running".to_string(),
        ActivationState::Failed(meta) => format!(
            "failed (logs: {})",
            meta.log_path.as_deref().unwrap_or("unavailable")
        ),
    }
}
