use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use kybernate::controller::{
    CheckpointController, CheckpointRequest, ControllerConfig, RestoreOutcome, RestoreRequest,
};
use kybernate::cuda::{CheckpointTool, CudaDriver};
use kybernate::locator::GpuLocator;
use kybernate::utils;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kybernate-ctl")]
#[command(about = "GPU container checkpoint manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a GPU-aware checkpoint of a container
    Checkpoint {
        /// Namespace
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,

        /// Pod name
        #[arg(short = 'p', long)]
        pod: String,

        /// Container name
        #[arg(short = 'c', long)]
        container: String,

        /// Output directory for checkpoint artifacts
        #[arg(short = 'o', long, default_value = "/var/lib/kybernate/checkpoints")]
        output: PathBuf,
    },

    /// Restore a container from a checkpoint
    Restore {
        /// Namespace
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,

        /// Pod name
        #[arg(short = 'p', long)]
        pod: String,

        /// Container name
        #[arg(short = 'c', long)]
        container: String,

        /// Checkpoint path to restore from
        #[arg(long)]
        from: PathBuf,

        /// Image for the restore pod (must match the original)
        #[arg(long)]
        image: Option<String>,
    },

    /// List available checkpoints
    List {
        /// Filter by namespace
        #[arg(short = 'n', long)]
        namespace: Option<String>,
    },

    /// Show checkpoint status of a container
    Status {
        /// Namespace
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,

        /// Pod name
        #[arg(short = 'p', long)]
        pod: String,

        /// Container name
        #[arg(short = 'c', long)]
        container: String,
    },
}

fn build_controller(output: Option<PathBuf>) -> CheckpointController {
    let driver: Arc<dyn CudaDriver> = match CheckpointTool::probe() {
        Ok(tool) => Arc::new(tool),
        Err(e) => {
            warn!("CUDA checkpoint tooling unavailable: {e}");
            Arc::new(CheckpointTool::new())
        }
    };

    let mut config = ControllerConfig::default();
    if let Some(dir) = output {
        config.checkpoint_dir = dir;
    }

    CheckpointController::new(driver, GpuLocator::new(), config)
}

fn stage_spinner(message: &'static str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .expect("static template"),
    );
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Checkpoint {
            namespace,
            pod,
            container,
            output,
        } => {
            let controller = build_controller(Some(output));
            println!("Creating checkpoint for {namespace}/{pod}/{container}");

            let spinner = stage_spinner("two-stage checkpoint (VRAM -> RAM -> disk)...");
            let outcome = controller
                .checkpoint(&CheckpointRequest {
                    namespace,
                    pod,
                    container,
                })
                .await;
            spinner.finish_and_clear();

            let outcome = outcome?;
            if outcome.gpu_checkpointed {
                println!("GPU stage: VRAM transferred to host memory");
            } else {
                println!("GPU stage: skipped (no running GPU process)");
            }
            println!(
                "Checkpoint complete in {}: {}",
                utils::format_duration(outcome.duration_ms),
                outcome.manifest.artifact_path.display()
            );
        }

        Commands::Restore {
            namespace,
            pod,
            container,
            from,
            image,
        } => {
            let controller = build_controller(None);
            println!("Restoring from checkpoint: {}", from.display());

            let outcome = controller
                .restore(&RestoreRequest {
                    namespace,
                    pod,
                    container,
                    from,
                    image,
                })
                .await?;

            match outcome {
                RestoreOutcome::Restored {
                    container_id,
                    gpu_pid,
                } => {
                    println!("Container restored: {container_id}");
                    match gpu_pid {
                        Some(pid) => println!("GPU state restored for PID {pid}"),
                        None => println!("No GPU process found; CPU-only restore"),
                    }
                }
                RestoreOutcome::PodTemplate(yaml) => {
                    println!("Target container is not running yet.");
                    println!("Apply this pod to let the runtime shim finish the restore:\n");
                    println!("{yaml}");
                }
            }
        }

        Commands::List { namespace } => {
            let controller = build_controller(None);
            let manifests = controller.list(namespace.as_deref())?;
            if manifests.is_empty() {
                println!("No checkpoints found");
            }
            for manifest in manifests {
                println!(
                    "{:<48} {}/{}/{} (gpu pid: {})",
                    manifest.artifact_path.display(),
                    manifest.namespace,
                    manifest.pod,
                    manifest.container,
                    manifest
                        .gpu_pid
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                );
            }
        }

        Commands::Status {
            namespace,
            pod,
            container,
        } => {
            let controller = build_controller(None);
            let report = controller.status(&namespace, &pod, &container)?;

            println!("Container: {namespace}/{pod}/{container}");
            println!("Container ID: {}", report.container_id);
            match report.gpu_pid {
                Some(pid) => {
                    println!("GPU process PID: {pid}");
                    if let Some(state) = report.state {
                        println!("CUDA state: {state}");
                    }
                    if let Some(memory) = report.gpu_memory {
                        println!("GPU memory: {}", utils::format_memory(memory));
                    }
                }
                None => println!("GPU process: none (CPU-only container)"),
            }
        }
    }

    Ok(())
}
