//! Low-level poke tool for the driver's checkpoint entry points.

use clap::{Parser, Subcommand};
use kybernate::cuda::{CheckpointTool, Checkpointer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cuda-ckpt")]
#[command(about = "CUDA checkpoint tool using the driver API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available GPUs
    ListGpus,

    /// Get the checkpoint state of a process
    State {
        #[arg(short, long)]
        pid: u32,
    },

    /// Lock a process, blocking further CUDA calls
    Lock {
        #[arg(short, long)]
        pid: u32,

        /// Lock timeout in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u32,
    },

    /// Checkpoint VRAM to host memory (process must be locked)
    Checkpoint {
        #[arg(short, long)]
        pid: u32,
    },

    /// Restore host memory to VRAM (process must be checkpointed)
    Restore {
        #[arg(short, long)]
        pid: u32,
    },

    /// Unlock a process, allowing CUDA calls again
    Unlock {
        #[arg(short, long)]
        pid: u32,
    },

    /// Lock + checkpoint in one step
    FullCheckpoint {
        #[arg(short, long)]
        pid: u32,

        /// Lock timeout in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u32,
    },

    /// Restore + unlock in one step, optionally remapping devices
    FullRestore {
        #[arg(short, long)]
        pid: u32,

        /// Device index the checkpoint was taken on
        #[arg(long)]
        source_gpu: Option<usize>,

        /// Device index to restore onto
        #[arg(long)]
        target_gpu: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let machine = Checkpointer::new(Arc::new(CheckpointTool::probe()?));

    match cli.command {
        Commands::ListGpus => {
            let devices = machine.devices()?;
            println!("Found {} GPU(s):", devices.len());
            for device in devices {
                println!("  GPU {}: {}", device.index, device.uuid);
            }
        }

        Commands::State { pid } => {
            println!("{}", machine.state(pid)?);
        }

        Commands::Lock { pid, timeout } => {
            machine.lock(pid, timeout)?;
            println!("Process locked");
        }

        Commands::Checkpoint { pid } => {
            machine.checkpoint(pid)?;
            println!("VRAM checkpointed to RAM");
        }

        Commands::Restore { pid } => {
            machine.restore(pid)?;
            println!("VRAM restored from RAM");
        }

        Commands::Unlock { pid } => {
            machine.unlock(pid)?;
            println!("Process unlocked");
        }

        Commands::FullCheckpoint { pid, timeout } => {
            println!("Performing full checkpoint (lock + VRAM->RAM) for PID {pid}...");
            machine.full_checkpoint(pid, timeout)?;
            println!("Full checkpoint complete - VRAM is now in host RAM");
        }

        Commands::FullRestore {
            pid,
            source_gpu,
            target_gpu,
        } => {
            let plan = match (source_gpu, target_gpu) {
                (Some(source), Some(target)) => Some(machine.migration_plan(source, target)?),
                (None, None) => None,
                _ => anyhow::bail!("--source-gpu and --target-gpu must be given together"),
            };
            println!("Performing full restore (RAM->VRAM + unlock) for PID {pid}...");
            machine.full_restore(pid, plan.as_ref())?;
            println!("Full restore complete - process is running");
        }
    }

    Ok(())
}
