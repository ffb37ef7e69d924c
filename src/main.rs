//! duet-daemon: two-speaker talking-head video generation.
//!
//! This binary can run in four roles:
//! - Generate: one video from a script and two portraits
//! - Serve: JSON-RPC job server over stdio
//! - Follower: a non-zero rank of a multi-process group
//! - Local group: `--local-ranks N` runs every rank as a thread

use anyhow::{Context, Result};
use tracing::info;

use duet_daemon::cli::{Cli, Mode};
use duet_daemon::config::RuntimeConfig;
use duet_daemon::dist::{
    create_coordinator, run_follower, spawn_local_group, InferenceCoordinator, StepEvent,
    StepPhase,
};
use duet_daemon::generation::Pipeline;
use duet_daemon::rpc::{run_server, ServerState};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    let config = cli.runtime_config().context("invalid configuration")?;
    init_logging(&config);

    match cli.mode(&config) {
        Mode::Follower => {
            info!(
                "Rank {}/{} following {}",
                config.launch.rank,
                config.launch.world_size,
                config.launch.rendezvous_addr()
            );
            run_follower(&config.coordinator, &config.launch).context("follower rank failed")?;
            Ok(())
        }
        Mode::Generate => run_generate(&cli, config),
        Mode::Serve => {
            let pipeline = build_pipeline(&cli, &config)?;
            run_server(ServerState::with_pipeline(config, pipeline))?;
            Ok(())
        }
        Mode::Usage => {
            print_usage();
            Ok(())
        }
    }
}

/// Rank 0 logs at info and followers at error unless `RUST_LOG` says
/// otherwise; debug mode raises every rank to debug.
fn init_logging(config: &RuntimeConfig) {
    let default = if config.debug {
        "debug"
    } else if config.launch.rank == 0 {
        "info"
    } else {
        "error"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_pipeline(cli: &Cli, config: &RuntimeConfig) -> Result<Pipeline> {
    let coordinator: Box<dyn InferenceCoordinator> = match cli.local_ranks {
        Some(n) if n > 1 => {
            info!("Starting {} local ranks", n);
            Box::new(spawn_local_group(&config.coordinator, n).context("local group failed")?)
        }
        _ => create_coordinator(&config.coordinator, &config.launch)
            .context("coordinator initialization failed")?,
    };
    info!(
        "Coordinator ready: {} rank(s), ulysses {} x ring {}",
        coordinator.world_size(),
        config.coordinator.parallel.ulysses_size,
        config.coordinator.parallel.ring_size
    );
    Ok(Pipeline::from_config(config, coordinator)?)
}

fn run_generate(cli: &Cli, config: RuntimeConfig) -> Result<()> {
    let input = cli.dialogue_input(&config)?;
    let mut pipeline = build_pipeline(cli, &config)?;
    pipeline.set_observer(Box::new(|event: &StepEvent| {
        if event.phase == StepPhase::Synchronized {
            info!("Step {}/{}", event.step, event.total);
        }
    }));

    let output = pipeline.run(&input).with_context(|| {
        format!("generation of {} failed", input.output_path.display())
    })?;
    info!(
        "Saved {} ({} turns, {} frames, {:.2}s)",
        output.path.display(),
        output.turns,
        output.frame_count,
        output.duration_sec
    );
    Ok(())
}

/// Prints usage information.
fn print_usage() {
    eprintln!("duet-daemon: two-speaker talking-head video generation");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  Single device:");
    eprintln!("    duet-daemon --script talk.txt --portrait1 a.png --portrait2 b.png -o out.mp4");
    eprintln!();
    eprintln!("  Four ranks in one process:");
    eprintln!("    duet-daemon --local-ranks 4 --ulysses-size 4 --script talk.txt ...");
    eprintln!();
    eprintln!("  Multi-process (one per rank, RANK/WORLD_SIZE/MASTER_ADDR/MASTER_PORT set):");
    eprintln!("    duet-daemon --ulysses-size 2 --ring-size 2 --script talk.txt ...");
    eprintln!();
    eprintln!("  Job server (JSON-RPC over stdio):");
    eprintln!("    duet-daemon --serve");
    eprintln!();
    eprintln!("Run 'duet-daemon --help' for full options.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_usage_doesnt_panic() {
        print_usage();
    }
}
