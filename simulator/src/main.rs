use anyhow::Context;
use clap::Parser;
use gui_bridge::bridge::{gui_bind_address, GuiBridge};
use server::{serve_tcp, ServerOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use sweepcore::pipeline::ResultPublisher;
use sweepcore::record::{Pacing, ReplayOptions};
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use workflow::config::{ConnectionConfig, WorkflowConfig};
use workflow::runner::{describe, Runner};

mod generator;
mod gui_bridge;
mod server;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Radar module-server client and detector workflow driver")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Collect and store background calibration before running
    #[arg(long, default_value_t = false)]
    calibrate: bool,
    /// Run a recorded session instead of a live one
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Replay without waiting between frames
    #[arg(long, default_value_t = false)]
    fast: bool,
    #[arg(long, default_value_t = 1.0)]
    speed: f32,
    /// Record the live session to this file
    #[arg(long)]
    record: Option<PathBuf>,
    /// Number of results a live run collects
    #[arg(long)]
    frames: Option<u64>,
    /// Act as a synthetic module server listening on this address
    #[arg(long)]
    listen: Option<String>,
    /// Publish results over HTTP on this address
    #[arg(long)]
    bridge: Option<SocketAddr>,
    /// Keep the HTTP bridge alive after the run (Ctrl+C to stop)
    #[arg(long, default_value_t = false)]
    serve: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = if let Some(path) = &args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::default()
    };
    if let Some(frames) = args.frames {
        config.frames = frames;
    }
    if args.record.is_some() {
        config.record = args.record.clone();
    }

    if let Some(address) = &args.listen {
        let options = match &config.connection {
            ConnectionConfig::Simulated(options) => options.clone(),
            _ => ServerOptions::default(),
        };
        return serve_tcp(address, options);
    }

    let bridge_address = match (&args.bridge, &config.bridge_address) {
        (Some(address), _) => Some(*address),
        (None, Some(address)) => Some(
            address
                .parse::<SocketAddr>()
                .with_context(|| format!("parsing bridge address {}", address))?,
        ),
        (None, None) if args.serve => Some(gui_bind_address()),
        (None, None) => None,
    };

    let runner = Runner::new(config);
    let manager = runner.calibration_manager()?;
    let publisher = ResultPublisher::new();
    let bridge = bridge_address
        .map(|address| GuiBridge::spawn(address, publisher.clone()))
        .transpose()?;

    if args.calibrate {
        let artifacts = runner.calibrate(&manager).context("calibrating")?;
        for artifact in &artifacts {
            println!(
                "Calibrated sensor {} from {} frames (fingerprint {})",
                artifact.sensor_id,
                artifact.frames_used,
                &artifact.fingerprint[..12.min(artifact.fingerprint.len())]
            );
        }
    }

    let report = if let Some(path) = &args.replay {
        let options = ReplayOptions {
            pacing: if args.fast {
                Pacing::AsFastAsPossible
            } else {
                Pacing::RealTime
            },
            speed: args.speed,
        };
        runner
            .replay(path, options, &manager, Some(publisher.clone()))
            .context("replaying session")?
    } else {
        runner
            .run_live(&manager, Some(publisher.clone()))
            .context("running live session")?
    };

    println!(
        "Run -> results {}, resets {}, skipped {}",
        report.summary.results, report.summary.resets, report.summary.skipped
    );
    if let Some(result) = &report.last_result {
        println!("Last -> {}", describe(result));
    }
    if let Some(record) = &report.record {
        println!(
            "Recorded {} frames ({} gaps) to {}",
            record.frames,
            record.dropped_events,
            record.path.display()
        );
    }
    if let Some(metrics) = &report.metrics {
        println!(
            "Session -> frames {}, dropped {}, resyncs {}, errors {}, saturated {}, delayed {}",
            metrics.frames,
            metrics.dropped_frames,
            metrics.resyncs,
            metrics.errors,
            metrics.saturated_frames,
            metrics.delayed_frames
        );
    }

    if let (true, Some(bridge)) = (args.serve, &bridge) {
        println!(
            "HTTP bridge on http://{} (Ctrl+C to stop)...",
            bridge.address()
        );
        let runtime = TokioBuilder::new_current_thread()
            .enable_all()
            .build()
            .context("creating runtime for signal handling")?;
        runtime.block_on(async {
            signal::ctrl_c().await.context("awaiting Ctrl+C to exit")?;
            Ok::<(), anyhow::Error>(())
        })?;
    }

    Ok(())
}
