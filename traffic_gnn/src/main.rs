use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use traffic_gnn::graph::config::{parse_device_ordinals, resolve_devices, ExperimentConfig, DEVICES_ENV};
use traffic_gnn::graph::error::TrainResult;
use traffic_gnn::graph::train::{run, RunSummary};

type MyBackend = Wgpu<f32, i32>;
type MyAutodiffBackend = Autodiff<MyBackend>;

/// Trains an MSTGCN or ASTGCN traffic forecaster.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON experiment configuration.
    #[arg(long)]
    config: PathBuf,

    /// Clear the params directory if it already exists.
    #[arg(long)]
    force: bool,
}

fn start(args: &Args) -> TrainResult<RunSummary> {
    let config = ExperimentConfig::load_validated(&args.config)?;
    let ordinals = parse_device_ordinals(std::env::var(DEVICES_ENV).ok().as_deref())?;
    let devices = resolve_devices(&ordinals, WgpuDevice::DiscreteGpu, WgpuDevice::default());
    info!(devices = ?devices, config = %args.config.display(), "starting");

    run::<MyAutodiffBackend>(&config, devices, args.force)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match start(&args) {
        Ok(summary) => {
            info!(
                params_dir = %summary.params_dir.display(),
                checkpoints = summary.checkpoints.len(),
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "training aborted");
            ExitCode::FAILURE
        }
    }
}
