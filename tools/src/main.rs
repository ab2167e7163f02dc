use clap::Parser;
use rayon::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use traffic_gnn::graph::error::{CheckpointError, TrainResult};
use traffic_gnn::graph::laplacian::{read_vertex_count, AdjacencyMatrix, ChebyshevPolynomials};

/// Precomputes Chebyshev kernels for an adjacency file, one cache per order.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Adjacency as a `.csv` edge list, scipy `.npz` or dense `.npy`.
    #[arg(long)]
    adjacency: PathBuf,

    /// Vertex count; required for edge lists unless `--node-pos` is given.
    #[arg(long)]
    vertices: Option<usize>,

    /// Node position `.npy` whose first axis gives the vertex count.
    #[arg(long)]
    node_pos: Option<PathBuf>,

    /// Chebyshev orders to compute.
    #[arg(long = "k", required = true, num_args = 1..)]
    orders: Vec<usize>,

    /// Output directory; caches are written as `cheb_k{K}.bin`.
    #[arg(long, default_value = "./data")]
    out_dir: PathBuf,
}

fn precompute(args: &Args) -> TrainResult<Vec<PathBuf>> {
    let vertices = match (&args.vertices, &args.node_pos) {
        (Some(n), _) => Some(*n),
        (None, Some(path)) => Some(read_vertex_count(path)?),
        (None, None) => None,
    };
    let adjacency = AdjacencyMatrix::load(&args.adjacency, vertices)?;
    info!(vertices = adjacency.num_vertices(), orders = ?args.orders, "adjacency loaded");

    let kernels = args
        .orders
        .par_iter()
        .map(|&k| ChebyshevPolynomials::from_adjacency(&adjacency, k).map(|p| (k, p)))
        .collect::<TrainResult<Vec<_>>>()?;

    std::fs::create_dir_all(&args.out_dir).map_err(|source| CheckpointError::Io {
        path: args.out_dir.clone(),
        source,
    })?;
    let mut written = Vec::with_capacity(kernels.len());
    for (k, polynomials) in kernels {
        let path = args.out_dir.join(format!("cheb_k{k}.bin"));
        std::fs::remove_file(&path).ok();
        polynomials.save(&path)?;
        info!(k, path = %path.display(), "kernels cached");
        written.push(path);
    }
    Ok(written)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match precompute(&args) {
        Ok(paths) => {
            info!(files = paths.len(), "done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "kernel precompute failed");
            ExitCode::FAILURE
        }
    }
}
