pub mod backbone;
pub mod config;
pub mod data;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod laplacian;
pub mod metrics;
pub mod model;
pub mod npz;
pub mod summary;
pub mod train;
