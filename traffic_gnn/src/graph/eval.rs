use crate::graph::data::TrafficBatch;
use crate::graph::error::{DataError, DeviceError, TrainResult};
use crate::graph::metrics::{evaluate_horizons, HorizonMetrics};
use crate::graph::model::{ChebyshevBasis, Stgcn};
use burn::data::dataloader::DataLoader;
use burn::prelude::*;
use burn::tensor::ElementConversion;
use ndarray::{Array3, Axis};
use tracing::debug;

/// Affine map from model units back to target units: `x * std + mean`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PredictionScale {
    pub mean: f32,
    pub std: f32,
}

impl Default for PredictionScale {
    fn default() -> Self {
        Self { mean: 0.0, std: 1.0 }
    }
}

impl PredictionScale {
    pub fn is_identity(&self) -> bool {
        self.mean == 0.0 && self.std == 1.0
    }

    pub fn apply(&self, prediction: Array3<f32>) -> Array3<f32> {
        if self.is_identity() {
            return prediction;
        }
        prediction.mapv_into(|x| x * self.std + self.mean)
    }
}

/// Runs `model` on one shard and checks the output against the shard target.
pub(crate) fn forward_shard<B: Backend>(
    model: &Stgcn<B>,
    shard: &TrafficBatch<B>,
    basis: &ChebyshevBasis<B>,
    index: usize,
) -> Result<Tensor<B, 3>, DeviceError> {
    let output = model.forward(shard.week.clone(), shard.day.clone(), shard.recent.clone(), basis);
    let expected = shard.target.dims();
    if output.dims() != expected {
        return Err(DeviceError::OutputShape {
            shard: index,
            expected: expected.to_vec(),
            actual: output.dims().to_vec(),
        });
    }
    Ok(output)
}

pub(crate) fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

/// Model copies, one per device.
pub(crate) fn replicate<B: Backend>(model: &Stgcn<B>, devices: &[B::Device]) -> Vec<Stgcn<B>> {
    devices.iter().map(|device| model.clone().fork(device)).collect()
}

/// Mean over shards of `0.5 * MSE`.
pub fn compute_val_loss<B: Backend>(
    model: &Stgcn<B>,
    loader: &dyn DataLoader<TrafficBatch<B>>,
    bases: &[ChebyshevBasis<B>],
    devices: &[B::Device],
) -> TrainResult<f32> {
    let replicas = replicate(model, devices);
    let mut losses = Vec::new();

    for batch in loader.iter() {
        for (index, shard) in batch.shard(devices)?.iter().enumerate() {
            let output = forward_shard(&replicas[index], shard, &bases[index], index)?;
            let loss = (output - shard.target.clone()).powf_scalar(2.0).mean().mul_scalar(0.5);
            losses.push(scalar(loss));
        }
    }

    if losses.is_empty() {
        return Err(DataError::EmptySplit("val").into());
    }
    let loss = losses.iter().sum::<f32>() / losses.len() as f32;
    debug!(shards = losses.len(), loss, "validation pass");
    Ok(loss)
}

/// All predictions of `loader`, in loader order, as `[sample, vertex, horizon]`.
pub fn predict<B: Backend>(
    model: &Stgcn<B>,
    loader: &dyn DataLoader<TrafficBatch<B>>,
    bases: &[ChebyshevBasis<B>],
    devices: &[B::Device],
) -> TrainResult<Array3<f32>> {
    let replicas = replicate(model, devices);
    let vertices = model.num_vertices();
    let width = model.prediction_width();
    let mut values = Vec::new();

    for batch in loader.iter() {
        for (index, shard) in batch.shard(devices)?.iter().enumerate() {
            let output = forward_shard(&replicas[index], shard, &bases[index], index)?;
            let host = output
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| DeviceError::ReadBack(format!("{e:?}")))?;
            values.extend(host);
        }
    }

    let samples = values.len() / (vertices * width).max(1);
    Array3::from_shape_vec((samples, vertices, width), values)
        .map_err(|e| DeviceError::ReadBack(e.to_string()).into())
}

/// Scores test predictions against `ground_truth` (`[sample, horizon, vertex]`).
pub fn evaluate<B: Backend>(
    model: &Stgcn<B>,
    loader: &dyn DataLoader<TrafficBatch<B>>,
    bases: &[ChebyshevBasis<B>],
    devices: &[B::Device],
    ground_truth: &Array3<f32>,
    scale: PredictionScale,
    mape_epsilon: f32,
) -> TrainResult<Vec<HorizonMetrics>> {
    let prediction = scale.apply(predict(model, loader, bases, devices)?);
    let prediction = prediction
        .permuted_axes([0, 2, 1])
        .as_standard_layout()
        .into_owned();
    if prediction.len_of(Axis(0)) != ground_truth.len_of(Axis(0)) {
        return Err(DataError::ShapeMismatch {
            name: "test prediction".to_string(),
            expected: ground_truth.shape().to_vec(),
            actual: prediction.shape().to_vec(),
        }
        .into());
    }
    Ok(evaluate_horizons(ground_truth, &prediction, mape_epsilon)?)
}
