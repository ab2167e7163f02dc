use crate::graph::backbone::AllBackbones;
use crate::graph::config::{prepare_params_dir, resolve_params_dir, ExperimentConfig, OptimizerKind};
use crate::graph::data::{TrafficBatch, TrafficBatcher};
use crate::graph::dataset::{TrafficDataset, TrafficSplits, WINDOWS_FILE};
use crate::graph::error::{CheckpointError, ConfigError, DataError, LoggingError, TrainResult};
use crate::graph::eval::{self, forward_shard, scalar, PredictionScale};
use crate::graph::laplacian::{read_vertex_count, AdjacencyMatrix, ChebyshevPolynomials};
use crate::graph::metrics::{HorizonMetrics, RunningMse};
use crate::graph::model::{build_model, ChebyshevBasis, Stgcn, TwoTierInit};
use crate::graph::npz;
use crate::graph::summary::{MetricSink, TensorboardSink};
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::{AdamConfig, GradientsAccumulator, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use chrono::Local;
use ndarray::Array3;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const STATS_FILE: &str = "stats_data.npz";
pub const CONFIG_FILE: &str = "config.json";
pub const HISTOGRAM_BINS: usize = 1000;

pub fn checkpoint_path(params_dir: &Path, model_name: &str, epoch: usize) -> PathBuf {
    params_dir.join(format!("{model_name}_epoch_{epoch}.params"))
}

/// Writes the model record to `path`. Existing files are never replaced.
pub fn save_checkpoint<B: Backend>(model: &Stgcn<B>, path: &Path) -> Result<(), CheckpointError> {
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    let bytes = <NamedMpkBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(
        &recorder,
        model.clone().into_record(),
        (),
    )
    .map_err(|e| CheckpointError::Encode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| match source.kind() {
            ErrorKind::AlreadyExists => CheckpointError::Exists(path.to_path_buf()),
            _ => CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;
    file.write_all(&bytes).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    PreTrainEval,
    TrainingEpoch,
    PostEpochEval,
    Checkpointing,
    Done,
}

pub struct Loaders<B: AutodiffBackend> {
    pub train: Arc<dyn DataLoader<TrafficBatch<B>>>,
    pub val: Arc<dyn DataLoader<TrafficBatch<B::InnerBackend>>>,
    pub test: Arc<dyn DataLoader<TrafficBatch<B::InnerBackend>>>,
}

/// What a finished run leaves behind.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub params_dir: PathBuf,
    /// Index 0 holds the loss before any update.
    pub validation_losses: Vec<f32>,
    pub test_metrics: Vec<HorizonMetrics>,
    pub checkpoints: Vec<PathBuf>,
}

/// Tag of the `index`-th float parameter in visit order, e.g.
/// `param03_8x1x1x3_grad`. Visit order follows the module's field order, so
/// tags stay stable across runs while parameter ids do not.
pub fn gradient_tag(index: usize, dims: &[usize]) -> String {
    let shape: Vec<String> = dims.iter().map(usize::to_string).collect();
    format!("param{index:02}_{}_grad", shape.join("x"))
}

/// Emits one histogram per parameter gradient.
struct GradientHistograms<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    sink: &'a mut dyn MetricSink,
    step: usize,
    index: usize,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> GradientHistograms<'_, B> {
    fn emit<const D: usize>(&mut self, id: ParamId, dims: [usize; D]) -> Result<(), LoggingError> {
        let tag = gradient_tag(self.index, &dims);
        let grad = self
            .grads
            .get::<B::InnerBackend, D>(id)
            .ok_or_else(|| LoggingError::MissingGradient(tag.clone()))?;
        let values = grad
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| LoggingError::Write {
                tag: tag.clone(),
                message: format!("{e:?}"),
            })?;
        self.sink.add_histogram(&tag, &values, self.step, HISTOGRAM_BINS)
    }
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientHistograms<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if let Err(e) = self.emit::<D>(id, tensor.dims()) {
            warn!(error = %e, "skipping gradient histogram");
        }
        self.index += 1;
    }
}

fn log_scalar(sink: &mut dyn MetricSink, tag: &str, value: f32, step: usize) {
    if let Err(e) = sink.add_scalar(tag, value, step) {
        warn!(error = %e, "dropping metric event");
    }
}

/// Mutable state of one training run.
pub struct TrainingSession<B: AutodiffBackend> {
    devices: Vec<B::Device>,
    bases: Vec<ChebyshevBasis<B>>,
    eval_bases: Vec<ChebyshevBasis<B::InnerBackend>>,
    running: RunningMse,
    phase: Phase,
    epoch: usize,
    global_step: usize,
    params_dir: PathBuf,
    model_name: String,
    learning_rate: f64,
    mape_epsilon: f32,
    scale: PredictionScale,
}

impl<B: AutodiffBackend> TrainingSession<B> {
    pub fn new(
        devices: Vec<B::Device>,
        polynomials: &ChebyshevPolynomials,
        params_dir: PathBuf,
        model_name: String,
        learning_rate: f64,
        mape_epsilon: f32,
    ) -> Result<Self, ConfigError> {
        if devices.is_empty() {
            return Err(ConfigError::DeviceList("no compute device available".to_string()));
        }
        let bases = devices
            .iter()
            .map(|d| ChebyshevBasis::from_polynomials(polynomials, d))
            .collect();
        let eval_bases = devices
            .iter()
            .map(|d| ChebyshevBasis::from_polynomials(polynomials, d))
            .collect();

        Ok(Self {
            devices,
            bases,
            eval_bases,
            running: RunningMse::default(),
            phase: Phase::Initializing,
            epoch: 0,
            global_step: 0,
            params_dir,
            model_name,
            learning_rate,
            mape_epsilon,
            scale: PredictionScale::default(),
        })
    }

    pub fn with_scale(mut self, scale: PredictionScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn running_mse(&self) -> Option<f32> {
        self.running.value()
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = ?self.phase, to = ?phase, epoch = self.epoch, "phase transition");
        self.phase = phase;
    }

    /// Forward pass over the validation split followed by the two-tier
    /// re-initialization of every parameter.
    pub fn warm_up(&mut self, model: Stgcn<B>, loaders: &Loaders<B>) -> TrainResult<Stgcn<B>> {
        let loss = eval::compute_val_loss(&model.valid(), loaders.val.as_ref(), &self.eval_bases, &self.devices)?;
        debug!(loss, "warm-up pass finished");
        Ok(model.map(&mut TwoTierInit::default()))
    }

    /// Trains with the optimizer named in the configuration.
    pub fn fit_with(
        &mut self,
        kind: OptimizerKind,
        model: Stgcn<B>,
        loaders: &Loaders<B>,
        ground_truth: &Array3<f32>,
        epochs: usize,
        sink: &mut dyn MetricSink,
    ) -> TrainResult<(Stgcn<B>, RunSummary)> {
        match kind {
            OptimizerKind::Adam => {
                let optim = AdamConfig::new().init::<B, Stgcn<B>>();
                self.fit(model, optim, loaders, ground_truth, epochs, sink)
            }
            OptimizerKind::Sgd => {
                let optim = SgdConfig::new().init::<B, Stgcn<B>>();
                self.fit(model, optim, loaders, ground_truth, epochs, sink)
            }
        }
    }

    pub fn fit<O: Optimizer<Stgcn<B>, B>>(
        &mut self,
        mut model: Stgcn<B>,
        mut optim: O,
        loaders: &Loaders<B>,
        ground_truth: &Array3<f32>,
        epochs: usize,
        sink: &mut dyn MetricSink,
    ) -> TrainResult<(Stgcn<B>, RunSummary)> {
        let mut summary = RunSummary {
            params_dir: self.params_dir.clone(),
            validation_losses: Vec::with_capacity(epochs + 1),
            test_metrics: Vec::new(),
            checkpoints: Vec::with_capacity(epochs),
        };

        self.enter(Phase::PreTrainEval);
        let (loss, metrics) = self.evaluate(&model, loaders, ground_truth, sink)?;
        info!(epoch = 0, validation_loss = loss, "baseline");
        summary.validation_losses.push(loss);
        summary.test_metrics = metrics;

        for epoch in 1..=epochs {
            self.epoch = epoch;
            self.enter(Phase::TrainingEpoch);
            self.running.reset();

            let mut batches = loaders.train.iter().peekable();
            let mut steps = 0;
            while let Some(batch) = batches.next() {
                let (grads, loss) = self.train_batch(&model, batch)?;
                self.global_step += 1;
                debug!(step = self.global_step, batch_loss = loss, "batch done");
                if let Some(mse) = self.running.value() {
                    log_scalar(sink, "training_loss", mse, self.global_step);
                }

                if batches.peek().is_none() {
                    self.enter(Phase::PostEpochEval);
                    let mut histograms = GradientHistograms::<B> {
                        grads: &grads,
                        sink: &mut *sink,
                        step: self.global_step,
                        index: 0,
                        backend: PhantomData,
                    };
                    model.visit(&mut histograms);
                }
                model = optim.step(self.learning_rate, model, grads);
                steps += 1;
            }
            if steps == 0 {
                return Err(DataError::EmptySplit("train").into());
            }

            let (loss, metrics) = self.evaluate(&model, loaders, ground_truth, sink)?;
            info!(
                epoch,
                step = self.global_step,
                training_mse = self.running.value().unwrap_or(f32::NAN),
                validation_loss = loss,
                "epoch finished"
            );
            summary.validation_losses.push(loss);
            summary.test_metrics = metrics;
            sink.flush();

            self.enter(Phase::Checkpointing);
            let path = checkpoint_path(&self.params_dir, &self.model_name, epoch);
            save_checkpoint(&model, &path)?;
            debug!(path = %path.display(), "checkpoint written");
            summary.checkpoints.push(path);
        }

        self.enter(Phase::Done);
        Ok((model, summary))
    }

    /// Forward and backward over every shard of one batch. Gradients land on
    /// the main device; the loss of each shard is normalized by the full
    /// batch size so the accumulated gradient matches a single-device pass.
    fn train_batch(&mut self, model: &Stgcn<B>, batch: TrafficBatch<B>) -> TrainResult<(GradientsParams, f32)> {
        let batch_size = batch.len();
        let main = &self.devices[0];
        let mut accumulator = GradientsAccumulator::<Stgcn<B>>::new();
        let mut batch_loss = 0.0;

        for (index, shard) in batch.shard(&self.devices)?.into_iter().enumerate() {
            let replica = model.clone().fork(&self.devices[index]);
            let output = forward_shard(&replica, &shard, &self.bases[index], index)?;
            let [_, vertices, width] = output.dims();

            let squared = (output - shard.target).powf_scalar(2.0);
            self.running.update(scalar(squared.clone().mean()));
            let loss = squared
                .sum()
                .mul_scalar(0.5 / (vertices * width * batch_size) as f64);
            batch_loss += scalar(loss.clone());

            let grads = GradientsParams::from_grads(loss.backward(), &replica).to_device(main, &replica);
            accumulator.accumulate(&replica, grads);
        }

        Ok((accumulator.grads(), batch_loss))
    }

    /// Validation loss and test metrics on the non-autodiff model, logged at
    /// the current epoch.
    fn evaluate(
        &mut self,
        model: &Stgcn<B>,
        loaders: &Loaders<B>,
        ground_truth: &Array3<f32>,
        sink: &mut dyn MetricSink,
    ) -> TrainResult<(f32, Vec<HorizonMetrics>)> {
        let inner = model.valid();
        let loss = eval::compute_val_loss(&inner, loaders.val.as_ref(), &self.eval_bases, &self.devices)?;
        log_scalar(sink, "validation_loss", loss, self.epoch);

        let metrics = eval::evaluate(
            &inner,
            loaders.test.as_ref(),
            &self.eval_bases,
            &self.devices,
            ground_truth,
            self.scale,
            self.mape_epsilon,
        )?;
        for metric in &metrics {
            for (tag, value) in metric.tagged() {
                log_scalar(sink, &tag, value, self.epoch);
            }
        }
        if let Some(all) = metrics.last() {
            info!(epoch = self.epoch, mae = all.mae, rmse = all.rmse, mape = all.mape, "test metrics");
        }
        Ok((loss, metrics))
    }
}

/// Creates the params directory and trains there, streaming events to a
/// TensorBoard log in the same directory.
pub fn run<B: AutodiffBackend>(
    config: &ExperimentConfig,
    devices: Vec<B::Device>,
    force: bool,
) -> TrainResult<RunSummary> {
    let params_dir = resolve_params_dir(&config.training, Local::now());
    prepare_params_dir(&params_dir, force)?;
    info!(params_dir = %params_dir.display(), "params directory ready");

    let mut sink = TensorboardSink::new(&params_dir);
    train::<B>(config, &params_dir, devices, &mut sink)
}

pub fn train<B: AutodiffBackend>(
    config: &ExperimentConfig,
    params_dir: &Path,
    devices: Vec<B::Device>,
    sink: &mut dyn MetricSink,
) -> TrainResult<RunSummary> {
    let data = &config.data;
    let training = &config.training;
    let model_kind = training.model_kind()?;
    let optimizer_kind = training.optimizer_kind()?;

    config
        .save(params_dir.join(CONFIG_FILE))
        .map_err(|source| CheckpointError::Io {
            path: params_dir.join(CONFIG_FILE),
            source,
        })?;
    B::seed(training.seed);

    let num_vertices = match data.num_of_vertices {
        Some(n) => Some(n),
        None if !data.node_pos_filename.is_empty() => Some(read_vertex_count(&data.node_pos_filename)?),
        None => None,
    };
    let adjacency = AdjacencyMatrix::load(&data.adj_filename, num_vertices)?;
    let polynomials = match &training.kernel_cache {
        Some(cache) => ChebyshevPolynomials::cached_or_compute(Path::new(cache), &adjacency, training.k)?,
        None => ChebyshevPolynomials::from_adjacency(&adjacency, training.k)?,
    };
    let polynomials = Arc::new(polynomials);
    let backbones = AllBackbones::build(training, Arc::clone(&polynomials))?;
    info!(
        vertices = adjacency.num_vertices(),
        k = training.k,
        model = model_kind.name(),
        "kernels and backbones ready"
    );

    let mut splits = TrafficSplits::load(Path::new(&data.data_dir).join(WINDOWS_FILE))?;
    if training.merge {
        splits.merge_validation()?;
        info!(train = splits.train.len(), "validation split merged into training");
    }
    let stats = splits.normalize()?;
    stats.save(params_dir.join(STATS_FILE))?;

    let shapes = splits.item_shapes();
    let expected_width = data.num_for_predict * backbones.output_features();
    if shapes.target[1] != expected_width {
        return Err(ConfigError::invalid_value(
            "num_for_predict",
            format!(
                "targets carry {} values per vertex, model forecasts {expected_width}",
                shapes.target[1]
            ),
        )
        .into());
    }

    let main = devices
        .first()
        .cloned()
        .ok_or_else(|| ConfigError::DeviceList("no compute device available".to_string()))?;
    let loaders = Loaders::<B> {
        train: DataLoaderBuilder::new(TrafficBatcher::<B>::new(main.clone(), shapes))
            .batch_size(training.batch_size)
            .shuffle(training.seed)
            .num_workers(training.num_workers)
            .build(TrafficDataset::new(&splits.train)),
        val: DataLoaderBuilder::new(TrafficBatcher::<B::InnerBackend>::new(main.clone(), shapes))
            .batch_size(training.batch_size)
            .num_workers(training.num_workers)
            .build(TrafficDataset::new(&splits.val)),
        test: DataLoaderBuilder::new(TrafficBatcher::<B::InnerBackend>::new(main.clone(), shapes))
            .batch_size(training.batch_size)
            .num_workers(training.num_workers)
            .build(TrafficDataset::new(&splits.test)),
    };
    let ground_truth = splits.ground_truth();

    let model = build_model::<B>(model_kind, &backbones, shapes.windows(), data.num_for_predict, &main)?;
    let mut session = TrainingSession::<B>::new(
        devices,
        &polynomials,
        params_dir.to_path_buf(),
        training.model_name.clone(),
        training.learning_rate,
        training.mape_epsilon,
    )?;
    let model = session.warm_up(model, &loaders)?;
    let (model, summary) = session.fit_with(optimizer_kind, model, &loaders, &ground_truth, training.epochs, sink)?;

    if let Some(filename) = &training.prediction_filename {
        let prediction = eval::predict(&model.valid(), loaders.test.as_ref(), &session.eval_bases, &session.devices)?;
        let path = PathBuf::from(filename);
        npz::write_compressed(
            &path,
            &[
                ("prediction", prediction.view().into_dyn()),
                ("ground_truth", splits.test.target.view().into_dyn()),
            ],
        )?;
        info!(path = %path.display(), "predictions written");
    }

    info!(
        epochs = training.epochs,
        steps = session.global_step(),
        "training finished"
    );
    Ok(summary)
}
