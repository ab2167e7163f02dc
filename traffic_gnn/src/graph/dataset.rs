use crate::graph::data::{ItemShapes, TrafficItem};
use crate::graph::error::{CheckpointError, DataError};
use crate::graph::model::WindowShape;
use crate::graph::npz;
use burn::data::dataset::{Dataset, InMemDataset};
use ndarray::{concatenate, Array3, Array4, Axis, Ix4, IxDyn};
use rayon::iter::ParallelIterator;
use rayon::prelude::IntoParallelIterator;
use std::path::Path;
use tracing::info;

/// Archive name expected under `data_dir`.
pub const WINDOWS_FILE: &str = "windows.npz";

/// One split of windowed samples: inputs `[sample, vertex, feature, time]`,
/// target `[sample, vertex, horizon]`.
#[derive(Clone, Debug)]
pub struct SplitArrays {
    pub week: Array4<f32>,
    pub day: Array4<f32>,
    pub recent: Array4<f32>,
    pub target: Array3<f32>,
}

impl SplitArrays {
    pub fn len(&self) -> usize {
        self.target.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(archive: &mut npz::NpzFile, path: &Path, split: &'static str) -> Result<Self, DataError> {
        let key = |field: &str| format!("{split}_{field}");
        let week = npz::read_f32_array::<Ix4>(archive, path, &key("week"))?;
        let day = npz::read_f32_array::<Ix4>(archive, path, &key("day"))?;
        let recent = npz::read_f32_array::<Ix4>(archive, path, &key("recent"))?;

        // multi-channel targets arrive as [sample, vertex, feature, horizon]
        let target = npz::read_f32_array::<IxDyn>(archive, path, &key("target"))?;
        let shape = target.shape().to_vec();
        if shape.len() < 3 {
            return Err(DataError::format(path, format!("`{}` has shape {shape:?}", key("target"))));
        }
        let width = shape[2..].iter().product();
        let target = target
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((shape[0], shape[1], width))
            .map_err(|e| DataError::format(path, e.to_string()))?;

        let arrays = Self {
            week,
            day,
            recent,
            target,
        };
        arrays.validate(split)?;
        Ok(arrays)
    }

    fn validate(&self, split: &'static str) -> Result<(), DataError> {
        let samples = self.len();
        let vertices = self.target.len_of(Axis(1));
        for (name, shape) in [
            ("week", self.week.shape()),
            ("day", self.day.shape()),
            ("recent", self.recent.shape()),
        ] {
            if shape[0] != samples || shape[1] != vertices {
                return Err(DataError::ShapeMismatch {
                    name: format!("{split}_{name}"),
                    expected: vec![samples, vertices, shape[2], shape[3]],
                    actual: shape.to_vec(),
                });
            }
        }
        Ok(())
    }

    pub fn item_shapes(&self) -> ItemShapes {
        let window = |array: &Array4<f32>| WindowShape {
            vertices: array.shape()[1],
            features: array.shape()[2],
            steps: array.shape()[3],
        };
        ItemShapes {
            week: window(&self.week),
            day: window(&self.day),
            recent: window(&self.recent),
            target: [self.target.shape()[1], self.target.shape()[2]],
        }
    }

    pub fn items(&self) -> Vec<TrafficItem> {
        (0..self.len())
            .into_par_iter()
            .map(|i| TrafficItem {
                week: self.week.index_axis(Axis(0), i).iter().copied().collect(),
                day: self.day.index_axis(Axis(0), i).iter().copied().collect(),
                recent: self.recent.index_axis(Axis(0), i).iter().copied().collect(),
                target: self.target.index_axis(Axis(0), i).iter().copied().collect(),
            })
            .collect()
    }

    fn append(&mut self, other: &SplitArrays) -> Result<(), DataError> {
        let expected = self.recent.shape().to_vec();
        let actual = other.recent.shape().to_vec();
        let join = |_: ndarray::ShapeError| DataError::ShapeMismatch {
            name: "merged split".to_string(),
            expected: expected.clone(),
            actual: actual.clone(),
        };
        let week = concatenate(Axis(0), &[self.week.view(), other.week.view()]).map_err(join)?;
        let day = concatenate(Axis(0), &[self.day.view(), other.day.view()]).map_err(join)?;
        let recent = concatenate(Axis(0), &[self.recent.view(), other.recent.view()]).map_err(join)?;
        let target = concatenate(Axis(0), &[self.target.view(), other.target.view()]).map_err(join)?;
        *self = Self {
            week,
            day,
            recent,
            target,
        };
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TrafficSplits {
    pub train: SplitArrays,
    pub val: SplitArrays,
    pub test: SplitArrays,
}

impl TrafficSplits {
    /// Reads `{train,val,test}_{week,day,recent,target}` from an archive.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let path = path.as_ref();
        let mut archive = npz::open_npz(path)?;
        let splits = Self {
            train: SplitArrays::load(&mut archive, path, "train")?,
            val: SplitArrays::load(&mut archive, path, "val")?,
            test: SplitArrays::load(&mut archive, path, "test")?,
        };
        splits.check()?;

        info!(
            train = splits.train.len(),
            val = splits.val.len(),
            test = splits.test.len(),
            "loaded windowed splits"
        );
        Ok(splits)
    }

    pub fn check(&self) -> Result<(), DataError> {
        for (name, split) in [("train", &self.train), ("val", &self.val), ("test", &self.test)] {
            if split.is_empty() {
                return Err(DataError::EmptySplit(name));
            }
        }
        let expected = self.train.item_shapes();
        for (name, split) in [("val", &self.val), ("test", &self.test)] {
            let actual = split.item_shapes();
            if actual != expected {
                return Err(DataError::ShapeMismatch {
                    name: name.to_string(),
                    expected: expected.recent.dims().to_vec(),
                    actual: actual.recent.dims().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Appends the validation samples to the training split.
    pub fn merge_validation(&mut self) -> Result<(), DataError> {
        let val = self.val.clone();
        self.train.append(&val)
    }

    pub fn item_shapes(&self) -> ItemShapes {
        self.train.item_shapes()
    }

    /// Computes statistics on the training split and z-scores every split.
    pub fn normalize(&mut self) -> Result<NormalizationStats, DataError> {
        let stats = NormalizationStats::compute(&self.train)?;
        for split in [&mut self.train, &mut self.val, &mut self.test] {
            stats.apply(split);
        }
        Ok(stats)
    }

    /// Test targets as `[sample, horizon, vertex]`.
    pub fn ground_truth(&self) -> Array3<f32> {
        self.test
            .target
            .view()
            .permuted_axes([0, 2, 1])
            .as_standard_layout()
            .into_owned()
    }
}

/// Per-position mean and standard deviation, shaped `[1, vertex, feature, time]`.
#[derive(Clone, Debug)]
pub struct BranchStats {
    pub mean: Array4<f32>,
    pub std: Array4<f32>,
}

impl BranchStats {
    fn compute(train: &Array4<f32>) -> Result<Self, DataError> {
        let mean = train.mean_axis(Axis(0)).ok_or(DataError::EmptySplit("train"))?;
        let std = train.std_axis(Axis(0), 0.0);
        Ok(Self {
            mean: mean.insert_axis(Axis(0)),
            std: std.insert_axis(Axis(0)),
        })
    }

    fn apply(&self, values: &mut Array4<f32>) {
        // constant positions would divide by zero
        let scale = self.std.mapv(|s| if s > 0.0 { s } else { 1.0 });
        *values -= &self.mean;
        *values /= &scale;
    }
}

#[derive(Clone, Debug)]
pub struct NormalizationStats {
    pub week: BranchStats,
    pub day: BranchStats,
    pub recent: BranchStats,
}

impl NormalizationStats {
    pub fn compute(train: &SplitArrays) -> Result<Self, DataError> {
        Ok(Self {
            week: BranchStats::compute(&train.week)?,
            day: BranchStats::compute(&train.day)?,
            recent: BranchStats::compute(&train.recent)?,
        })
    }

    pub fn apply(&self, split: &mut SplitArrays) {
        self.week.apply(&mut split.week);
        self.day.apply(&mut split.day);
        self.recent.apply(&mut split.recent);
    }

    /// Writes `{week,day,recent}_{mean,std}` to a compressed archive.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        npz::write_compressed(
            path.as_ref(),
            &[
                ("week_mean", self.week.mean.view().into_dyn()),
                ("week_std", self.week.std.view().into_dyn()),
                ("day_mean", self.day.mean.view().into_dyn()),
                ("day_std", self.day.std.view().into_dyn()),
                ("recent_mean", self.recent.mean.view().into_dyn()),
                ("recent_std", self.recent.std.view().into_dyn()),
            ],
        )
    }
}

pub struct TrafficDataset {
    dataset: InMemDataset<TrafficItem>,
}

impl Dataset<TrafficItem> for TrafficDataset {
    fn get(&self, index: usize) -> Option<TrafficItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl TrafficDataset {
    pub fn new(split: &SplitArrays) -> Self {
        Self {
            dataset: InMemDataset::new(split.items()),
        }
    }
}
