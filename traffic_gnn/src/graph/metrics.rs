use crate::graph::error::DataError;
use ndarray::{Array3, ArrayView, Axis, Dimension, Zip};
use rayon::prelude::*;

pub fn mae<D: Dimension>(truth: &ArrayView<f32, D>, prediction: &ArrayView<f32, D>) -> f32 {
    mean_of(truth, prediction, |t, p| (t - p).abs())
}

pub fn rmse<D: Dimension>(truth: &ArrayView<f32, D>, prediction: &ArrayView<f32, D>) -> f32 {
    mean_of(truth, prediction, |t, p| (t - p).powi(2)).sqrt()
}

/// Mean absolute percentage error in percent over entries with `|truth| > epsilon`.
/// Returns 0 when every entry is masked out.
pub fn masked_mape<D: Dimension>(truth: &ArrayView<f32, D>, prediction: &ArrayView<f32, D>, epsilon: f32) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    Zip::from(truth).and(prediction).for_each(|&t, &p| {
        if t.abs() > epsilon {
            sum += f64::from(((t - p) / t).abs());
            count += 1;
        }
    });
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64 * 100.0) as f32
}

fn mean_of<D: Dimension>(
    truth: &ArrayView<f32, D>,
    prediction: &ArrayView<f32, D>,
    error: impl Fn(f64, f64) -> f64,
) -> f32 {
    let count = truth.len();
    if count == 0 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    Zip::from(truth)
        .and(prediction)
        .for_each(|&t, &p| sum += error(f64::from(t), f64::from(p)));
    (sum / count as f64) as f32
}

/// Scores for one forecast step, or for all of them when `horizon` is `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct HorizonMetrics {
    pub horizon: Option<usize>,
    pub mae: f32,
    pub rmse: f32,
    pub mape: f32,
}

impl HorizonMetrics {
    fn score<D: Dimension>(
        horizon: Option<usize>,
        truth: &ArrayView<f32, D>,
        prediction: &ArrayView<f32, D>,
        epsilon: f32,
    ) -> Self {
        Self {
            horizon,
            mae: mae(truth, prediction),
            rmse: rmse(truth, prediction),
            mape: masked_mape(truth, prediction, epsilon),
        }
    }

    /// `(tag, value)` pairs: `MAE_3` for step 3, `MAE_all` for the aggregate.
    pub fn tagged(&self) -> [(String, f32); 3] {
        let suffix = match self.horizon {
            Some(h) => h.to_string(),
            None => "all".to_string(),
        };
        [
            (format!("MAE_{suffix}"), self.mae),
            (format!("RMSE_{suffix}"), self.rmse),
            (format!("MAPE_{suffix}"), self.mape),
        ]
    }
}

/// Scores `[sample, horizon, vertex]` arrays per horizon (numbered from 1),
/// followed by the aggregate over every horizon.
pub fn evaluate_horizons(
    truth: &Array3<f32>,
    prediction: &Array3<f32>,
    epsilon: f32,
) -> Result<Vec<HorizonMetrics>, DataError> {
    if truth.shape() != prediction.shape() {
        return Err(DataError::ShapeMismatch {
            name: "prediction".to_string(),
            expected: truth.shape().to_vec(),
            actual: prediction.shape().to_vec(),
        });
    }

    let horizons = truth.len_of(Axis(1));
    let mut metrics: Vec<HorizonMetrics> = (0..horizons)
        .into_par_iter()
        .map(|h| {
            let t = truth.index_axis(Axis(1), h);
            let p = prediction.index_axis(Axis(1), h);
            HorizonMetrics::score(Some(h + 1), &t, &p, epsilon)
        })
        .collect();
    metrics.push(HorizonMetrics::score(None, &truth.view(), &prediction.view(), epsilon));
    Ok(metrics)
}

/// Mean of per-update mean squared errors.
#[derive(Clone, Debug, Default)]
pub struct RunningMse {
    sum: f64,
    count: usize,
}

impl RunningMse {
    pub fn update(&mut self, mse: f32) {
        self.sum += f64::from(mse);
        self.count += 1;
    }

    pub fn value(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / self.count as f64) as f32)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, Array};

    #[test]
    fn point_metrics() {
        let truth = arr1(&[1.0f32, 2.0, 4.0]);
        let prediction = arr1(&[2.0f32, 2.0, 2.0]);
        assert_relative_eq!(mae(&truth.view(), &prediction.view()), 1.0);
        assert_relative_eq!(rmse(&truth.view(), &prediction.view()), (5.0f32 / 3.0).sqrt(), epsilon = 1e-6);
        assert_relative_eq!(
            masked_mape(&truth.view(), &prediction.view(), 1e-3),
            (1.0 + 0.0 + 0.5) / 3.0 * 100.0,
            epsilon = 1e-4
        );
    }

    #[test]
    fn mape_skips_zero_ground_truth() {
        let truth = arr1(&[0.0f32, 2.0]);
        let prediction = arr1(&[5.0f32, 1.0]);
        let mape = masked_mape(&truth.view(), &prediction.view(), 1e-3);
        assert!(mape.is_finite());
        assert_relative_eq!(mape, 50.0);

        let zeros = arr1(&[0.0f32, 0.0]);
        assert_eq!(masked_mape(&zeros.view(), &prediction.view(), 1e-3), 0.0);
    }

    #[test]
    fn per_horizon_then_aggregate() {
        let truth = Array::from_shape_fn((2, 3, 4), |(_, h, _)| (h + 1) as f32);
        let prediction = Array::from_shape_fn((2, 3, 4), |(_, h, _)| if h == 1 { 4.0 } else { (h + 1) as f32 });
        let metrics = evaluate_horizons(&truth, &prediction, 1e-3).unwrap();

        assert_eq!(metrics.len(), 4);
        assert_eq!(metrics[0].horizon, Some(1));
        assert_eq!(metrics[0].mae, 0.0);
        assert_relative_eq!(metrics[1].mae, 2.0);
        assert_relative_eq!(metrics[1].mape, 100.0);
        assert_eq!(metrics[3].horizon, None);
        assert_relative_eq!(metrics[3].mae, 2.0 / 3.0, epsilon = 1e-6);

        let tags: Vec<String> = metrics[3].tagged().into_iter().map(|(t, _)| t).collect();
        assert_eq!(tags, vec!["MAE_all", "RMSE_all", "MAPE_all"]);
        assert_eq!(metrics[2].tagged()[1].0, "RMSE_3");
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let truth = Array3::<f32>::zeros((1, 2, 3));
        let prediction = Array3::<f32>::zeros((1, 3, 2));
        assert!(evaluate_horizons(&truth, &prediction, 1e-3).is_err());
    }

    #[test]
    fn running_mse_averages_updates_and_resets() {
        let mut running = RunningMse::default();
        assert_eq!(running.value(), None);
        running.update(1.0);
        running.update(3.0);
        assert_eq!(running.value(), Some(2.0));
        assert_eq!(running.count(), 2);
        running.reset();
        assert_eq!(running.value(), None);
    }
}
