use crate::graph::error::LoggingError;
use std::path::Path;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Prefix of the event files TensorBoard reads from a log directory.
pub const EVENT_FILE_PREFIX: &str = "events.out.tfevents";

/// Destination for scalar and histogram events. A failed write loses that
/// event only; callers log it and carry on.
pub trait MetricSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<(), LoggingError>;

    fn add_histogram(&mut self, tag: &str, values: &[f32], step: usize, bins: usize) -> Result<(), LoggingError>;

    fn flush(&mut self) {}
}

/// Summary statistics in the shape TensorBoard's raw histogram expects.
#[derive(Clone, Debug, PartialEq)]
struct RawHistogram {
    min: f64,
    max: f64,
    num: f64,
    sum: f64,
    sum_squares: f64,
    bucket_limits: Vec<f64>,
    bucket_counts: Vec<f64>,
}

impl RawHistogram {
    /// Equal-width buckets over the finite values, keyed by right edge.
    fn new(values: &[f32], bins: usize) -> Option<Self> {
        let finite: Vec<f64> = values.iter().filter(|v| v.is_finite()).map(|&v| v as f64).collect();
        if finite.is_empty() {
            return None;
        }
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let bins = if max > min { bins.max(1) } else { 1 };
        let width = (max - min) / bins as f64;

        let mut bucket_counts = vec![0.0; bins];
        for v in &finite {
            let bin = if width > 0.0 { (((v - min) / width) as usize).min(bins - 1) } else { 0 };
            bucket_counts[bin] += 1.0;
        }
        let bucket_limits = (1..=bins)
            .map(|i| if i == bins { max } else { min + width * i as f64 })
            .collect();

        Some(Self {
            min,
            max,
            num: finite.len() as f64,
            sum: finite.iter().sum(),
            sum_squares: finite.iter().map(|v| v * v).sum(),
            bucket_limits,
            bucket_counts,
        })
    }
}

/// Streams events into a TensorBoard log directory.
pub struct TensorboardSink {
    writer: SummaryWriter,
}

impl TensorboardSink {
    pub fn new(logdir: impl AsRef<Path>) -> Self {
        Self {
            writer: SummaryWriter::new(logdir.as_ref()),
        }
    }
}

impl MetricSink for TensorboardSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<(), LoggingError> {
        self.writer.add_scalar(tag, value, step);
        Ok(())
    }

    fn add_histogram(&mut self, tag: &str, values: &[f32], step: usize, bins: usize) -> Result<(), LoggingError> {
        let histogram = RawHistogram::new(values, bins).ok_or_else(|| LoggingError::Write {
            tag: tag.to_string(),
            message: "no finite values".to_string(),
        })?;
        self.writer.add_histogram_raw(
            tag,
            histogram.min,
            histogram.max,
            histogram.num,
            histogram.sum,
            histogram.sum_squares,
            &histogram.bucket_limits,
            &histogram.bucket_counts,
            step,
        );
        Ok(())
    }

    fn flush(&mut self) {
        self.writer.flush();
    }
}

impl Drop for TensorboardSink {
    fn drop(&mut self) {
        self.writer.flush();
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordedEvent {
    Scalar { tag: String, step: usize, value: f32 },
    Histogram { tag: String, step: usize, values: usize },
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct InMemorySink {
    pub events: Vec<RecordedEvent>,
}

impl InMemorySink {
    pub fn scalars(&self, tag: &str) -> Vec<(usize, f32)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::Scalar { tag: t, step, value } if t == tag => Some((*step, *value)),
                _ => None,
            })
            .collect()
    }

    pub fn histogram_tags(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::Histogram { tag, .. } => Some(tag.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl MetricSink for InMemorySink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<(), LoggingError> {
        self.events.push(RecordedEvent::Scalar {
            tag: tag.to_string(),
            step,
            value,
        });
        Ok(())
    }

    fn add_histogram(&mut self, tag: &str, values: &[f32], step: usize, _bins: usize) -> Result<(), LoggingError> {
        self.events.push(RecordedEvent::Histogram {
            tag: tag.to_string(),
            step,
            values: values.len(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn event_files(dir: &Path) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(EVENT_FILE_PREFIX))
            })
            .collect()
    }

    #[test]
    fn raw_histogram_counts_every_finite_value() {
        let values: Vec<f32> = (0..100).map(|i| i as f32).chain([f32::NAN, f32::INFINITY]).collect();
        let histogram = RawHistogram::new(&values, 10).unwrap();
        assert_eq!(histogram.bucket_counts.len(), 10);
        assert_eq!(histogram.bucket_limits.len(), 10);
        assert_eq!(histogram.bucket_counts.iter().sum::<f64>(), 100.0);
        assert_eq!(histogram.bucket_counts[9], 10.0);
        assert_eq!((histogram.min, histogram.max, histogram.num), (0.0, 99.0, 100.0));
        assert_eq!(*histogram.bucket_limits.last().unwrap(), 99.0);
        assert_abs_diff_eq!(histogram.sum, 4950.0);
        assert_abs_diff_eq!(histogram.sum_squares, 328350.0);

        let constant = RawHistogram::new(&[2.0; 5], 1000).unwrap();
        assert_eq!(constant.bucket_counts, vec![5.0]);
        assert!(RawHistogram::new(&[f32::NAN], 3).is_none());
        assert!(RawHistogram::new(&[], 3).is_none());
    }

    #[test]
    fn tensorboard_sink_writes_an_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TensorboardSink::new(dir.path());
        sink.add_scalar("training_loss", 0.25, 7).unwrap();
        sink.add_histogram("weight_grad", &[0.0, 1.0, 2.0], 1, 4).unwrap();
        assert!(matches!(
            sink.add_histogram("empty_grad", &[], 1, 4),
            Err(LoggingError::Write { .. })
        ));
        drop(sink);

        let files = event_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(std::fs::metadata(&files[0]).unwrap().len() > 0);
    }

    #[test]
    fn in_memory_sink_filters_by_tag() {
        let mut sink = InMemorySink::default();
        sink.add_scalar("validation_loss", 1.0, 0).unwrap();
        sink.add_scalar("MAE_1", 3.0, 0).unwrap();
        sink.add_scalar("validation_loss", 0.5, 1).unwrap();
        sink.add_histogram("a_grad", &[1.0], 1, 1000).unwrap();

        assert_eq!(sink.scalars("validation_loss"), vec![(0, 1.0), (1, 0.5)]);
        assert_eq!(sink.histogram_tags(), vec!["a_grad"]);
    }
}
