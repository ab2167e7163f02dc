use crate::graph::error::DeviceError;
use crate::graph::model::WindowShape;
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

/// One windowed sample, each field flattened row-major.
#[derive(Clone, Debug)]
pub struct TrafficItem {
    pub week: Vec<f32>,
    pub day: Vec<f32>,
    pub recent: Vec<f32>,
    pub target: Vec<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemShapes {
    pub week: WindowShape,
    pub day: WindowShape,
    pub recent: WindowShape,
    /// `[vertex, horizon]`
    pub target: [usize; 2],
}

impl ItemShapes {
    pub fn windows(&self) -> [WindowShape; 3] {
        [self.week, self.day, self.recent]
    }
}

#[derive(Clone, Debug)]
pub struct TrafficBatch<B: Backend> {
    pub week: Tensor<B, 4>,
    pub day: Tensor<B, 4>,
    pub recent: Tensor<B, 4>,
    pub target: Tensor<B, 3>,
}

impl<B: Backend> TrafficBatch<B> {
    pub fn len(&self) -> usize {
        self.recent.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn narrow(&self, start: usize, len: usize) -> Self {
        let range = start..start + len;
        Self {
            week: self.week.clone().slice([range.clone()]),
            day: self.day.clone().slice([range.clone()]),
            recent: self.recent.clone().slice([range.clone()]),
            target: self.target.clone().slice([range]),
        }
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            week: self.week.to_device(device),
            day: self.day.to_device(device),
            recent: self.recent.to_device(device),
            target: self.target.to_device(device),
        }
    }

    /// Splits the batch along its first axis, one shard per device, and moves
    /// each shard onto its device. Shards keep sample order.
    pub fn shard(&self, devices: &[B::Device]) -> Result<Vec<TrafficBatch<B>>, DeviceError> {
        let sizes = shard_sizes(self.len(), devices.len())?;
        let mut start = 0;
        let mut shards = Vec::with_capacity(sizes.len());
        for (size, device) in sizes.into_iter().zip(devices) {
            shards.push(self.narrow(start, size).to_device(device));
            start += size;
        }
        Ok(shards)
    }
}

/// Shard sizes for `batch` samples over `devices` devices: every shard gets
/// `batch / devices` samples and the last one also takes the remainder. A
/// batch smaller than the device count uses one sample per shard.
pub fn shard_sizes(batch: usize, devices: usize) -> Result<Vec<usize>, DeviceError> {
    if batch == 0 || devices == 0 {
        return Err(DeviceError::Sharding { batch, devices });
    }
    if batch < devices {
        return Ok(vec![1; batch]);
    }

    let step = batch / devices;
    let mut sizes = vec![step; devices];
    sizes[devices - 1] = batch - step * (devices - 1);
    Ok(sizes)
}

#[derive(Clone)]
pub struct TrafficBatcher<B: Backend> {
    device: B::Device,
    shapes: ItemShapes,
}

impl<B: Backend> TrafficBatcher<B> {
    pub fn new(device: B::Device, shapes: ItemShapes) -> Self {
        Self { device, shapes }
    }

    fn stack<const D: usize>(&self, values: Vec<f32>, dims: [usize; D]) -> Tensor<B, D> {
        Tensor::from_data(TensorData::new(values, dims), &self.device)
    }
}

impl<B: Backend> Batcher<TrafficItem, TrafficBatch<B>> for TrafficBatcher<B> {
    fn batch(&self, items: Vec<TrafficItem>) -> TrafficBatch<B> {
        let n = items.len();
        let window = |shape: WindowShape| [n, shape.vertices, shape.features, shape.steps];
        let [vertices, horizon] = self.shapes.target;

        let week = items.iter().flat_map(|i| i.week.iter().copied()).collect();
        let day = items.iter().flat_map(|i| i.day.iter().copied()).collect();
        let recent = items.iter().flat_map(|i| i.recent.iter().copied()).collect();
        let target = items.iter().flat_map(|i| i.target.iter().copied()).collect();

        TrafficBatch {
            week: self.stack(week, window(self.shapes.week)),
            day: self.stack(day, window(self.shapes.day)),
            recent: self.stack(recent, window(self.shapes.recent)),
            target: self.stack(target, [n, vertices, horizon]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn shard_sizes_cover_the_batch() {
        for batch in 1..=40 {
            for devices in 1..=6 {
                let sizes = shard_sizes(batch, devices).unwrap();
                assert_eq!(sizes.iter().sum::<usize>(), batch);
                assert_eq!(sizes.len(), devices.min(batch));

                let first = sizes[0];
                let unequal = sizes.iter().filter(|&&s| s != first).count();
                assert!(unequal <= 1, "{batch} over {devices}: {sizes:?}");
                if batch % devices == 0 {
                    assert_eq!(unequal, 0);
                }
            }
        }
    }

    #[test]
    fn empty_batch_or_no_devices_cannot_be_sharded() {
        assert!(shard_sizes(0, 2).is_err());
        assert!(shard_sizes(4, 0).is_err());
    }

    fn shapes() -> ItemShapes {
        let window = |steps| WindowShape {
            vertices: 2,
            features: 1,
            steps,
        };
        ItemShapes {
            week: window(2),
            day: window(2),
            recent: window(4),
            target: [2, 2],
        }
    }

    fn item(value: f32) -> TrafficItem {
        TrafficItem {
            week: vec![value; 4],
            day: vec![value; 4],
            recent: vec![value; 8],
            target: vec![value; 4],
        }
    }

    #[test]
    fn batcher_stacks_items_and_shards_keep_order() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let batcher = TrafficBatcher::<TestBackend>::new(device.clone(), shapes());
        let batch = batcher.batch((0..5).map(|i| item(i as f32)).collect());

        assert_eq!(batch.len(), 5);
        assert_eq!(batch.recent.dims(), [5, 2, 1, 4]);
        assert_eq!(batch.target.dims(), [5, 2, 2]);

        let shards = batch.shard(&[device.clone(), device]).unwrap();
        assert_eq!(shards.iter().map(TrafficBatch::len).collect::<Vec<_>>(), vec![2, 3]);

        let firsts: Vec<f32> = shards
            .iter()
            .flat_map(|s| s.target.clone().slice([0..s.len(), 0..1, 0..1]).into_data().to_vec::<f32>().unwrap())
            .collect();
        assert_eq!(firsts, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }
}
