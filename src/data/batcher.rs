use std::sync::mpsc;
use std::thread;

use rand::rngs::StdRng;
use tch::{Device, Kind, Tensor};

use super::loader::ImageSet;
use super::shuffle::ShuffleBuffer;

/// A stacked batch. `images` are raw 0..255 floats in NCHW; `labels` are
/// one-hot rows; `targets` are the matching class indices.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
    pub targets: Tensor,
}

impl Batch {
    pub fn size(&self) -> i64 {
        self.targets.size()[0]
    }

    pub fn to(self, device: Device) -> Self {
        Self {
            images: self.images.to(device),
            labels: self.labels.to(device),
            targets: self.targets.to(device),
        }
    }
}

/// Prefetch depth used when the caller asks for "auto".
pub fn autotune_depth() -> usize {
    num_cpus::get().max(1)
}

pub fn batch_from_set(set: &ImageSet, idxs: &[usize], num_classes: usize) -> Batch {
    let n = idxs.len();
    let side = set.img_size as i64;
    let mut pixels = Vec::with_capacity(n * (side * side * 3) as usize);
    let mut one_hot = vec![0f32; n * num_classes];
    let mut targets = Vec::with_capacity(n);

    for (row, &i) in idxs.iter().enumerate() {
        let sample = &set.samples[i];
        pixels.extend_from_slice(&sample.pixels);
        one_hot[row * num_classes + sample.label] = 1.0;
        targets.push(sample.label as i64);
    }

    let images = Tensor::from_slice(&pixels)
        .view([n as i64, side, side, 3])
        .permute(&[0, 3, 1, 2])
        .to_kind(Kind::Float);
    let labels = Tensor::from_slice(&one_hot).view([n as i64, num_classes as i64]);
    let targets = Tensor::from_slice(&targets);
    Batch {
        images,
        labels,
        targets,
    }
}

/// Fixed-size chunks of `0..len` in order; the last chunk may be short.
pub fn batch_indices(len: usize, batch_size: usize) -> Vec<Vec<usize>> {
    (0..len)
        .collect::<Vec<_>>()
        .chunks(batch_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

/// Batch order for one training epoch, passed through the shuffle buffer.
pub fn shuffled_batches(
    len: usize,
    batch_size: usize,
    buffer: usize,
    rng: &mut StdRng,
) -> Vec<Vec<usize>> {
    ShuffleBuffer::new(batch_indices(len, batch_size).into_iter(), buffer, rng).collect()
}

/// Streams `order` as batches built on a producer thread, `depth` batches
/// ahead of the consumer. Stops early when `f` fails.
pub fn for_each_batch<E, F>(
    set: &ImageSet,
    order: &[Vec<usize>],
    num_classes: usize,
    depth: usize,
    device: Device,
    mut f: F,
) -> Result<(), E>
where
    F: FnMut(Batch) -> Result<(), E>,
{
    thread::scope(|scope| {
        let (tx, rx) = mpsc::sync_channel::<Batch>(depth.max(1));
        scope.spawn(move || {
            for idxs in order {
                if tx.send(batch_from_set(set, idxs, num_classes)).is_err() {
                    break;
                }
            }
        });
        for batch in rx {
            f(batch.to(device))?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::Sample;
    use rand::SeedableRng;

    fn tiny_set(n: usize, classes: usize) -> ImageSet {
        let samples = (0..n)
            .map(|i| Sample {
                pixels: vec![i as u8; 2 * 2 * 3],
                label: i % classes,
            })
            .collect();
        ImageSet {
            samples,
            img_size: 2,
        }
    }

    #[test]
    fn batch_has_nchw_images_and_one_hot_labels() {
        let set = tiny_set(5, 3);
        let batch = batch_from_set(&set, &[0, 1, 4], 3);
        assert_eq!(batch.images.size(), vec![3, 3, 2, 2]);
        assert_eq!(batch.labels.size(), vec![3, 3]);
        assert_eq!(batch.size(), 3);
        assert_eq!(batch.labels.sum(Kind::Float).double_value(&[]), 3.0);
        assert_eq!(batch.labels.double_value(&[2, 1]), 1.0);
        assert_eq!(batch.images.double_value(&[2, 0, 1, 1]), 4.0);
    }

    #[test]
    fn indices_cover_everything_with_short_tail() {
        let chunks = batch_indices(70, 32);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 6);
        assert_eq!(chunks.concat(), (0..70).collect::<Vec<_>>());
    }

    #[test]
    fn shuffled_batches_keep_batch_contents() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut order = shuffled_batches(10, 4, 1000, &mut rng);
        order.sort();
        assert_eq!(order, batch_indices(10, 4));
    }

    #[test]
    fn prefetch_delivers_batches_in_order() {
        let set = tiny_set(7, 2);
        let order = batch_indices(7, 3);
        let mut seen = Vec::new();
        for_each_batch::<(), _>(&set, &order, 2, 2, Device::Cpu, |b| {
            seen.push(b.size());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![3, 3, 1]);
    }

    #[test]
    fn prefetch_stops_on_error() {
        let set = tiny_set(9, 3);
        let order = batch_indices(9, 1);
        let mut calls = 0;
        let res = for_each_batch(&set, &order, 3, 1, Device::Cpu, |_| {
            calls += 1;
            if calls == 2 {
                Err("boom")
            } else {
                Ok(())
            }
        });
        assert_eq!(res, Err("boom"));
        assert_eq!(calls, 2);
    }
}
