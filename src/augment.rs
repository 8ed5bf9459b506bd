//! Random training-time perturbations on raw 0..255 NCHW batches.
//!
//! Every call draws fresh per-sample parameters from the torch RNG, so a
//! seeded run (`tch::manual_seed`) is reproducible.

use std::f64::consts::PI;

use tch::{Kind, Tensor};

const PIXEL_MAX: f64 = 255.0;
const BILINEAR: i64 = 0;
const REFLECTION: i64 = 2;

/// Factor ranges are symmetric: a value `f` draws uniformly from `[-f, f]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentation {
    pub flip: bool,
    /// Fraction of a full turn.
    pub rotation: f64,
    pub zoom: f64,
    pub contrast: f64,
    /// Fraction of the 0..255 value range.
    pub brightness: f64,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            flip: true,
            rotation: 0.2,
            zoom: 0.2,
            contrast: 0.2,
            brightness: 0.2,
        }
    }
}

fn uniform(n: i64, factor: f64, like: &Tensor) -> Tensor {
    (Tensor::rand([n], (Kind::Float, like.device())) * 2.0 - 1.0) * factor
}

fn random_flip(xs: &Tensor, dim: i64) -> Tensor {
    let n = xs.size()[0];
    let mask = Tensor::rand([n, 1, 1, 1], (Kind::Float, xs.device()))
        .lt(0.5)
        .to_kind(Kind::Float);
    xs + (xs.flip(&[dim]) - xs) * mask
}

impl Augmentation {
    pub fn identity() -> Self {
        Self {
            flip: false,
            rotation: 0.0,
            zoom: 0.0,
            contrast: 0.0,
            brightness: 0.0,
        }
    }

    pub fn apply(&self, xs: &Tensor) -> Tensor {
        let _guard = tch::no_grad_guard();
        let mut x = xs.shallow_clone();

        if self.flip {
            x = random_flip(&x, 3);
            x = random_flip(&x, 2);
        }
        if self.rotation > 0.0 || self.zoom > 0.0 {
            x = self.rotate_zoom(&x);
        }
        if self.contrast > 0.0 {
            x = self.adjust_contrast(&x);
        }
        if self.brightness > 0.0 {
            x = self.adjust_brightness(&x);
        }
        x
    }

    fn rotate_zoom(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let n = size[0];
        let angle = uniform(n, self.rotation, xs) * (2.0 * PI);
        let scale = uniform(n, self.zoom, xs) + 1.0;

        let cos = angle.cos() * &scale;
        let sin = angle.sin() * &scale;
        let zeros = Tensor::zeros([n], (Kind::Float, xs.device()));

        let row0 = Tensor::stack(&[cos.shallow_clone(), -&sin, zeros.shallow_clone()], 1);
        let row1 = Tensor::stack(&[sin, cos, zeros], 1);
        let theta = Tensor::stack(&[row0, row1], 1);

        let grid = Tensor::affine_grid_generator(&theta, size.as_slice(), false);
        Tensor::grid_sampler(xs, &grid, BILINEAR, REFLECTION, false)
    }

    fn adjust_contrast(&self, xs: &Tensor) -> Tensor {
        let n = xs.size()[0];
        let mean = xs.adaptive_avg_pool2d(&[1, 1]);
        let factor = (uniform(n, self.contrast, xs) + 1.0).view([n, 1, 1, 1]);
        ((xs - &mean) * factor + mean).clamp(0.0, PIXEL_MAX)
    }

    fn adjust_brightness(&self, xs: &Tensor) -> Tensor {
        let n = xs.size()[0];
        let delta = (uniform(n, self.brightness, xs) * PIXEL_MAX).view([n, 1, 1, 1]);
        (xs + delta).clamp(0.0, PIXEL_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Tensor {
        Tensor::rand([4, 3, 16, 16], (Kind::Float, tch::Device::Cpu)) * PIXEL_MAX
    }

    #[test]
    fn keeps_shape_and_value_range() {
        tch::manual_seed(1);
        let xs = batch();
        let out = Augmentation::default().apply(&xs);
        assert_eq!(out.size(), xs.size());
        assert!(out.min().double_value(&[]) >= 0.0);
        assert!(out.max().double_value(&[]) <= PIXEL_MAX);
    }

    #[test]
    fn identity_leaves_pixels_untouched() {
        let xs = batch();
        let out = Augmentation::identity().apply(&xs);
        let diff = (out - &xs).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn same_seed_same_perturbation() {
        let xs = batch();
        tch::manual_seed(7);
        let a = Augmentation::default().apply(&xs);
        tch::manual_seed(7);
        let b = Augmentation::default().apply(&xs);
        assert!((a - b).abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn fresh_randomness_per_call() {
        tch::manual_seed(3);
        let xs = batch();
        let aug = Augmentation::default();
        let a = aug.apply(&xs);
        let b = aug.apply(&xs);
        assert!((a - b).abs().max().double_value(&[]) > 1e-3);
    }

    #[test]
    fn brightness_only_shifts_uniformly() {
        tch::manual_seed(5);
        let xs = Tensor::full([2, 3, 4, 4], 100.0, (Kind::Float, tch::Device::Cpu));
        let aug = Augmentation {
            brightness: 0.2,
            ..Augmentation::identity()
        };
        let out = aug.apply(&xs);
        let per_image = out.view([2, -1]);
        let spread = (per_image.max_dim(1, false).0 - per_image.min_dim(1, false).0)
            .abs()
            .max()
            .double_value(&[]);
        assert!(spread < 1e-4);
        assert!((out - &xs).abs().max().double_value(&[]) <= 0.2 * PIXEL_MAX + 1e-3);
    }
}
