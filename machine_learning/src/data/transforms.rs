use rand::Rng;

use crate::{MlErr, Result};

const CIFAR10_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
const CIFAR10_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

const CROP_SCALE: (f64, f64) = (0.08, 1.0);
const CROP_RATIO: (f64, f64) = (3. / 4., 4. / 3.);
const CROP_ATTEMPTS: usize = 10;

/// A `channels×height×width` float image, channel planes stored one after the other.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl Image {
    /// Converts raw bytes to `[0, 1]` intensities.
    pub fn to_tensor(raw: &[u8], channels: usize, height: usize, width: usize) -> Result<Self> {
        let expected = channels * height * width;
        if raw.len() != expected {
            return Err(MlErr::SizeMismatch {
                what: "raw image",
                got: raw.len(),
                expected,
            });
        }

        Ok(Self {
            channels,
            height,
            width,
            data: raw.iter().map(|&p| p as f32 / 255.).collect(),
        })
    }

    #[inline]
    fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    /// Cuts out the `height×width` window whose top left corner is `(top, left)`.
    pub fn crop(&self, top: usize, left: usize, height: usize, width: usize) -> Self {
        let mut data = Vec::with_capacity(self.channels * height * width);
        for c in 0..self.channels {
            for y in top..top + height {
                let row = (c * self.height + y) * self.width;
                data.extend_from_slice(&self.data[row + left..row + left + width]);
            }
        }

        Self {
            channels: self.channels,
            height,
            width,
            data,
        }
    }

    /// Bilinear resampling with half pixel centers.
    pub fn resize(&self, height: usize, width: usize) -> Self {
        if (height, width) == (self.height, self.width) {
            return self.clone();
        }

        let source = |dst: usize, scale: f32, len: usize| -> (usize, usize, f32) {
            let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.);
            let lo = (pos.floor() as usize).min(len - 1);
            let hi = (lo + 1).min(len - 1);
            (lo, hi, pos - lo as f32)
        };

        let sy = self.height as f32 / height as f32;
        let sx = self.width as f32 / width as f32;
        let cols: Vec<_> = (0..width).map(|x| source(x, sx, self.width)).collect();

        let mut data = Vec::with_capacity(self.channels * height * width);
        for c in 0..self.channels {
            for y in 0..height {
                let (y0, y1, wy) = source(y, sy, self.height);
                for &(x0, x1, wx) in &cols {
                    let top = self.at(c, y0, x0) * (1. - wx) + self.at(c, y0, x1) * wx;
                    let bottom = self.at(c, y1, x0) * (1. - wx) + self.at(c, y1, x1) * wx;
                    data.push(top * (1. - wy) + bottom * wy);
                }
            }
        }

        Self {
            channels: self.channels,
            height,
            width,
            data,
        }
    }

    pub fn normalize(&mut self, mean: &[f32], std: &[f32]) {
        let plane = self.height * self.width;
        for (c, values) in self.data.chunks_mut(plane).enumerate() {
            let (m, s) = (mean[c % mean.len()], std[c % std.len()]);
            values.iter_mut().for_each(|v| *v = (*v - m) / s);
        }
    }
}

/// A single augmentation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Resizes the shorter side to `size`, keeping the aspect ratio.
    Resize(usize),
    /// Crops a random area and aspect ratio, then resizes it to `size×size`.
    RandomResizedCrop(usize),
    Normalize { mean: Vec<f32>, std: Vec<f32> },
}

impl Transform {
    pub fn apply<R: Rng + ?Sized>(&self, image: Image, rng: &mut R) -> Image {
        match self {
            Transform::Resize(size) => {
                let (h, w) = (image.height, image.width);
                let (nh, nw) = if h <= w {
                    (*size, (*size * w) / h)
                } else {
                    ((*size * h) / w, *size)
                };
                image.resize(nh, nw)
            }
            Transform::RandomResizedCrop(size) => {
                let (top, left, h, w) = crop_params(image.height, image.width, rng);
                image.crop(top, left, h, w).resize(*size, *size)
            }
            Transform::Normalize { mean, std } => {
                let mut image = image;
                image.normalize(mean, std);
                image
            }
        }
    }
}

/// Picks a crop covering 8% to 100% of the area with an aspect ratio between
/// 3/4 and 4/3, falling back to a centre crop after ten rejected samples.
fn crop_params<R: Rng + ?Sized>(height: usize, width: usize, rng: &mut R) -> (usize, usize, usize, usize) {
    let area = (height * width) as f64;
    let (log_lo, log_hi) = (CROP_RATIO.0.ln(), CROP_RATIO.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.random_range(CROP_SCALE.0..CROP_SCALE.1);
        let aspect = rng.random_range(log_lo..log_hi).exp();

        let w = (target_area * aspect).sqrt().round() as usize;
        let h = (target_area / aspect).sqrt().round() as usize;

        if 0 < w && w <= width && 0 < h && h <= height {
            let top = rng.random_range(0..=height - h);
            let left = rng.random_range(0..=width - w);
            return (top, left, h, w);
        }
    }

    let in_ratio = width as f64 / height as f64;
    let (h, w) = if in_ratio < CROP_RATIO.0 {
        ((width as f64 / CROP_RATIO.0).round() as usize, width)
    } else if in_ratio > CROP_RATIO.1 {
        (height, (height as f64 * CROP_RATIO.1).round() as usize)
    } else {
        (height, width)
    };

    ((height - h) / 2, (width - w) / 2, h, w)
}

/// Raw bytes to a normalized tensor: `ToTensor` followed by the configured steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    channels: usize,
    height: usize,
    width: usize,
    steps: Vec<Transform>,
}

impl Pipeline {
    pub fn new(channels: usize, height: usize, width: usize, steps: Vec<Transform>) -> Self {
        Self {
            channels,
            height,
            width,
            steps,
        }
    }

    /// `ToTensor → RandomResizedCrop(size) → Normalize` over CIFAR-10 images.
    pub fn cifar10_train(size: usize) -> Self {
        Self::new(
            3,
            32,
            32,
            vec![Transform::RandomResizedCrop(size), cifar10_normalize()],
        )
    }

    /// `ToTensor → Resize(size) → Normalize` over CIFAR-10 images.
    pub fn cifar10_test(size: usize) -> Self {
        Self::new(3, 32, 32, vec![Transform::Resize(size), cifar10_normalize()])
    }

    pub fn apply<R: Rng + ?Sized>(&self, raw: &[u8], rng: &mut R) -> Result<Image> {
        let image = Image::to_tensor(raw, self.channels, self.height, self.width)?;
        Ok(self.steps.iter().fold(image, |image, t| t.apply(image, rng)))
    }
}

fn cifar10_normalize() -> Transform {
    Transform::Normalize {
        mean: CIFAR10_MEAN.to_vec(),
        std: CIFAR10_STD.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn ramp(side: usize) -> Image {
        Image {
            channels: 1,
            height: side,
            width: side,
            data: (0..side * side).map(|i| (i % side) as f32).collect(),
        }
    }

    #[test]
    fn to_tensor_scales_bytes() {
        let image = Image::to_tensor(&[0, 51, 255], 3, 1, 1).unwrap();
        assert_eq!(image.data, vec![0., 0.2, 1.]);
        assert!(Image::to_tensor(&[0; 4], 3, 1, 1).is_err());
    }

    #[test]
    fn downscaling_by_two_averages_neighbours() {
        let small = ramp(4).resize(2, 2);
        assert_eq!(small.data, vec![0.5, 2.5, 0.5, 2.5]);
    }

    #[test]
    fn upscaling_keeps_the_borders() {
        let big = ramp(2).resize(4, 4);
        assert_eq!(&big.data[..4], &[0., 0.25, 0.75, 1.]);
    }

    #[test]
    fn crops_stay_inside_the_image() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let (top, left, h, w) = crop_params(32, 32, &mut rng);
            assert!(h > 0 && w > 0);
            assert!(top + h <= 32 && left + w <= 32);
        }

        assert_eq!(crop_params(10, 40, &mut StepRejecter), (0, 13, 10, 13));
    }

    #[test]
    fn pipelines_produce_the_requested_size() {
        let mut rng = StdRng::seed_from_u64(9);
        let raw = vec![128; 3 * 32 * 32];

        let train = Pipeline::cifar10_train(16).apply(&raw, &mut rng).unwrap();
        assert_eq!((train.height, train.width, train.data.len()), (16, 16, 768));

        let test = Pipeline::cifar10_test(32).apply(&raw, &mut rng).unwrap();
        let expected = (128. / 255. - 0.4914) / 0.2023;
        assert!((test.data[0] - expected).abs() < 1e-5);
    }

    /// Always samples the largest area and ratio, so no crop fits a wide image.
    struct StepRejecter;

    impl rand::RngCore for StepRejecter {
        fn next_u32(&mut self) -> u32 {
            u32::MAX
        }

        fn next_u64(&mut self) -> u64 {
            u64::MAX
        }

        fn fill_bytes(&mut self, dst: &mut [u8]) {
            dst.fill(u8::MAX);
        }
    }
}
