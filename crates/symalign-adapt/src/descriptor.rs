//! Structural descriptors and the frozen encoder interface

use crate::model::Image;
use crate::views::PredictionView;
use crate::{AdaptError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Fixed-length structural summary of a prediction view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor(pub Vec<f32>);

impl Descriptor {
    /// Dimensionality
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Values
    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// True when every component is finite
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Frozen, deterministic descriptor model
pub trait DescriptorEncoder {
    /// Descriptor dimensionality `k`
    fn dim(&self) -> usize;

    /// Encode a view of the prediction for `image`; pure and deterministic
    fn encode(&self, view: &PredictionView, image: &Image) -> Result<Descriptor>;

    /// Vector-Jacobian product: gradient w.r.t. `view.primary` given `dL/dd`
    fn backward(&self, view: &PredictionView, image: &Image, grad: &[f32]) -> Result<Vec<f32>>;
}

/// Which embedding the encoder emits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderOutput {
    /// Mask channels only
    Mask,
    /// Image gated by the view's primary channel
    Image,
    /// Both, projected jointly
    #[default]
    Fused,
}

/// Grid average pooling followed by a fixed projection.
///
/// Mask features pool both view channels; image features pool pixel
/// luminance gated by `clamp(primary, 0, 1)`. Both are linear in `primary`
/// inside the unit interval, so the backward pass is exact there.
#[derive(Debug, Clone)]
pub struct ProjectionEncoder {
    dim: usize,
    grid: usize,
    output: EncoderOutput,
    /// dim x features
    projection: Vec<f32>,
}

impl ProjectionEncoder {
    /// Seeded fused encoder pooling to a `grid x grid` layout
    pub fn seeded(dim: usize, grid: usize, seed: u64) -> Result<Self> {
        Self::new(dim, grid, EncoderOutput::default(), seed)
    }

    /// Seeded encoder with an explicit output
    pub fn new(dim: usize, grid: usize, output: EncoderOutput, seed: u64) -> Result<Self> {
        if dim == 0 || grid == 0 {
            return Err(AdaptError::config("encoder dim and grid must be >= 1"));
        }
        let features = Self::feature_count(grid, output);
        let scale = 1.0 / (features as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let projection = (0..dim * features)
            .map(|_| (rng.gen::<f32>() * 2.0 - 1.0) * scale)
            .collect();
        Ok(Self {
            dim,
            grid,
            output,
            projection,
        })
    }

    /// Emitted embedding
    pub fn output(&self) -> EncoderOutput {
        self.output
    }

    fn feature_count(grid: usize, output: EncoderOutput) -> usize {
        let cells = grid * grid;
        match output {
            EncoderOutput::Mask => 2 * cells,
            EncoderOutput::Image => cells,
            EncoderOutput::Fused => 3 * cells,
        }
    }

    fn features(&self) -> usize {
        Self::feature_count(self.grid, self.output)
    }

    /// Offsets of the mask and image blocks within the feature vector
    fn blocks(&self) -> (Option<usize>, Option<usize>) {
        let cells = self.grid * self.grid;
        match self.output {
            EncoderOutput::Mask => (Some(0), None),
            EncoderOutput::Image => (None, Some(0)),
            EncoderOutput::Fused => (Some(0), Some(2 * cells)),
        }
    }

    fn cell_of(&self, view: &PredictionView, index: usize) -> usize {
        let (y, x) = (index / view.width, index % view.width);
        let cy = y * self.grid / view.height;
        let cx = x * self.grid / view.width;
        cy * self.grid + cx
    }

    fn cell_sizes(&self, view: &PredictionView) -> Vec<f32> {
        let mut sizes = vec![0.0; self.grid * self.grid];
        for i in 0..view.primary.len() {
            sizes[self.cell_of(view, i)] += 1.0;
        }
        sizes
    }

    fn check(&self, view: &PredictionView, image: &Image) -> Result<()> {
        let n = view.height * view.width;
        if view.primary.len() != n || view.band.len() != n || view.height < self.grid || view.width < self.grid
        {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![view.height.max(self.grid), view.width.max(self.grid)],
                got: vec![view.primary.len(), view.band.len()],
            });
        }
        if image.height != view.height || image.width != view.width {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![view.height, view.width],
                got: vec![image.height, image.width],
            });
        }
        Ok(())
    }
}

fn luminance(image: &Image, index: usize) -> f32 {
    let pixel = image.pixel(index);
    if pixel.is_empty() {
        return 0.0;
    }
    pixel.iter().sum::<f32>() / pixel.len() as f32
}

impl DescriptorEncoder for ProjectionEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn encode(&self, view: &PredictionView, image: &Image) -> Result<Descriptor> {
        self.check(view, image)?;
        let cells = self.grid * self.grid;
        let sizes = self.cell_sizes(view);
        let (mask_at, image_at) = self.blocks();

        let features = self.features();
        let mut pooled = vec![0.0; features];
        for (i, (p, b)) in view.primary.iter().zip(&view.band).enumerate() {
            let c = self.cell_of(view, i);
            if let Some(at) = mask_at {
                pooled[at + c] += p / sizes[c];
                pooled[at + cells + c] += b / sizes[c];
            }
            if let Some(at) = image_at {
                pooled[at + c] += luminance(image, i) * p.clamp(0.0, 1.0) / sizes[c];
            }
        }

        let values = (0..self.dim)
            .map(|k| {
                let row = &self.projection[k * features..(k + 1) * features];
                row.iter().zip(&pooled).map(|(w, f)| w * f).sum()
            })
            .collect();
        Ok(Descriptor(values))
    }

    fn backward(&self, view: &PredictionView, image: &Image, grad: &[f32]) -> Result<Vec<f32>> {
        self.check(view, image)?;
        if grad.len() != self.dim {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![self.dim],
                got: vec![grad.len()],
            });
        }
        let features = self.features();
        let sizes = self.cell_sizes(view);
        let (mask_at, image_at) = self.blocks();

        let mut grad_pooled = vec![0.0; features];
        for (k, g) in grad.iter().enumerate() {
            let row = &self.projection[k * features..(k + 1) * features];
            for (gp, w) in grad_pooled.iter_mut().zip(row) {
                *gp += g * w;
            }
        }

        // The band half of the mask block is constant
        Ok(view
            .primary
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let c = self.cell_of(view, i);
                let mut g = 0.0;
                if let Some(at) = mask_at {
                    g += grad_pooled[at + c];
                }
                if let Some(at) = image_at {
                    if (0.0..=1.0).contains(p) {
                        g += grad_pooled[at + c] * luminance(image, i);
                    }
                }
                g / sizes[c]
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::{BoundaryView, ProbabilityMap, Scale};

    fn view(h: usize, w: usize) -> PredictionView {
        let data = (0..h * w).map(|i| (i as f32 * 0.37).sin() * 0.5 + 0.5).collect();
        let map = ProbabilityMap::new(h, w, data).unwrap();
        PredictionView::pair(&map, 1, BoundaryView::default()).0
    }

    fn image(h: usize, w: usize) -> Image {
        let data = (0..h * w * 3).map(|i| (i as f32 * 0.11).cos() * 0.5 + 0.5).collect();
        Image::new(h, w, 3, data).unwrap()
    }

    #[test]
    fn test_encode_deterministic() {
        let enc = ProjectionEncoder::seeded(4, 2, 11).unwrap();
        let (v, img) = (view(6, 6), image(6, 6));
        let a = enc.encode(&v, &img).unwrap();
        let b = ProjectionEncoder::seeded(4, 2, 11).unwrap().encode(&v, &img).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), 4);
        assert!(a.is_finite());
    }

    #[test]
    fn test_backward_is_exact() {
        let (v, img) = (view(5, 7), image(5, 7));
        let grad = [1.0, -0.5, 0.25];
        for output in [EncoderOutput::Mask, EncoderOutput::Image, EncoderOutput::Fused] {
            let enc = ProjectionEncoder::new(3, 2, output, 5).unwrap();
            let analytic = enc.backward(&v, &img, &grad).unwrap();

            let objective = |view: &PredictionView| -> f32 {
                let d = enc.encode(view, &img).unwrap();
                d.values().iter().zip(&grad).map(|(a, b)| a * b).sum()
            };
            let base = objective(&v);
            for i in [0, 17, 34] {
                let mut bumped = v.clone();
                bumped.primary[i] += 1e-2;
                let fd = (objective(&bumped) - base) / 1e-2;
                assert!((fd - analytic[i]).abs() < 1e-3, "{:?} at {}", output, i);
            }
        }
    }

    #[test]
    fn test_image_conditions_descriptor() {
        let v = view(6, 6);
        let bright = Image::new(6, 6, 1, vec![1.0; 36]).unwrap();
        let dark = Image::new(6, 6, 1, vec![0.0; 36]).unwrap();

        let mask_only = ProjectionEncoder::new(4, 2, EncoderOutput::Mask, 2).unwrap();
        assert_eq!(mask_only.encode(&v, &bright).unwrap(), mask_only.encode(&v, &dark).unwrap());

        let fused = ProjectionEncoder::new(4, 2, EncoderOutput::Fused, 2).unwrap();
        assert_ne!(fused.encode(&v, &bright).unwrap(), fused.encode(&v, &dark).unwrap());

        let image_only = ProjectionEncoder::new(4, 2, EncoderOutput::Image, 2).unwrap();
        assert!(image_only.encode(&v, &dark).unwrap().values().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_rejects_small_views() {
        let enc = ProjectionEncoder::seeded(2, 4, 0).unwrap();
        let v = view(3, 3);
        assert_eq!(v.scale, Scale::Global);
        assert!(enc.encode(&v, &image(3, 3)).is_err());
        assert!(ProjectionEncoder::seeded(2, 1, 0).unwrap().encode(&v, &image(4, 3)).is_err());
    }
}
