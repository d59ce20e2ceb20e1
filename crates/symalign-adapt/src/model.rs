//! Frozen backbone interface and a reference per-pixel backbone
//!
//! The engine never owns a mutable handle on backbone weights: a [`Backbone`]
//! is only ever borrowed immutably, and its backward pass returns gradients
//! for the [`AdapterSet`] alone. That split is what keeps every non-adapter
//! parameter frozen.

use crate::adapter::{AdapterSet, ParamMap};
use crate::views::ProbabilityMap;
use crate::{AdaptError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Shape of a weight matrix eligible for adapter injection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerShape {
    /// Layer name
    pub name: String,
    /// Input dimension
    pub in_dim: usize,
    /// Output dimension
    pub out_dim: usize,
}

impl LayerShape {
    /// Create a layer shape
    pub fn new(name: impl Into<String>, in_dim: usize, out_dim: usize) -> Self {
        Self {
            name: name.into(),
            in_dim,
            out_dim,
        }
    }
}

/// Image in height x width x channels layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl Image {
    /// Create an image, checking the buffer length
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != height * width * channels {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![height, width, channels],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    /// Channel values of one pixel
    pub fn pixel(&self, index: usize) -> &[f32] {
        &self.data[index * self.channels..(index + 1) * self.channels]
    }

    /// Number of pixels
    pub fn num_pixels(&self) -> usize {
        self.height * self.width
    }
}

/// Frozen segmentation model producing a per-pixel foreground probability
pub trait Backbone {
    /// Activations kept from the forward pass for the backward pass
    type Cache;

    /// Weight matrices eligible for adapter injection, in graph order
    fn layers(&self) -> Vec<LayerShape>;

    /// Total (frozen) parameter count
    fn total_params(&self) -> usize;

    /// Forward pass through the frozen weights and the given adapters
    fn forward(&self, image: &Image, adapters: &AdapterSet) -> Result<(ProbabilityMap, Self::Cache)>;

    /// Gradients of the loss w.r.t. adapter parameters, given `dL/dp` per pixel
    fn backward(
        &self,
        cache: &Self::Cache,
        grad_probs: &[f32],
        adapters: &AdapterSet,
    ) -> Result<ParamMap>;
}

/// A frozen dense layer (`out_dim x in_dim` row-major weights)
#[derive(Debug, Clone)]
pub struct FrozenLinear {
    pub shape: LayerShape,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl FrozenLinear {
    /// Create a layer from explicit weights
    pub fn new(shape: LayerShape, weights: Vec<f32>, bias: Vec<f32>) -> Result<Self> {
        if weights.len() != shape.in_dim * shape.out_dim || bias.len() != shape.out_dim {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![shape.out_dim, shape.in_dim],
                got: vec![bias.len(), weights.len()],
            });
        }
        Ok(Self {
            shape,
            weights,
            bias,
        })
    }

    fn apply(&self, x: &[f32]) -> Vec<f32> {
        let in_dim = self.shape.in_dim;
        (0..self.shape.out_dim)
            .map(|o| {
                let row = &self.weights[o * in_dim..(o + 1) * in_dim];
                row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f32>() + self.bias[o]
            })
            .collect()
    }

    fn apply_transpose(&self, grad: &[f32]) -> Vec<f32> {
        let in_dim = self.shape.in_dim;
        let mut out = vec![0.0; in_dim];
        for (o, g) in grad.iter().enumerate() {
            let row = &self.weights[o * in_dim..(o + 1) * in_dim];
            for (oi, w) in out.iter_mut().zip(row) {
                *oi += w * g;
            }
        }
        out
    }

    fn num_params(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

/// Per-pixel MLP head: ReLU between layers, sigmoid on the single output
#[derive(Debug, Clone)]
pub struct LinearBackbone {
    layers: Vec<FrozenLinear>,
}

/// Forward activations of [`LinearBackbone`], per pixel and layer
#[derive(Debug, Clone)]
pub struct LinearCache {
    inputs: Vec<Vec<Vec<f32>>>,
    bases: Vec<Vec<Vec<f32>>>,
    outputs: Vec<Vec<Vec<f32>>>,
    probs: Vec<f32>,
}

impl LinearBackbone {
    /// Seeded random backbone with layer widths `dims = [channels, hidden.., 1]`
    pub fn seeded(dims: &[usize], seed: u64) -> Result<Self> {
        if dims.len() < 2 || dims.iter().any(|&d| d == 0) {
            return Err(AdaptError::config("backbone needs at least two non-zero widths"));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let (in_dim, out_dim) = (w[0], w[1]);
                let bound = 1.0 / (in_dim as f32).sqrt();
                let weights = (0..in_dim * out_dim)
                    .map(|_| rng.gen::<f32>() * bound * 2.0 - bound)
                    .collect();
                let bias = (0..out_dim).map(|_| rng.gen::<f32>() * 0.2 - 0.1).collect();
                FrozenLinear::new(LayerShape::new(format!("fc{}", i), in_dim, out_dim), weights, bias)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_layers(layers)
    }

    /// Build from explicit layers; widths must chain and end in one output
    pub fn from_layers(layers: Vec<FrozenLinear>) -> Result<Self> {
        let last = layers
            .last()
            .ok_or_else(|| AdaptError::config("backbone has no layers"))?;
        if last.shape.out_dim != 1 {
            return Err(AdaptError::config("backbone must end in a single output"));
        }
        for pair in layers.windows(2) {
            if pair[0].shape.out_dim != pair[1].shape.in_dim {
                return Err(AdaptError::ShapeMismatch {
                    expected: vec![pair[0].shape.out_dim],
                    got: vec![pair[1].shape.in_dim],
                });
            }
        }
        Ok(Self { layers })
    }

    fn input_channels(&self) -> usize {
        self.layers[0].shape.in_dim
    }
}

impl Backbone for LinearBackbone {
    type Cache = LinearCache;

    fn layers(&self) -> Vec<LayerShape> {
        self.layers.iter().map(|l| l.shape.clone()).collect()
    }

    fn total_params(&self) -> usize {
        self.layers.iter().map(|l| l.num_params()).sum()
    }

    fn forward(&self, image: &Image, adapters: &AdapterSet) -> Result<(ProbabilityMap, LinearCache)> {
        if image.channels != self.input_channels() {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![self.input_channels()],
                got: vec![image.channels],
            });
        }

        let n = image.num_pixels();
        let depth = self.layers.len();
        let mut cache = LinearCache {
            inputs: Vec::with_capacity(n),
            bases: Vec::with_capacity(n),
            outputs: Vec::with_capacity(n),
            probs: Vec::with_capacity(n),
        };

        for px in 0..n {
            let mut x = image.pixel(px).to_vec();
            let mut inputs = Vec::with_capacity(depth);
            let mut bases = Vec::with_capacity(depth);
            let mut outputs = Vec::with_capacity(depth);

            for (l, layer) in self.layers.iter().enumerate() {
                let base = layer.apply(&x);
                let y = match adapters.get(&layer.shape.name) {
                    Some(adapter) => adapter.forward(&x, &base)?,
                    None => base.clone(),
                };
                let next = if l + 1 < depth {
                    y.iter().map(|v| v.max(0.0)).collect()
                } else {
                    y.clone()
                };
                inputs.push(std::mem::replace(&mut x, next));
                bases.push(base);
                outputs.push(y);
            }

            cache.probs.push(sigmoid(x[0]));
            cache.inputs.push(inputs);
            cache.bases.push(bases);
            cache.outputs.push(outputs);
        }

        let map = ProbabilityMap::new(image.height, image.width, cache.probs.clone())?;
        Ok((map, cache))
    }

    fn backward(
        &self,
        cache: &LinearCache,
        grad_probs: &[f32],
        adapters: &AdapterSet,
    ) -> Result<ParamMap> {
        if grad_probs.len() != cache.probs.len() {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![cache.probs.len()],
                got: vec![grad_probs.len()],
            });
        }

        let mut grads = adapters.zero_grads();
        let depth = self.layers.len();

        for (px, &gp) in grad_probs.iter().enumerate() {
            if gp == 0.0 {
                continue;
            }
            let p = cache.probs[px];
            let mut grad = vec![gp * p * (1.0 - p)];

            for l in (0..depth).rev() {
                let layer = &self.layers[l];
                if l + 1 < depth {
                    for (g, y) in grad.iter_mut().zip(&cache.outputs[px][l]) {
                        if *y <= 0.0 {
                            *g = 0.0;
                        }
                    }
                }

                let x = &cache.inputs[px][l];
                let (grad_base, extra) = match (
                    adapters.get(&layer.shape.name),
                    grads.get_mut(&layer.shape.name),
                ) {
                    (Some(adapter), Some(buf)) => {
                        adapter.backward(x, &cache.bases[px][l], &grad, buf)?
                    }
                    _ => (grad, vec![0.0; layer.shape.in_dim]),
                };

                if l == 0 {
                    break;
                }
                grad = layer
                    .apply_transpose(&grad_base)
                    .iter()
                    .zip(&extra)
                    .map(|(g, e)| g + e)
                    .collect();
            }
        }

        Ok(grads)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterKind, AdapterSpec};

    fn image(seed: u64) -> Image {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..4 * 4 * 3).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
        Image::new(4, 4, 3, data).unwrap()
    }

    #[test]
    fn test_total_params() {
        let model = LinearBackbone::seeded(&[3, 8, 1], 0).unwrap();
        assert_eq!(model.total_params(), 3 * 8 + 8 + 8 + 1);
        assert_eq!(model.layers().len(), 2);
    }

    #[test]
    fn test_output_shape_unchanged_by_adapters() {
        let model = LinearBackbone::seeded(&[3, 8, 1], 0).unwrap();
        let img = image(1);
        let (plain, _) = model.forward(&img, &AdapterSet::new()).unwrap();

        let spec = AdapterSpec::new(
            AdapterKind::LowRank { rank: 2, alpha: 2.0 },
            vec!["fc0".into(), "fc1".into()],
        );
        let adapters = AdapterSet::inject(&model.layers(), &spec, 9).unwrap();
        let (adapted, _) = model.forward(&img, &adapters).unwrap();

        assert_eq!(plain.data.len(), adapted.data.len());
        assert_eq!((plain.height, plain.width), (adapted.height, adapted.width));
        // B starts at zero, so predictions are identical
        for (a, b) in plain.data.iter().zip(&adapted.data) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let model = LinearBackbone::seeded(&[3, 6, 1], 4).unwrap();
        let img = image(2);
        let spec = AdapterSpec::new(AdapterKind::AffineOnly, vec!["fc0".into(), "fc1".into()]);
        let mut adapters = AdapterSet::inject(&model.layers(), &spec, 0).unwrap();
        let mut params = adapters.params();
        for values in params.values_mut() {
            for (i, v) in values.iter_mut().enumerate() {
                *v = 0.05 * (i as f32 % 3.0) - 0.05;
            }
        }
        adapters.set_params(&params).unwrap();

        // loss = sum of probabilities
        let loss = |a: &AdapterSet| -> f32 { model.forward(&img, a).unwrap().0.data.iter().sum() };
        let (_, cache) = model.forward(&img, &adapters).unwrap();
        let grads = model.backward(&cache, &vec![1.0; 16], &adapters).unwrap();

        let eps = 1e-2;
        for (name, values) in &params {
            for i in [0, values.len() - 1] {
                let mut bumped = params.clone();
                bumped.get_mut(name).unwrap()[i] += eps;
                let mut up = adapters.clone();
                up.set_params(&bumped).unwrap();
                let fd = (loss(&up) - loss(&adapters)) / eps;
                let analytic = grads[name][i];
                assert!(
                    (fd - analytic).abs() < 2e-2 + 0.1 * analytic.abs(),
                    "{}[{}]: fd={} analytic={}",
                    name,
                    i,
                    fd,
                    analytic
                );
            }
        }
    }

    #[test]
    fn test_channel_mismatch() {
        let model = LinearBackbone::seeded(&[2, 4, 1], 0).unwrap();
        assert!(model.forward(&image(0), &AdapterSet::new()).is_err());
    }
}
