//! Trainable adapters injected around frozen weight matrices

use crate::model::LayerShape;
use crate::{AdaptError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat parameter (or gradient) vectors keyed by layer name
pub type ParamMap = BTreeMap<String, Vec<f32>>;

/// Adapter kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterKind {
    /// Low-rank delta `scaling * A B` (LoRA)
    LowRank { rank: usize, alpha: f32 },
    /// Dense delta on a fixed, evenly strided subset of output rows
    StructuredSparse { rows: usize },
    /// Per-output scale and shift applied after the frozen layer
    AffineOnly,
}

impl AdapterKind {
    /// Trainable parameters this kind adds to a layer
    pub fn cost(&self, in_dim: usize, out_dim: usize) -> usize {
        match *self {
            AdapterKind::LowRank { rank, .. } => rank * (in_dim + out_dim),
            AdapterKind::StructuredSparse { rows } => rows.min(out_dim) * in_dim,
            AdapterKind::AffineOnly => 2 * out_dim,
        }
    }

    fn validate(&self, layer: &LayerShape) -> Result<()> {
        match *self {
            AdapterKind::LowRank { rank, alpha } => {
                if rank == 0 {
                    return Err(AdaptError::config("low-rank adapter rank must be >= 1"));
                }
                if !alpha.is_finite() || alpha <= 0.0 {
                    return Err(AdaptError::config("low-rank alpha must be positive"));
                }
            }
            AdapterKind::StructuredSparse { rows } => {
                if rows == 0 || rows > layer.out_dim {
                    return Err(AdaptError::config(format!(
                        "sparse rows {} out of range for layer '{}' with {} outputs",
                        rows, layer.name, layer.out_dim
                    )));
                }
            }
            AdapterKind::AffineOnly => {}
        }
        Ok(())
    }
}

/// Resolved adapter placement: what kind, on which layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    /// Adapter kind and size
    pub kind: AdapterKind,
    /// Exact names of the wrapped layers
    pub targets: Vec<String>,
}

impl AdapterSpec {
    /// Create a spec
    pub fn new(kind: AdapterKind, targets: Vec<String>) -> Self {
        Self { kind, targets }
    }

    /// Check if a layer is wrapped
    pub fn matches(&self, layer_name: &str) -> bool {
        self.targets.iter().any(|t| t == layer_name)
    }

    /// Trainable parameter count on the given layer graph
    pub fn trainable_params(&self, layers: &[LayerShape]) -> usize {
        layers
            .iter()
            .filter(|l| self.matches(&l.name))
            .map(|l| self.kind.cost(l.in_dim, l.out_dim))
            .sum()
    }
}

/// Trainable parameters of one adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterParams {
    LowRank {
        rank: usize,
        scaling: f32,
        /// A (in_dim x rank)
        a: Vec<f32>,
        /// B (rank x out_dim)
        b: Vec<f32>,
    },
    StructuredSparse {
        /// Output rows carrying a delta
        rows: Vec<usize>,
        /// Delta (rows.len() x in_dim)
        delta: Vec<f32>,
    },
    Affine {
        /// Multiplicative offset, effective scale is `1 + scale`
        scale: Vec<f32>,
        shift: Vec<f32>,
    },
}

/// Adapter wrapping a single frozen layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adapter {
    /// Layer this adapter applies to
    pub layer: String,
    /// Input dimension
    pub in_dim: usize,
    /// Output dimension
    pub out_dim: usize,
    /// Trainable parameters
    pub params: AdapterParams,
}

impl Adapter {
    /// Create an adapter whose initial delta is exactly zero
    pub fn new(layer: &LayerShape, kind: &AdapterKind, rng: &mut StdRng) -> Result<Self> {
        kind.validate(layer)?;
        let (in_dim, out_dim) = (layer.in_dim, layer.out_dim);

        let params = match *kind {
            AdapterKind::LowRank { rank, alpha } => {
                // A random, B zero: the wrapped layer starts identical to the frozen one
                let bound = 1.0 / (in_dim as f32).sqrt();
                let a = (0..in_dim * rank)
                    .map(|_| rng.gen::<f32>() * bound * 2.0 - bound)
                    .collect();
                AdapterParams::LowRank {
                    rank,
                    scaling: alpha / rank as f32,
                    a,
                    b: vec![0.0; rank * out_dim],
                }
            }
            AdapterKind::StructuredSparse { rows } => {
                let rows: Vec<usize> = (0..rows).map(|j| j * out_dim / rows).collect();
                AdapterParams::StructuredSparse {
                    delta: vec![0.0; rows.len() * in_dim],
                    rows,
                }
            }
            AdapterKind::AffineOnly => AdapterParams::Affine {
                scale: vec![0.0; out_dim],
                shift: vec![0.0; out_dim],
            },
        };

        Ok(Self {
            layer: layer.name.clone(),
            in_dim,
            out_dim,
            params,
        })
    }

    /// Number of trainable parameters
    pub fn num_params(&self) -> usize {
        match &self.params {
            AdapterParams::LowRank { a, b, .. } => a.len() + b.len(),
            AdapterParams::StructuredSparse { delta, .. } => delta.len(),
            AdapterParams::Affine { scale, shift } => scale.len() + shift.len(),
        }
    }

    /// Apply the adapter to a frozen layer output `base = W x + bias`
    pub fn forward(&self, x: &[f32], base: &[f32]) -> Result<Vec<f32>> {
        self.check_shapes(x, base)?;
        let mut y = base.to_vec();

        match &self.params {
            AdapterParams::LowRank { rank, scaling, a, b } => {
                let ax = self.project_a(x, *rank, a);
                for (o, yo) in y.iter_mut().enumerate() {
                    let mut acc = 0.0;
                    for r in 0..*rank {
                        acc += b[r * self.out_dim + o] * ax[r];
                    }
                    *yo += acc * scaling;
                }
            }
            AdapterParams::StructuredSparse { rows, delta } => {
                for (j, &row) in rows.iter().enumerate() {
                    let d = &delta[j * self.in_dim..(j + 1) * self.in_dim];
                    y[row] += d.iter().zip(x).map(|(w, xi)| w * xi).sum::<f32>();
                }
            }
            AdapterParams::Affine { scale, shift } => {
                for ((yo, s), t) in y.iter_mut().zip(scale).zip(shift) {
                    *yo = *yo * (1.0 + s) + t;
                }
            }
        }

        Ok(y)
    }

    /// Backward through the adapter.
    ///
    /// Accumulates parameter gradients into `grad_params` (flat layout, see
    /// [`Adapter::flat_params`]) and returns `(grad_base, grad_x_extra)`: the
    /// gradient flowing into the frozen output and the extra input gradient
    /// contributed by the delta path.
    pub fn backward(
        &self,
        x: &[f32],
        base: &[f32],
        grad_out: &[f32],
        grad_params: &mut [f32],
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        self.check_shapes(x, base)?;
        if grad_out.len() != self.out_dim || grad_params.len() != self.num_params() {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![self.out_dim, self.num_params()],
                got: vec![grad_out.len(), grad_params.len()],
            });
        }

        let mut grad_x = vec![0.0; self.in_dim];
        match &self.params {
            AdapterParams::LowRank { rank, scaling, a, b } => {
                let rank = *rank;
                let ax = self.project_a(x, rank, a);
                let (grad_a, grad_b) = grad_params.split_at_mut(a.len());

                let mut grad_ax = vec![0.0; rank];
                for r in 0..rank {
                    for o in 0..self.out_dim {
                        grad_b[r * self.out_dim + o] += scaling * ax[r] * grad_out[o];
                        grad_ax[r] += scaling * b[r * self.out_dim + o] * grad_out[o];
                    }
                }
                for i in 0..self.in_dim {
                    for r in 0..rank {
                        grad_a[i * rank + r] += x[i] * grad_ax[r];
                        grad_x[i] += a[i * rank + r] * grad_ax[r];
                    }
                }
                Ok((grad_out.to_vec(), grad_x))
            }
            AdapterParams::StructuredSparse { rows, delta } => {
                for (j, &row) in rows.iter().enumerate() {
                    let g = grad_out[row];
                    for i in 0..self.in_dim {
                        grad_params[j * self.in_dim + i] += g * x[i];
                        grad_x[i] += delta[j * self.in_dim + i] * g;
                    }
                }
                Ok((grad_out.to_vec(), grad_x))
            }
            AdapterParams::Affine { scale, .. } => {
                let (grad_scale, grad_shift) = grad_params.split_at_mut(self.out_dim);
                let mut grad_base = vec![0.0; self.out_dim];
                for o in 0..self.out_dim {
                    grad_scale[o] += grad_out[o] * base[o];
                    grad_shift[o] += grad_out[o];
                    grad_base[o] = grad_out[o] * (1.0 + scale[o]);
                }
                Ok((grad_base, grad_x))
            }
        }
    }

    /// Parameters as one flat vector
    pub fn flat_params(&self) -> Vec<f32> {
        match &self.params {
            AdapterParams::LowRank { a, b, .. } => a.iter().chain(b).copied().collect(),
            AdapterParams::StructuredSparse { delta, .. } => delta.clone(),
            AdapterParams::Affine { scale, shift } => scale.iter().chain(shift).copied().collect(),
        }
    }

    /// Overwrite parameters from a flat vector
    pub fn set_flat_params(&mut self, flat: &[f32]) -> Result<()> {
        if flat.len() != self.num_params() {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![self.num_params()],
                got: vec![flat.len()],
            });
        }
        match &mut self.params {
            AdapterParams::LowRank { a, b, .. } => {
                let (fa, fb) = flat.split_at(a.len());
                a.copy_from_slice(fa);
                b.copy_from_slice(fb);
            }
            AdapterParams::StructuredSparse { delta, .. } => delta.copy_from_slice(flat),
            AdapterParams::Affine { scale, shift } => {
                let (fs, ft) = flat.split_at(scale.len());
                scale.copy_from_slice(fs);
                shift.copy_from_slice(ft);
            }
        }
        Ok(())
    }

    fn project_a(&self, x: &[f32], rank: usize, a: &[f32]) -> Vec<f32> {
        let mut ax = vec![0.0; rank];
        for (i, xi) in x.iter().enumerate() {
            for r in 0..rank {
                ax[r] += a[i * rank + r] * xi;
            }
        }
        ax
    }

    fn check_shapes(&self, x: &[f32], base: &[f32]) -> Result<()> {
        if x.len() != self.in_dim || base.len() != self.out_dim {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![self.in_dim, self.out_dim],
                got: vec![x.len(), base.len()],
            });
        }
        Ok(())
    }
}

/// The trainable side of an adapted model: one adapter per wrapped layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterSet {
    adapters: BTreeMap<String, Adapter>,
}

impl AdapterSet {
    /// Create an empty set (the frozen model unchanged)
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject adapters for every layer named by the spec
    pub fn inject(layers: &[LayerShape], spec: &AdapterSpec, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = Self::new();

        for target in &spec.targets {
            let layer = layers.iter().find(|l| &l.name == target).ok_or_else(|| {
                AdaptError::config(format!("adapter target '{}' not found in model", target))
            })?;
            let adapter = Adapter::new(layer, &spec.kind, &mut rng)?;
            set.adapters.insert(target.clone(), adapter);
        }

        Ok(set)
    }

    /// Get adapter for a layer
    pub fn get(&self, layer: &str) -> Option<&Adapter> {
        self.adapters.get(layer)
    }

    /// Wrapped layer names
    pub fn layers(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }

    /// Total trainable parameters
    pub fn total_params(&self) -> usize {
        self.adapters.values().map(|a| a.num_params()).sum()
    }

    /// Zeroed gradient buffers matching every adapter
    pub fn zero_grads(&self) -> ParamMap {
        self.adapters
            .iter()
            .map(|(name, a)| (name.clone(), vec![0.0; a.num_params()]))
            .collect()
    }

    /// Snapshot of all parameters
    pub fn params(&self) -> ParamMap {
        self.adapters
            .iter()
            .map(|(name, a)| (name.clone(), a.flat_params()))
            .collect()
    }

    /// Overwrite parameters of every adapter named in `params`
    pub fn set_params(&mut self, params: &ParamMap) -> Result<()> {
        for (name, values) in params {
            let adapter = self
                .adapters
                .get_mut(name)
                .ok_or_else(|| AdaptError::Adapter(format!("Adapter '{}' not found", name)))?;
            adapter.set_flat_params(values)?;
        }
        Ok(())
    }

    /// Move parameters towards `student`: `self = decay * self + (1 - decay) * student`
    pub fn ema_towards(&mut self, student: &AdapterSet, decay: f32) -> Result<()> {
        for (name, adapter) in &mut self.adapters {
            let source = student
                .get(name)
                .ok_or_else(|| AdaptError::Adapter(format!("Adapter '{}' not found", name)))?;
            let blended: Vec<f32> = adapter
                .flat_params()
                .iter()
                .zip(source.flat_params())
                .map(|(t, s)| decay * t + (1.0 - decay) * s)
                .collect();
            adapter.set_flat_params(&blended)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str, in_dim: usize, out_dim: usize) -> LayerShape {
        LayerShape::new(name, in_dim, out_dim)
    }

    #[test]
    fn test_kind_cost() {
        assert_eq!(AdapterKind::LowRank { rank: 4, alpha: 4.0 }.cost(32, 16), 4 * 48);
        assert_eq!(AdapterKind::StructuredSparse { rows: 3 }.cost(32, 16), 96);
        assert_eq!(AdapterKind::StructuredSparse { rows: 99 }.cost(32, 16), 16 * 32);
        assert_eq!(AdapterKind::AffineOnly.cost(32, 16), 32);
    }

    #[test]
    fn test_fresh_adapters_are_identity() {
        let shape = layer("head.fc1", 4, 3);
        let x = [0.5, -1.0, 2.0, 0.25];
        let base = [1.0, -2.0, 0.5];
        let mut rng = StdRng::seed_from_u64(7);

        for kind in [
            AdapterKind::LowRank { rank: 2, alpha: 2.0 },
            AdapterKind::StructuredSparse { rows: 2 },
            AdapterKind::AffineOnly,
        ] {
            let adapter = Adapter::new(&shape, &kind, &mut rng).unwrap();
            assert_eq!(adapter.forward(&x, &base).unwrap(), base.to_vec());
            assert_eq!(adapter.num_params(), kind.cost(4, 3));
        }
    }

    #[test]
    fn test_affine_backward_finite_difference() {
        let shape = layer("fc", 2, 2);
        let mut rng = StdRng::seed_from_u64(3);
        let mut adapter = Adapter::new(&shape, &AdapterKind::AffineOnly, &mut rng).unwrap();
        adapter.set_flat_params(&[0.1, -0.2, 0.3, 0.05]).unwrap();

        let x = [1.0, 1.0];
        let base = [0.5, -1.5];
        // loss = sum(y)
        let mut grads = vec![0.0; 4];
        adapter.backward(&x, &base, &[1.0, 1.0], &mut grads).unwrap();

        let eps = 1e-3;
        for p in 0..4 {
            let mut flat = adapter.flat_params();
            flat[p] += eps;
            let mut bumped = adapter.clone();
            bumped.set_flat_params(&flat).unwrap();
            let up: f32 = bumped.forward(&x, &base).unwrap().iter().sum();
            let down: f32 = adapter.forward(&x, &base).unwrap().iter().sum();
            assert!(((up - down) / eps - grads[p]).abs() < 1e-2);
        }
    }

    #[test]
    fn test_inject_and_missing_target() {
        let layers = vec![layer("fc1", 8, 4), layer("fc2", 4, 1)];
        let spec = AdapterSpec::new(AdapterKind::AffineOnly, vec!["fc1".into()]);
        let set = AdapterSet::inject(&layers, &spec, 0).unwrap();
        assert_eq!(set.layers(), vec!["fc1"]);
        assert_eq!(set.total_params(), spec.trainable_params(&layers));

        let bad = AdapterSpec::new(AdapterKind::AffineOnly, vec!["fc9".into()]);
        assert!(matches!(
            AdapterSet::inject(&layers, &bad, 0),
            Err(AdaptError::Configuration(_))
        ));
    }

    #[test]
    fn test_sparse_rows_out_of_range() {
        let shape = layer("fc", 4, 2);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Adapter::new(&shape, &AdapterKind::StructuredSparse { rows: 3 }, &mut rng).is_err());
    }

    #[test]
    fn test_ema_towards() {
        let layers = vec![layer("fc", 2, 1)];
        let spec = AdapterSpec::new(AdapterKind::AffineOnly, vec!["fc".into()]);
        let mut teacher = AdapterSet::inject(&layers, &spec, 0).unwrap();
        let mut student = teacher.clone();
        let mut params = ParamMap::new();
        params.insert("fc".into(), vec![1.0, 1.0]);
        student.set_params(&params).unwrap();

        teacher.ema_towards(&student, 0.9).unwrap();
        let got = teacher.params();
        assert!((got["fc"][0] - 0.1).abs() < 1e-6);
    }
}
