//! Probability maps and the structural views derived from them

use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Per-pixel foreground probabilities, row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityMap {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ProbabilityMap {
    /// Create a map, checking the buffer length
    pub fn new(height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != height * width || data.is_empty() {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![height, width],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    /// Mean distance from 0.5, scaled to [0, 1]
    pub fn mean_confidence(&self) -> f32 {
        let total: f32 = self.data.iter().map(|p| (p - 0.5).abs() * 2.0).sum();
        total / self.data.len() as f32
    }

    /// Thresholded foreground mask (`p > 0.5`)
    pub fn binary(&self) -> Vec<bool> {
        self.data.iter().map(|&p| p > 0.5).collect()
    }

    /// Fraction of pixels predicted as foreground
    pub fn foreground_fraction(&self) -> f32 {
        let fg = self.data.iter().filter(|&&p| p > 0.5).count();
        fg as f32 / self.data.len() as f32
    }

    /// Mean per-pixel binary entropy in nats
    pub fn mean_entropy(&self) -> f32 {
        let total: f32 = self
            .data
            .iter()
            .map(|&p| {
                let q = p.clamp(1e-6, 1.0 - 1e-6);
                -(q * q.ln() + (1.0 - q) * (1.0 - q).ln())
            })
            .sum();
        total / self.data.len() as f32
    }
}

/// Number of 4-connected foreground components
pub fn component_count(mask: &[bool], height: usize, width: usize) -> usize {
    let mut seen = vec![false; mask.len()];
    let mut queue = VecDeque::new();
    let mut count = 0;

    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        count += 1;
        seen[start] = true;
        queue.push_back(start);

        while let Some(idx) = queue.pop_front() {
            let (y, x) = (idx / width, idx % width);
            let mut visit = |ny: usize, nx: usize| {
                let n = ny * width + nx;
                if mask[n] && !seen[n] {
                    seen[n] = true;
                    queue.push_back(n);
                }
            };
            if y > 0 {
                visit(y - 1, x);
            }
            if y + 1 < height {
                visit(y + 1, x);
            }
            if x > 0 {
                visit(y, x - 1);
            }
            if x + 1 < width {
                visit(y, x + 1);
            }
        }
    }

    count
}

/// Foreground edges (to background or image border) divided by foreground area
pub fn boundary_to_area_ratio(mask: &[bool], height: usize, width: usize) -> f32 {
    let area = mask.iter().filter(|&&m| m).count();
    if area == 0 {
        return 0.0;
    }

    let at = |y: isize, x: isize| -> bool {
        y >= 0
            && x >= 0
            && (y as usize) < height
            && (x as usize) < width
            && mask[y as usize * width + x as usize]
    };

    let mut edges = 0usize;
    for y in 0..height as isize {
        for x in 0..width as isize {
            if !at(y, x) {
                continue;
            }
            for (dy, dx) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                if !at(y + dy, x + dx) {
                    edges += 1;
                }
            }
        }
    }

    edges as f32 / area as f32
}

/// Band of pixels within `width` (Chebyshev) of a foreground/background change
pub fn boundary_band(mask: &[bool], height: usize, width: usize, band: usize) -> Vec<bool> {
    // Pixels whose 4-neighbourhood contains the other label
    let mut edge = vec![false; mask.len()];
    for y in 0..height {
        for x in 0..width {
            let v = mask[y * width + x];
            let differs = (y > 0 && mask[(y - 1) * width + x] != v)
                || (y + 1 < height && mask[(y + 1) * width + x] != v)
                || (x > 0 && mask[y * width + x - 1] != v)
                || (x + 1 < width && mask[y * width + x + 1] != v);
            edge[y * width + x] = differs;
        }
    }

    if band <= 1 {
        return edge;
    }

    let reach = band - 1;
    let mut out = vec![false; mask.len()];
    for y in 0..height {
        for x in 0..width {
            if !edge[y * width + x] {
                continue;
            }
            let (y0, y1) = (y.saturating_sub(reach), (y + reach).min(height - 1));
            let (x0, x1) = (x.saturating_sub(reach), (x + reach).min(width - 1));
            for yy in y0..=y1 {
                for xx in x0..=x1 {
                    out[yy * width + xx] = true;
                }
            }
        }
    }
    out
}

/// Which view a descriptor summarizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    /// Whole prediction
    Global,
    /// Boundary band only
    Boundary,
}

/// How the boundary view fills its first channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryView {
    /// `(band, band)`: boundary geometry only, no gradient to the prediction
    #[default]
    BandOnly,
    /// `(p * band, band)`: probabilities restricted to the band
    MaskedProbability,
}

/// Two-channel input to the descriptor encoder.
///
/// `primary` is differentiable w.r.t. the prediction unless `differentiable`
/// is false; `band` is a thresholded constant.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionView {
    pub scale: Scale,
    pub height: usize,
    pub width: usize,
    pub primary: Vec<f32>,
    pub band: Vec<f32>,
    pub differentiable: bool,
}

impl PredictionView {
    /// Global view `(p, band)` and the boundary view selected by `boundary`
    pub fn pair(prediction: &ProbabilityMap, band_width: usize, boundary: BoundaryView) -> (Self, Self) {
        let (h, w) = (prediction.height, prediction.width);
        let band: Vec<f32> = boundary_band(&prediction.binary(), h, w, band_width)
            .into_iter()
            .map(|b| if b { 1.0 } else { 0.0 })
            .collect();

        let global = Self {
            scale: Scale::Global,
            height: h,
            width: w,
            primary: prediction.data.clone(),
            band: band.clone(),
            differentiable: true,
        };
        let (primary, differentiable) = match boundary {
            BoundaryView::BandOnly => (band.clone(), false),
            BoundaryView::MaskedProbability => {
                (prediction.data.iter().zip(&band).map(|(p, b)| p * b).collect(), true)
            }
        };
        let boundary = Self {
            scale: Scale::Boundary,
            height: h,
            width: w,
            primary,
            band,
            differentiable,
        };
        (global, boundary)
    }

    /// Chain a gradient on `primary` back to the prediction
    pub fn grad_to_prediction(&self, grad_primary: &[f32]) -> Vec<f32> {
        if !self.differentiable {
            return vec![0.0; grad_primary.len()];
        }
        match self.scale {
            Scale::Global => grad_primary.to_vec(),
            Scale::Boundary => grad_primary.iter().zip(&self.band).map(|(g, b)| g * b).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: usize, lo: usize, hi: usize) -> Vec<bool> {
        (0..size * size)
            .map(|i| {
                let (y, x) = (i / size, i % size);
                (lo..hi).contains(&y) && (lo..hi).contains(&x)
            })
            .collect()
    }

    #[test]
    fn test_confidence_and_foreground() {
        let map = ProbabilityMap::new(1, 4, vec![0.0, 1.0, 0.5, 0.75]).unwrap();
        assert!((map.mean_confidence() - (1.0 + 1.0 + 0.0 + 0.5) / 4.0).abs() < 1e-6);
        assert!((map.foreground_fraction() - 0.5).abs() < 1e-6);
        let flat = ProbabilityMap::new(1, 2, vec![0.5, 0.5]).unwrap();
        assert!((flat.mean_entropy() - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_component_count() {
        #[rustfmt::skip]
        let mask = [
            true,  true,  false, false,
            false, false, false, true,
            false, true,  false, true,
            false, false, false, false,
        ];
        assert_eq!(component_count(&mask, 4, 4), 3);
        assert_eq!(component_count(&[false; 16], 4, 4), 0);
    }

    #[test]
    fn test_boundary_ratio_of_square() {
        let mask = square_mask(8, 2, 6);
        // 4x4 square: perimeter 16, area 16
        assert!((boundary_to_area_ratio(&mask, 8, 8) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_boundary_band_width() {
        let mask = square_mask(8, 2, 6);
        let thin = boundary_band(&mask, 8, 8, 1);
        let wide = boundary_band(&mask, 8, 8, 2);
        let thin_count = thin.iter().filter(|&&b| b).count();
        let wide_count = wide.iter().filter(|&&b| b).count();
        assert!(thin_count > 0);
        assert!(wide_count > thin_count);
        // Interior centre and far corner stay outside a width-1 band
        assert!(!thin[3 * 8 + 3]);
        assert!(!thin[0]);
        // Uniform masks have no boundary
        assert!(boundary_band(&[true; 16], 4, 4, 2).iter().all(|b| !b));
    }

    #[test]
    fn test_view_pair() {
        let data: Vec<f32> = square_mask(6, 1, 4)
            .iter()
            .map(|&m| if m { 0.9 } else { 0.1 })
            .collect();
        let map = ProbabilityMap::new(6, 6, data).unwrap();
        let (global, boundary) = PredictionView::pair(&map, 1, BoundaryView::MaskedProbability);

        assert_eq!(global.primary, map.data);
        assert!(global.differentiable);
        for ((p, b), v) in map.data.iter().zip(&boundary.band).zip(&boundary.primary) {
            assert!((p * b - v).abs() < 1e-6);
        }
        let grad = boundary.grad_to_prediction(&vec![1.0; 36]);
        assert_eq!(grad, boundary.band);
    }

    #[test]
    fn test_band_only_boundary_view() {
        let data: Vec<f32> = square_mask(6, 1, 4)
            .iter()
            .map(|&m| if m { 0.9 } else { 0.1 })
            .collect();
        let map = ProbabilityMap::new(6, 6, data).unwrap();
        let (global, boundary) = PredictionView::pair(&map, 1, BoundaryView::default());

        assert_eq!(boundary.primary, boundary.band);
        assert_eq!(boundary.band, global.band);
        assert!(!boundary.differentiable);
        assert!(boundary.grad_to_prediction(&vec![1.0; 36]).iter().all(|g| *g == 0.0));
        assert_eq!(global.grad_to_prediction(&vec![1.0; 36]), vec![1.0; 36]);
    }
}
