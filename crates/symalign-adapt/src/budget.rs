//! Budget matching: pick an adapter placement that hits a trainable-parameter fraction

use crate::adapter::{AdapterKind, AdapterSpec};
use crate::model::LayerShape;
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Target fraction of trainable parameters with a relative tolerance band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterBudget {
    pub target_fraction: f64,
    pub tolerance: f64,
}

impl Default for ParameterBudget {
    fn default() -> Self {
        Self {
            target_fraction: 0.005,
            tolerance: 0.1,
        }
    }
}

impl ParameterBudget {
    /// Create a budget
    pub fn new(target_fraction: f64, tolerance: f64) -> Self {
        Self {
            target_fraction,
            tolerance,
        }
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.target_fraction > 0.0 && self.target_fraction <= 1.0) {
            return Err(AdaptError::config(format!(
                "target fraction {} must be in (0, 1]",
                self.target_fraction
            )));
        }
        if !(0.0..1.0).contains(&self.tolerance) {
            return Err(AdaptError::config(format!(
                "tolerance {} must be in [0, 1)",
                self.tolerance
            )));
        }
        Ok(())
    }

    /// `(target, lower, upper)` trainable counts for a model of `total` parameters
    pub fn band(&self, total: usize) -> (f64, f64, f64) {
        let target = self.target_fraction * total as f64;
        (
            target,
            target * (1.0 - self.tolerance),
            target * (1.0 + self.tolerance),
        )
    }
}

/// Adapter families the search may use, in tie-break order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterFamily {
    LowRank,
    StructuredSparse,
    AffineOnly,
}

/// Search space of the budget matcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub budget: ParameterBudget,
    pub families: Vec<AdapterFamily>,
    /// Largest low-rank rank tried
    pub max_rank: usize,
    /// Low-rank alpha; `None` uses `alpha = rank`
    pub alpha: Option<f32>,
    /// Layers eligible when their name contains any pattern (empty: all)
    pub target_patterns: Vec<String>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            budget: ParameterBudget::default(),
            families: vec![
                AdapterFamily::LowRank,
                AdapterFamily::StructuredSparse,
                AdapterFamily::AffineOnly,
            ],
            max_rank: 16,
            alpha: None,
            target_patterns: Vec::new(),
        }
    }
}

impl BudgetConfig {
    /// Set budget
    pub fn budget(mut self, budget: ParameterBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Restrict families
    pub fn families(mut self, families: Vec<AdapterFamily>) -> Self {
        self.families = families;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;
        if self.families.is_empty() {
            return Err(AdaptError::config("budget search needs at least one adapter family"));
        }
        if self.families.contains(&AdapterFamily::LowRank) && self.max_rank == 0 {
            return Err(AdaptError::config("max_rank must be >= 1"));
        }
        Ok(())
    }

    fn eligible<'a>(&self, layers: &'a [LayerShape]) -> Vec<&'a LayerShape> {
        layers
            .iter()
            .filter(|l| {
                self.target_patterns.is_empty()
                    || self.target_patterns.iter().any(|p| l.name.contains(p.as_str()))
            })
            .collect()
    }
}

/// Outcome of a successful search
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetResolution {
    pub spec: AdapterSpec,
    pub trainable: usize,
    pub target: f64,
    /// Achieved fraction of total parameters
    pub fraction: f64,
}

#[derive(Debug, Clone)]
struct Candidate {
    kind: AdapterKind,
    family: AdapterFamily,
    scope: usize,
    size: usize,
    cost: usize,
}

/// Resolve a budget into an adapter spec on `layers`
pub fn resolve(config: &BudgetConfig, layers: &[LayerShape], total_params: usize) -> Result<BudgetResolution> {
    config.validate()?;
    let eligible = config.eligible(layers);
    if eligible.is_empty() {
        return Err(AdaptError::config("no layer matches the adapter target patterns"));
    }

    let mut candidates = enumerate(config, &eligible);
    candidates.sort_by(|a, b| {
        (a.cost, a.family, a.scope, a.size).cmp(&(b.cost, b.family, b.scope, b.size))
    });
    debug!(candidates = candidates.len(), "Enumerated budget candidates");

    let (target, lower, upper) = config.budget.band(total_params);
    let hit = candidates
        .iter()
        .find(|c| (c.cost as f64) >= lower && (c.cost as f64) <= upper);

    match hit {
        Some(c) => {
            let spec = AdapterSpec::new(
                c.kind,
                eligible[..c.scope].iter().map(|l| l.name.clone()).collect(),
            );
            info!(
                kind = ?c.kind,
                layers = c.scope,
                trainable = c.cost,
                target = target,
                "Resolved parameter budget"
            );
            Ok(BudgetResolution {
                spec,
                trainable: c.cost,
                target,
                fraction: c.cost as f64 / total_params as f64,
            })
        }
        None => {
            let closest = candidates
                .iter()
                .map(|c| c.cost)
                .min_by(|a, b| {
                    let da = (*a as f64 - target).abs();
                    let db = (*b as f64 - target).abs();
                    da.total_cmp(&db)
                });
            Err(AdaptError::BudgetUnreachable {
                target,
                lower,
                upper,
                closest,
            })
        }
    }
}

fn enumerate(config: &BudgetConfig, eligible: &[&LayerShape]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for scope in 1..=eligible.len() {
        let layers = &eligible[..scope];
        let cost_of = |kind: &AdapterKind| -> usize {
            layers.iter().map(|l| kind.cost(l.in_dim, l.out_dim)).sum()
        };

        for &family in &config.families {
            match family {
                AdapterFamily::LowRank => {
                    for rank in 1..=config.max_rank {
                        let alpha = config.alpha.unwrap_or(rank as f32);
                        let kind = AdapterKind::LowRank { rank, alpha };
                        out.push(Candidate {
                            cost: cost_of(&kind),
                            kind,
                            family,
                            scope,
                            size: rank,
                        });
                    }
                }
                AdapterFamily::StructuredSparse => {
                    let max_rows = layers.iter().map(|l| l.out_dim).min().unwrap_or(0);
                    for rows in 1..=max_rows {
                        let kind = AdapterKind::StructuredSparse { rows };
                        out.push(Candidate {
                            cost: cost_of(&kind),
                            kind,
                            family,
                            scope,
                            size: rows,
                        });
                    }
                }
                AdapterFamily::AffineOnly => {
                    let kind = AdapterKind::AffineOnly;
                    out.push(Candidate {
                        cost: cost_of(&kind),
                        kind,
                        family,
                        scope,
                        size: 1,
                    });
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers() -> Vec<LayerShape> {
        vec![
            LayerShape::new("fc0", 32, 512),
            LayerShape::new("fc1", 512, 512),
            LayerShape::new("fc2", 512, 1),
        ]
    }

    fn total() -> usize {
        32 * 512 + 512 + 512 * 512 + 512 + 512 + 1
    }

    #[test]
    fn test_resolves_within_band() {
        for fraction in [0.001, 0.005, 0.01] {
            let config = BudgetConfig::default().budget(ParameterBudget::new(fraction, 0.1));
            let r = resolve(&config, &layers(), total()).unwrap();
            let (_, lower, upper) = config.budget.band(total());
            assert!((r.trainable as f64) >= lower && (r.trainable as f64) <= upper);
            assert_eq!(r.spec.trainable_params(&layers()), r.trainable);
        }
    }

    #[test]
    fn test_cheapest_in_band_wins() {
        let config = BudgetConfig::default()
            .budget(ParameterBudget::new(0.001, 0.1))
            .families(vec![AdapterFamily::StructuredSparse]);
        let r = resolve(&config, &layers(), total()).unwrap();
        // Rows on fc0 cost 32 each; 8 rows = 256 is the first inside [252, 308]
        assert_eq!(r.spec.kind, AdapterKind::StructuredSparse { rows: 8 });
        assert_eq!(r.spec.targets, vec!["fc0".to_string()]);
    }

    #[test]
    fn test_unreachable_reports_closest() {
        let config = BudgetConfig::default()
            .budget(ParameterBudget::new(0.5, 0.01))
            .families(vec![AdapterFamily::AffineOnly]);
        match resolve(&config, &layers(), total()) {
            Err(AdaptError::BudgetUnreachable { closest, lower, upper, .. }) => {
                assert!(lower < upper);
                assert_eq!(closest, Some(2 * 512 + 2 * 512 + 2));
            }
            other => panic!("expected BudgetUnreachable, got {:?}", other),
        }
    }

    #[test]
    fn test_target_patterns_filter_layers() {
        let config = BudgetConfig {
            target_patterns: vec!["fc1".into()],
            ..BudgetConfig::default().budget(ParameterBudget::new(0.01, 0.1))
        };
        let r = resolve(&config, &layers(), total()).unwrap();
        assert_eq!(r.spec.targets, vec!["fc1".to_string()]);

        let none = BudgetConfig {
            target_patterns: vec!["conv".into()],
            ..BudgetConfig::default()
        };
        assert!(matches!(
            resolve(&none, &layers(), total()),
            Err(AdaptError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_budget() {
        let config = BudgetConfig::default().budget(ParameterBudget::new(0.0, 0.1));
        assert!(resolve(&config, &layers(), total()).is_err());
    }
}
