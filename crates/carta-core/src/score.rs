//! Weighted linear composites over named signals.
//!
//! Spark factor and composite search both reduce to
//! `Σ wᵢ · normalized(signalᵢ)`; [`weighted_sum`] is the single
//! implementation. Signal ranges live in [`Signal::range`] and are consulted
//! when values are admitted into a [`Normalizer`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A named numeric signal that can take part in a composite score.
///
/// Names deserialise case-insensitively; `branch_entropy` is accepted for
/// [`Signal::Entropy`].
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Signal {
  Similarity,
  Spark,
  Entropy,
  Drift,
  DriftAcceleration,
  CognitiveLoad,
  Coherence,
}

/// Closed interval a signal may legitimately occupy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalRange {
  pub min: f64,
  pub max: f64,
}

impl Signal {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Similarity => "similarity",
      Self::Spark => "spark",
      Self::Entropy => "entropy",
      Self::Drift => "drift",
      Self::DriftAcceleration => "drift_acceleration",
      Self::CognitiveLoad => "cognitive_load",
      Self::Coherence => "coherence",
    }
  }

  pub fn range(self) -> SignalRange {
    match self {
      // Cosine similarity; euclidean and unit inner-product scores also
      // fall inside.
      Self::Similarity | Self::Coherence => SignalRange { min: -1.0, max: 1.0 },
      Self::Spark => SignalRange { min: 0.0, max: 1.0 },
      Self::Entropy | Self::CognitiveLoad => SignalRange { min: 0.0, max: f64::INFINITY },
      // Cosine distance from the root.
      Self::Drift => SignalRange { min: 0.0, max: 2.0 },
      // Second difference of values in [0, 2].
      Self::DriftAcceleration => SignalRange { min: -4.0, max: 4.0 },
    }
  }

  /// Clamp `value` into this signal's range; non-finite values are dropped.
  pub fn admit(self, value: f64) -> Option<f64> {
    if !value.is_finite() {
      return None;
    }
    let r = self.range();
    Some(value.clamp(r.min, r.max))
  }
}

impl std::str::FromStr for Signal {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "similarity" => Ok(Self::Similarity),
      "spark" => Ok(Self::Spark),
      "entropy" | "branch_entropy" => Ok(Self::Entropy),
      "drift" => Ok(Self::Drift),
      "drift_acceleration" => Ok(Self::DriftAcceleration),
      "cognitive_load" => Ok(Self::CognitiveLoad),
      "coherence" => Ok(Self::Coherence),
      other => Err(Error::Configuration(format!("unknown signal: {other:?}"))),
    }
  }
}

impl TryFrom<String> for Signal {
  type Error = Error;

  fn try_from(s: String) -> Result<Self> { s.parse() }
}

// ─── Weights ─────────────────────────────────────────────────────────────────

/// A named-weight configuration. Signals without an entry weigh 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightSet(BTreeMap<Signal, f64>);

impl WeightSet {
  pub fn from_pairs(pairs: impl IntoIterator<Item = (Signal, f64)>) -> Self {
    Self(pairs.into_iter().collect())
  }

  pub fn get(&self, signal: Signal) -> f64 { self.0.get(&signal).copied().unwrap_or(0.0) }

  pub fn iter(&self) -> impl Iterator<Item = (Signal, f64)> + '_ {
    self.0.iter().map(|(s, w)| (*s, *w))
  }

  /// Weights must be finite, non-negative, and not all zero.
  pub fn validate(&self, name: &str) -> Result<()> {
    for (signal, w) in self.iter() {
      if !w.is_finite() || w < 0.0 {
        return Err(Error::Configuration(format!(
          "{name}.{} must be a non-negative number, got {w}",
          signal.as_str()
        )));
      }
    }
    if self.iter().all(|(_, w)| w == 0.0) {
      return Err(Error::Configuration(format!("{name} has no positive weight")));
    }
    Ok(())
  }
}

// ─── Normalisation ───────────────────────────────────────────────────────────

/// Min–max bounds per signal, gathered over a population.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalizer {
  bounds: BTreeMap<Signal, (f64, f64)>,
}

impl Normalizer {
  pub fn new() -> Self { Self::default() }

  pub fn observe(&mut self, signal: Signal, value: Option<f64>) {
    let Some(v) = value.and_then(|v| signal.admit(v)) else {
      return;
    };
    self
      .bounds
      .entry(signal)
      .and_modify(|(lo, hi)| {
        *lo = lo.min(v);
        *hi = hi.max(v);
      })
      .or_insert((v, v));
  }

  pub fn bounds(&self, signal: Signal) -> Option<(f64, f64)> { self.bounds.get(&signal).copied() }

  /// Map `value` into `[0, 1]`. A constant signal normalises to 0.
  pub fn normalize(&self, signal: Signal, value: Option<f64>) -> Option<f64> {
    let v = signal.admit(value?)?;
    let (lo, hi) = self.bounds(signal)?;
    if hi > lo { Some(((v - lo) / (hi - lo)).clamp(0.0, 1.0)) } else { Some(0.0) }
  }
}

/// `Σ wᵢ · xᵢ` over the weighted signals; signals for which `normalized`
/// yields `None` contribute nothing.
pub fn weighted_sum(weights: &WeightSet, normalized: impl Fn(Signal) -> Option<f64>) -> f64 {
  weights
    .iter()
    .filter(|(_, w)| *w != 0.0)
    .filter_map(|(signal, w)| normalized(signal).map(|x| w * x))
    .sum()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalizer_maps_population_to_unit_interval() {
    let mut n = Normalizer::new();
    for v in [2.0, 4.0, 6.0] {
      n.observe(Signal::Entropy, Some(v));
    }
    assert_eq!(n.normalize(Signal::Entropy, Some(2.0)), Some(0.0));
    assert_eq!(n.normalize(Signal::Entropy, Some(4.0)), Some(0.5));
    assert_eq!(n.normalize(Signal::Entropy, Some(6.0)), Some(1.0));
    assert_eq!(n.normalize(Signal::Spark, Some(0.3)), None);
  }

  #[test]
  fn constant_signal_normalizes_to_zero() {
    let mut n = Normalizer::new();
    n.observe(Signal::Drift, Some(0.4));
    n.observe(Signal::Drift, Some(0.4));
    assert_eq!(n.normalize(Signal::Drift, Some(0.4)), Some(0.0));
  }

  #[test]
  fn non_finite_values_are_not_admitted() {
    let mut n = Normalizer::new();
    n.observe(Signal::Drift, Some(f64::NAN));
    assert_eq!(n.bounds(Signal::Drift), None);
  }

  #[test]
  fn weighted_sum_skips_missing_signals() {
    let w = WeightSet::from_pairs([(Signal::Similarity, 0.6), (Signal::Spark, 0.4)]);
    let total = weighted_sum(&w, |s| match s {
      Signal::Similarity => Some(1.0),
      _ => None,
    });
    assert!((total - 0.6).abs() < 1e-12);
  }

  #[test]
  fn all_zero_weights_are_rejected() {
    let w = WeightSet::from_pairs([(Signal::Similarity, 0.0)]);
    assert!(w.validate("w").is_err());
    assert!(WeightSet::default().validate("w").is_err());
  }
}
