//! Runtime configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. [`CartaConfig::load`] layers an optional TOML file
//! under `CARTA_`-prefixed environment variables, e.g.
//! `CARTA_QUERY__OVERFETCH=8`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
  conversation::Role,
  score::{Signal, WeightSet},
  vector::{ModelVersion, SimilarityMetric, l2_norm},
  Error, Result,
};

/// `CARTA_SECTION__KEY`: one underscore after the prefix, two between
/// nesting levels.
fn environment() -> config::Environment {
  config::Environment::with_prefix("CARTA")
    .prefix_separator("_")
    .separator("__")
    .try_parsing(true)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CartaConfig {
  pub embedding: EmbeddingConfig,
  pub metrics:   MetricsConfig,
  pub pairs:     PairConfig,
  pub traversal: TraversalConfig,
  pub query:     QueryConfig,
}

impl CartaConfig {
  /// Read configuration from `path` (optional) and the environment, then
  /// validate it.
  pub fn load(path: Option<&Path>) -> Result<Self> { Self::load_from(path, environment()) }

  fn load_from(path: Option<&Path>, env: config::Environment) -> Result<Self> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
      builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
    }
    let settings = builder
      .add_source(env)
      .build()
      .map_err(|e| Error::Configuration(e.to_string()))?;

    let cfg: Self = settings
      .try_deserialize()
      .map_err(|e| Error::Configuration(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn validate(&self) -> Result<()> {
    self.metrics.spark_weights.validate("metrics.spark_weights")?;
    self.query.composite_weights.validate("query.composite_weights")?;
    self.metrics.cognitive_load.validate()?;

    if self.metrics.entropy_bins == 0 {
      return Err(Error::Configuration("metrics.entropy_bins must be positive".into()));
    }
    let decay = self.metrics.downstream_decay;
    if !(decay > 0.0 && decay <= 1.0) {
      return Err(Error::Configuration(format!(
        "metrics.downstream_decay must lie in (0, 1], got {decay}"
      )));
    }
    if let Some(axis) = &self.metrics.abstraction_axis
      && l2_norm(axis) == 0.0
    {
      return Err(Error::Configuration("metrics.abstraction_axis has zero norm".into()));
    }
    if let (Some(axis), Some(dim)) = (&self.metrics.abstraction_axis, self.embedding.dimension)
      && axis.len() != dim
    {
      return Err(Error::DimensionMismatch { expected: dim, found: axis.len() });
    }
    self.traversal.validate()?;

    let q = &self.query;
    if q.overfetch == 0 || q.default_limit == 0 {
      return Err(Error::Configuration(
        "query.overfetch and query.default_limit must be positive".into(),
      ));
    }
    if !q.pattern_spark_boost.is_finite() || q.pattern_spark_boost < 0.0 {
      return Err(Error::Configuration(
        "query.pattern_spark_boost must be a non-negative number".into(),
      ));
    }
    Ok(())
  }
}

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  /// Version tag assigned to conversations whose export names none.
  pub model_version:   ModelVersion,
  /// Fixed dimensionality of this deployment, when known up front.
  pub dimension:       Option<usize>,
  /// Reject cross-version comparisons instead of warning.
  pub strict_versions: bool,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      model_version:   ModelVersion::new("text-embedding-3-large"),
      dimension:       None,
      strict_versions: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
  /// Weights over `cognitive_load`, `branch_entropy` (or `entropy`) and
  /// `drift_acceleration`.
  pub spark_weights:    WeightSet,
  /// Histogram bins for branch entropy over the cosine-distance range.
  pub entropy_bins:     usize,
  pub cognitive_load:   CognitiveLoadWeights,
  /// Per-level decay applied when aggregating descendant spark.
  pub downstream_decay: f64,
  /// Corpus-calibrated direction for abstraction deltas.
  pub abstraction_axis: Option<Vec<f32>>,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      spark_weights:    WeightSet::from_pairs([
        (Signal::CognitiveLoad, 0.3),
        (Signal::Entropy, 0.3),
        (Signal::DriftAcceleration, 0.4),
      ]),
      entropy_bins:     10,
      cognitive_load:   CognitiveLoadWeights::default(),
      downstream_decay: 0.5,
      abstraction_axis: None,
    }
  }
}

/// Coefficients of the cognitive-load signature. All must be non-negative so
/// the signature stays monotonic in latency and edit-chain depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CognitiveLoadWeights {
  pub content:    f64,
  pub latency:    f64,
  pub edit_chain: f64,
}

impl Default for CognitiveLoadWeights {
  fn default() -> Self { Self { content: 0.4, latency: 0.4, edit_chain: 0.2 } }
}

impl CognitiveLoadWeights {
  fn validate(&self) -> Result<()> {
    for (name, w) in [
      ("content", self.content),
      ("latency", self.latency),
      ("edit_chain", self.edit_chain),
    ] {
      if !w.is_finite() || w < 0.0 {
        return Err(Error::Configuration(format!(
          "metrics.cognitive_load.{name} must be a non-negative number, got {w}"
        )));
      }
    }
    Ok(())
  }
}

/// Which roles form a prompt/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairConfig {
  pub prompt_role:   Role,
  pub response_role: Role,
}

impl Default for PairConfig {
  fn default() -> Self { Self { prompt_role: Role::User, response_role: Role::Assistant } }
}

/// Depth bounds for every graph walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
  /// Downstream spark aggregation.
  pub influence_depth:      usize,
  pub descendant_depth:     usize,
  pub branch_depth:         usize,
  pub alternate_path_depth: usize,
  /// Safeguard for root-path reconstruction; tripping it is a fault.
  pub root_path_depth:      usize,
  pub max_alternate_paths:  usize,
}

impl Default for TraversalConfig {
  fn default() -> Self {
    Self {
      influence_depth:      5,
      descendant_depth:     10,
      branch_depth:         20,
      alternate_path_depth: 10,
      root_path_depth:      50,
      max_alternate_paths:  256,
    }
  }
}

impl TraversalConfig {
  fn validate(&self) -> Result<()> {
    for (name, v) in [
      ("influence_depth", self.influence_depth),
      ("descendant_depth", self.descendant_depth),
      ("branch_depth", self.branch_depth),
      ("alternate_path_depth", self.alternate_path_depth),
      ("root_path_depth", self.root_path_depth),
      ("max_alternate_paths", self.max_alternate_paths),
    ] {
      if v == 0 {
        return Err(Error::Configuration(format!("traversal.{name} must be positive")));
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  pub composite_weights:   WeightSet,
  /// Multiplier on spark factor in cross-conversation pattern search.
  pub pattern_spark_boost: f64,
  /// Candidates fetched per requested result before re-ranking.
  pub overfetch:           usize,
  pub default_limit:       usize,
  pub default_metric:      SimilarityMetric,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      composite_weights:   WeightSet::from_pairs([
        (Signal::Similarity, 0.6),
        (Signal::Spark, 0.2),
        (Signal::Entropy, 0.1),
        (Signal::Drift, 0.1),
      ]),
      pattern_spark_boost: 0.1,
      overfetch:           4,
      default_limit:       10,
      default_metric:      SimilarityMetric::Cosine,
    }
  }
}
