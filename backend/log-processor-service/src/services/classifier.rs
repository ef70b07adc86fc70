//! Anomaly scoring behind a fixed contract
//!
//! The default model looks at message length only: it is fitted once against a
//! reference distribution of "normal" lengths and then flags messages whose
//! length is further from the reference mean than the fitted threshold.

use crate::error::{ProcessorError, Result};
use crate::models::AnomalyVerdict;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Per-message anomaly scoring.
///
/// `initialize` runs once before the first `score`; afterwards the model is
/// read-only and `score` is a pure function of the message.
pub trait Classifier: Send + Sync {
    fn initialize(&mut self) -> Result<()>;

    fn score(&self, message: &str) -> AnomalyVerdict;

    fn name(&self) -> &'static str;
}

/// Where the length model's parameters come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// Fit on a seeded synthetic sample of normally distributed lengths
    Reference(ReferenceDistribution),
    /// Load previously fitted parameters from a JSON file
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDistribution {
    pub mean: f64,
    pub std_dev: f64,
    pub samples: usize,
    /// Expected share of anomalies in the reference data, in (0, 0.5]
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ReferenceDistribution {
    fn default() -> Self {
        Self {
            mean: 30.0,
            std_dev: 10.0,
            samples: 1000,
            contamination: 0.1,
            seed: 42,
        }
    }
}

/// Fitted parameters; also the on-disk format for [`ModelSource::File`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LengthModel {
    pub mean: f64,
    pub std_dev: f64,
    /// Scores above this are anomalous
    pub threshold: f64,
}

impl LengthModel {
    fn validate(self) -> Result<Self> {
        let finite = self.mean.is_finite() && self.std_dev.is_finite() && self.threshold.is_finite();
        if !finite || self.std_dev <= 0.0 || self.threshold < 0.0 {
            return Err(ProcessorError::Classifier(format!(
                "invalid length model parameters: {:?}",
                self
            )));
        }
        Ok(self)
    }

    /// Distance from the mean in standard deviations.
    fn score_length(&self, length: usize) -> f64 {
        (length as f64 - self.mean).abs() / self.std_dev
    }
}

/// Message-length classifier.
pub struct LengthClassifier {
    source: ModelSource,
    model: Option<LengthModel>,
}

impl LengthClassifier {
    pub fn new(source: ModelSource) -> Self {
        Self {
            source,
            model: None,
        }
    }

    pub fn model(&self) -> Option<LengthModel> {
        self.model
    }

    fn fit(reference: &ReferenceDistribution) -> Result<LengthModel> {
        if reference.samples < 2 {
            return Err(ProcessorError::Classifier(
                "reference distribution needs at least 2 samples".to_string(),
            ));
        }
        if !(reference.contamination > 0.0 && reference.contamination <= 0.5) {
            return Err(ProcessorError::Classifier(format!(
                "contamination must be in (0, 0.5], got {}",
                reference.contamination
            )));
        }
        if !reference.std_dev.is_finite() || reference.std_dev <= 0.0 || !reference.mean.is_finite()
        {
            return Err(ProcessorError::Classifier(format!(
                "invalid reference distribution mean={} std_dev={}",
                reference.mean, reference.std_dev
            )));
        }

        let mut rng = StdRng::seed_from_u64(reference.seed);
        let sample: Vec<f64> = (0..reference.samples)
            .map(|_| reference.mean + reference.std_dev * standard_normal(&mut rng))
            .collect();

        let n = sample.len() as f64;
        let mean = sample.iter().sum::<f64>() / n;
        let variance = sample.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();

        let mut scores: Vec<f64> = sample.iter().map(|x| (x - mean).abs() / std_dev).collect();
        scores.sort_by(f64::total_cmp);

        // The (1 - contamination) quantile of the reference scores: that share
        // of the reference data falls at or below the threshold.
        let rank = ((1.0 - reference.contamination) * (scores.len() - 1) as f64).round() as usize;
        let threshold = scores[rank.min(scores.len() - 1)];

        LengthModel {
            mean,
            std_dev,
            threshold,
        }
        .validate()
    }

    fn load(path: &Path) -> Result<LengthModel> {
        let raw = std::fs::read_to_string(path)?;
        let model: LengthModel = serde_json::from_str(&raw)?;
        model.validate()
    }
}

/// Box-Muller transform; `rand` alone ships no normal distribution.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>(); // (0, 1], keeps ln finite
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

impl Classifier for LengthClassifier {
    fn initialize(&mut self) -> Result<()> {
        let model = match &self.source {
            ModelSource::Reference(reference) => Self::fit(reference)?,
            ModelSource::File(path) => Self::load(path)?,
        };

        info!(
            classifier = self.name(),
            mean = model.mean,
            std_dev = model.std_dev,
            threshold = model.threshold,
            "Classifier initialized"
        );

        self.model = Some(model);
        Ok(())
    }

    fn score(&self, message: &str) -> AnomalyVerdict {
        let Some(model) = self.model else {
            warn!("score called before classifier initialization; reporting normal");
            return AnomalyVerdict::normal(0.0);
        };

        let score = model.score_length(message.chars().count());
        if score > model.threshold {
            AnomalyVerdict::anomalous(score)
        } else {
            AnomalyVerdict::normal(score)
        }
    }

    fn name(&self) -> &'static str {
        "message-length"
    }
}
