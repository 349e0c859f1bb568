use crate::{
    config::{PredictionConfig, MAX_TOP_K},
    error::{ClassifierError, ClassifierResult},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_class: String,
    pub confidence: f32,
    pub top_3: Vec<LabelScore>,
    pub is_unknown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelNotLoaded {
    pub error: String,
    pub model_path: String,
}

impl ModelNotLoaded {
    pub fn new(model_path: &Path) -> Self {
        Self {
            error: ClassifierError::ModelUnavailable.to_string(),
            model_path: model_path.display().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    unknown_threshold: f32,
    top_k: usize,
}

impl ResponseBuilder {
    pub fn new(config: &PredictionConfig) -> Self {
        Self {
            unknown_threshold: config.unknown_threshold,
            top_k: config.top_k.min(MAX_TOP_K),
        }
    }

    /// Ranks `probabilities` against `labels` (same order) into a prediction.
    pub fn build(
        &self,
        probabilities: &[f32],
        labels: &[String],
    ) -> ClassifierResult<PredictionResult> {
        if probabilities.len() != labels.len() {
            return Err(ClassifierError::Inference(format!(
                "{} probabilities for {} labels",
                probabilities.len(),
                labels.len()
            )));
        }

        // Stable sort: equal probabilities keep label order.
        let mut ranked: Vec<usize> = (0..probabilities.len()).collect();
        ranked.sort_by(|a, b| probabilities[*b].total_cmp(&probabilities[*a]));

        let top_idx = *ranked
            .first()
            .ok_or_else(|| ClassifierError::Inference("empty probability vector".to_string()))?;
        let confidence = probabilities[top_idx];

        let top_3 = ranked
            .iter()
            .take(self.top_k)
            .map(|&i| LabelScore {
                label: labels[i].clone(),
                confidence: probabilities[i],
            })
            .collect();

        Ok(PredictionResult {
            predicted_class: labels[top_idx].clone(),
            confidence,
            top_3,
            is_unknown: confidence < self.unknown_threshold,
        })
    }
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new(&PredictionConfig::default())
    }
}
