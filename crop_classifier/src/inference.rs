use crate::{
    error::{ClassifierError, ClassifierResult},
    model_service::Classifier,
    preprocess::InputTensor,
};

/// Softmax over the class dimension, shifted by the maximum for stability.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub struct InferenceEngine<'a> {
    model: &'a dyn Classifier,
}

impl<'a> InferenceEngine<'a> {
    pub fn new(model: &'a dyn Classifier) -> Self {
        Self { model }
    }

    /// Class probabilities for one preprocessed image.
    pub fn probabilities(&self, input: &InputTensor) -> ClassifierResult<Vec<f32>> {
        let logits = self.model.logits(input)?;
        if logits.len() != self.model.num_classes() {
            return Err(ClassifierError::Inference(format!(
                "model returned {} scores for {} classes",
                logits.len(),
                self.model.num_classes()
            )));
        }
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(ClassifierError::Inference(
                "model returned non-finite scores".to_string(),
            ));
        }

        Ok(softmax(&logits))
    }
}
