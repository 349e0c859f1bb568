use crate::{error::ClassifierResult, preprocess::InputTensor};
use std::sync::Arc;

/// A loaded image classifier, shared read-only by every request.
pub trait Classifier: Send + Sync + 'static {
    fn num_classes(&self) -> usize;

    /// Name of the compute device the model is bound to, e.g. `cpu` or `cuda`.
    fn device(&self) -> &str;

    /// Runs a forward pass and returns the raw class scores for a single image.
    fn logits(&self, input: &InputTensor) -> ClassifierResult<Vec<f32>>;
}

/// Process-wide classifier handle; `None` when no weights file was found at startup.
pub type ModelHandle = Option<Arc<dyn Classifier>>;
