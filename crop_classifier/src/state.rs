use crate::{
    config::{Config, LabelsConfig, Validatable},
    error::{ClassifierError, ClassifierResult},
    inference::InferenceEngine,
    loader,
    model_service::{Classifier, ModelHandle},
    preprocess::Preprocessor,
    response::{ModelNotLoaded, PredictionResult, ResponseBuilder},
};
use std::{
    fs::File,
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Number of outputs of the placeholder label set.
pub const PLACEHOLDER_CLASSES: usize = 15;

pub fn placeholder_labels() -> Vec<String> {
    (0..PLACEHOLDER_CLASSES).map(|i| format!("class_{}", i)).collect()
}

/// One label per line, in the order the classifier was exported with.
pub fn load_class_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if !label.is_empty() {
            labels.push(label.to_string());
        }
    }

    Ok(labels)
}

pub fn resolve_labels(labels_cfg: &LabelsConfig) -> ClassifierResult<Vec<String>> {
    let labels = if let Some(path) = labels_cfg.get_path() {
        load_class_labels(&path)
            .map_err(|e| ClassifierError::Labels(format!("{:?}: {}", path, e)))?
    } else if let Some(names) = &labels_cfg.names {
        names.clone()
    } else {
        tracing::warn!(
            "No class labels configured, using {} placeholder labels",
            PLACEHOLDER_CLASSES
        );
        placeholder_labels()
    };

    if labels.is_empty() {
        return Err(ClassifierError::Labels("label list is empty".to_string()));
    }
    Ok(labels)
}

/// Everything a request needs, built once at startup and shared read-only.
pub struct ServiceState {
    model: ModelHandle,
    labels: Vec<String>,
    model_path: PathBuf,
    device: String,
    preprocessor: Preprocessor,
    response_builder: ResponseBuilder,
}

impl ServiceState {
    pub fn new(
        model: ModelHandle,
        labels: Vec<String>,
        model_path: PathBuf,
        device: String,
        preprocessor: Preprocessor,
        response_builder: ResponseBuilder,
    ) -> Self {
        Self {
            model,
            labels,
            model_path,
            device,
            preprocessor,
            response_builder,
        }
    }

    /// Loads labels and weights as described by `config`.
    pub fn from_config(config: &Config) -> ClassifierResult<Self> {
        let labels = resolve_labels(&config.labels)?;
        let loaded = loader::load_model(&config.model, &config.preprocess, labels.len())?;

        Ok(Self::new(
            loaded.handle,
            labels,
            config.model.get_path(),
            loaded.device,
            Preprocessor::new(&config.preprocess),
            ResponseBuilder::new(&config.prediction),
        ))
    }

    pub fn model_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn model_not_loaded(&self) -> ModelNotLoaded {
        ModelNotLoaded::new(&self.model_path)
    }

    fn model(&self) -> ClassifierResult<&dyn Classifier> {
        self.model
            .as_deref()
            .ok_or(ClassifierError::ModelUnavailable)
    }

    /// Runs the whole pipeline on one uploaded image. CPU bound; call from a blocking task.
    pub fn classify(&self, image_data: &[u8]) -> ClassifierResult<PredictionResult> {
        let model = self.model()?;
        let input = self.preprocessor.transform(image_data)?;
        let probabilities = InferenceEngine::new(model).probabilities(&input)?;
        self.response_builder.build(&probabilities, &self.labels)
    }
}

pub type SharedState = Arc<ServiceState>;
