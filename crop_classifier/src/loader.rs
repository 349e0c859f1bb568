use crate::{
    checkpoint::{self, CheckpointFormat},
    config::{DevicePreference, ModelConfig, PreprocessConfig, Validatable},
    error::{ClassifierError, ClassifierResult},
    model_service::{Classifier, ModelHandle},
    ort_service::OrtClassifier,
    vit::{self, VitClassifier, VitConfig},
};
use std::{path::Path, sync::Arc};

pub struct LoadedModel {
    pub handle: ModelHandle,
    /// Device the model runs on, or would run on when the handle is absent.
    pub device: String,
}

/// Loads the classifier once at startup.
///
/// A missing weights file yields an absent handle: the service keeps running and
/// reports the model as not loaded, unless `require_model` is set. A file that
/// exists but cannot be turned into a classifier is an error.
pub fn load_model(
    model_cfg: &ModelConfig,
    preprocess_cfg: &PreprocessConfig,
    num_classes: usize,
) -> ClassifierResult<LoadedModel> {
    let architecture = VitConfig::tiny_patch16(preprocess_cfg.image_size as usize, num_classes);
    load_model_with(model_cfg, &architecture)
}

pub fn load_model_with(
    model_cfg: &ModelConfig,
    architecture: &VitConfig,
) -> ClassifierResult<LoadedModel> {
    let path = model_cfg.get_path();

    if !path.exists() {
        tracing::error!("Model not found at: {:?}", path);
        if model_cfg.require_model {
            return Err(ClassifierError::ModelUnavailable);
        }
        return Ok(LoadedModel {
            handle: None,
            device: fallback_device_name(model_cfg.device),
        });
    }

    let classifier = build_classifier(&path, model_cfg, architecture)?;
    tracing::info!(
        "Model loaded successfully from {:?} on {} ({} classes)",
        path,
        classifier.device(),
        classifier.num_classes()
    );

    Ok(LoadedModel {
        device: classifier.device().to_string(),
        handle: Some(classifier),
    })
}

fn build_classifier(
    path: &Path,
    model_cfg: &ModelConfig,
    architecture: &VitConfig,
) -> ClassifierResult<Arc<dyn Classifier>> {
    let format = CheckpointFormat::from_path(path).ok_or_else(|| {
        ClassifierError::Checkpoint(format!(
            "{:?} has an unsupported extension, expected .pth, .pt, .bin, .safetensors or .onnx",
            path
        ))
    })?;

    let classifier: Arc<dyn Classifier> = match format {
        CheckpointFormat::Onnx => Arc::new(OrtClassifier::new(
            path,
            architecture.num_classes,
            model_cfg.num_instances,
            model_cfg.device,
        )?),
        CheckpointFormat::Pytorch | CheckpointFormat::Safetensors => {
            let weights = checkpoint::read_state_dict(path, format)?;
            let device = vit::select_device(model_cfg.device)?;
            Arc::new(VitClassifier::from_state_dict(weights, architecture, device)?)
        }
    };

    Ok(classifier)
}

fn fallback_device_name(preference: DevicePreference) -> String {
    match vit::select_device(preference) {
        Ok(device) => vit::device_name(&device).to_string(),
        Err(_) => "cpu".to_string(),
    }
}
