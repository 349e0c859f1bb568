//! Reading serialized classifier weights.
//!
//! A weights file holds the parameter map in one of two shapes:
//!
//! * **bare**: parameter names map straight to tensors
//!   (`{"head.weight": .., "blocks.0.attn.qkv.weight": ..}`);
//! * **wrapped**: the parameter map sits under a conventional key of an outer
//!   mapping (`{"state_dict": {"head.weight": ..}, "epoch": 12}`). Flat formats
//!   such as safetensors express the same thing as a shared `state_dict.` name
//!   prefix.
//!
//! [`WeightsLayout`] names the shape and [`WeightsLayout::normalize`] turns
//! either one into the bare parameter map the model builder consumes.

use crate::error::{ClassifierError, ClassifierResult};
use candle_core::{pickle, Device, Tensor};
use std::{collections::HashMap, path::Path};

/// Keys a training script commonly wraps its parameter map under.
pub const WRAPPER_KEYS: [&str; 2] = ["state_dict", "model"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// PyTorch `torch.save` archive (`.pth`, `.pt`, `.bin`).
    Pytorch,
    Safetensors,
    /// Self-contained ONNX graph with embedded initializers.
    Onnx,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_lowercase();
        match extension.as_str() {
            "pth" | "pt" | "bin" => Some(Self::Pytorch),
            "safetensors" => Some(Self::Safetensors),
            "onnx" => Some(Self::Onnx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsLayout {
    Bare,
    Wrapped { key: String },
}

impl WeightsLayout {
    /// Detects the layout of a flat list of parameter names.
    ///
    /// The names are wrapped when every one of them carries the same
    /// `<key>.` prefix for a key in [`WRAPPER_KEYS`].
    pub fn detect<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
        I::IntoIter: Clone,
    {
        let names = names.into_iter();
        for key in WRAPPER_KEYS {
            let prefix = format!("{}.", key);
            let mut all = names.clone().peekable();
            if all.peek().is_some() && all.all(|name| name.starts_with(&prefix)) {
                return Self::Wrapped {
                    key: key.to_string(),
                };
            }
        }
        Self::Bare
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Bare => None,
            Self::Wrapped { key } => Some(key),
        }
    }

    /// Produces the bare parameter map.
    ///
    /// Names that still carry the wrapper prefix lose it; names already
    /// extracted from under the wrapper key are kept as they are.
    pub fn normalize(&self, entries: Vec<(String, Tensor)>) -> HashMap<String, Tensor> {
        match self {
            Self::Bare => entries.into_iter().collect(),
            Self::Wrapped { key } => {
                let prefix = format!("{}.", key);
                entries
                    .into_iter()
                    .map(|(name, tensor)| match name.strip_prefix(&prefix) {
                        Some(stripped) => (stripped.to_string(), tensor),
                        None => (name, tensor),
                    })
                    .collect()
            }
        }
    }
}

/// Detects the layout of a PyTorch archive by probing the wrapper keys.
fn detect_pytorch_layout(path: &Path) -> ClassifierResult<WeightsLayout> {
    let bare = pickle::read_pth_tensor_info(path, false, None)
        .map_err(|e| ClassifierError::Checkpoint(format!("{:?}: {}", path, e)))?;

    for key in WRAPPER_KEYS {
        // A missing key is reported as an error, which only means "not wrapped under this key".
        if let Ok(infos) = pickle::read_pth_tensor_info(path, false, Some(key)) {
            if !infos.is_empty() {
                return Ok(WeightsLayout::Wrapped {
                    key: key.to_string(),
                });
            }
        }
    }

    if bare.is_empty() {
        return Err(ClassifierError::Checkpoint(format!(
            "{:?} holds no parameter tensors",
            path
        )));
    }
    Ok(WeightsLayout::Bare)
}

/// Reads every parameter of a weights file into host memory, normalized to the bare layout.
pub fn read_state_dict(
    path: &Path,
    format: CheckpointFormat,
) -> ClassifierResult<HashMap<String, Tensor>> {
    let (layout, entries) = match format {
        CheckpointFormat::Pytorch => {
            let layout = detect_pytorch_layout(path)?;
            let entries = pickle::read_all_with_key(path, layout.key())
                .map_err(|e| ClassifierError::Checkpoint(format!("{:?}: {}", path, e)))?;
            (layout, entries)
        }
        CheckpointFormat::Safetensors => {
            let tensors = candle_core::safetensors::load(path, &Device::Cpu)
                .map_err(|e| ClassifierError::Checkpoint(format!("{:?}: {}", path, e)))?;
            let layout = WeightsLayout::detect(tensors.keys().map(String::as_str));
            (layout, tensors.into_iter().collect())
        }
        CheckpointFormat::Onnx => {
            return Err(ClassifierError::Checkpoint(format!(
                "{:?} is an ONNX graph, not a parameter map",
                path
            )))
        }
    };

    tracing::info!(
        "Read {} parameters from {:?} ({:?} layout)",
        entries.len(),
        path,
        layout
    );
    Ok(layout.normalize(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn tensor() -> Tensor {
        Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_format_from_extension() {
        let format = |p: &str| CheckpointFormat::from_path(&PathBuf::from(p));
        assert_eq!(format("models/best_vit_tiny_patch16_224.pth"), Some(CheckpointFormat::Pytorch));
        assert_eq!(format("a.PT"), Some(CheckpointFormat::Pytorch));
        assert_eq!(format("a.safetensors"), Some(CheckpointFormat::Safetensors));
        assert_eq!(format("a.onnx"), Some(CheckpointFormat::Onnx));
        assert_eq!(format("a.txt"), None);
        assert_eq!(format("no_extension"), None);
    }

    #[test]
    fn test_detects_bare_layout() {
        let names = ["cls_token", "head.weight", "blocks.0.norm1.weight"];
        assert_eq!(WeightsLayout::detect(names), WeightsLayout::Bare);
        assert_eq!(WeightsLayout::detect(Vec::<&str>::new()), WeightsLayout::Bare);
    }

    #[test]
    fn test_detects_wrapped_layout() {
        let names = ["state_dict.cls_token", "state_dict.head.weight"];
        assert_eq!(
            WeightsLayout::detect(names),
            WeightsLayout::Wrapped {
                key: "state_dict".to_string()
            }
        );

        let names = ["model.cls_token", "model.head.weight"];
        assert_eq!(WeightsLayout::detect(names).key(), Some("model"));
    }

    #[test]
    fn test_partial_prefix_is_bare() {
        let names = ["state_dict.cls_token", "head.weight"];
        assert_eq!(WeightsLayout::detect(names), WeightsLayout::Bare);
    }

    #[test]
    fn test_normalize_strips_wrapper_prefix() {
        let layout = WeightsLayout::Wrapped {
            key: "state_dict".to_string(),
        };
        let entries = vec![
            ("state_dict.head.weight".to_string(), tensor()),
            ("head.bias".to_string(), tensor()),
        ];

        let normalized = layout.normalize(entries);
        let mut names: Vec<_> = normalized.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["head.bias", "head.weight"]);
    }

    #[test]
    fn test_normalize_bare_keeps_names() {
        let entries = vec![("model.head.weight".to_string(), tensor())];
        let normalized = WeightsLayout::Bare.normalize(entries);
        assert!(normalized.contains_key("model.head.weight"));
    }

    #[test]
    fn test_safetensors_wrapped_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("state_dict.head.weight".to_string(), tensor());
        tensors.insert("state_dict.head.bias".to_string(), tensor());
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let state = read_state_dict(&path, CheckpointFormat::Safetensors).unwrap();
        assert_eq!(state.len(), 2);
        assert!(state.contains_key("head.weight"));
        assert!(state.contains_key("head.bias"));
    }

    #[test]
    fn test_unreadable_file_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pth");
        std::fs::write(&path, b"not a zip archive").unwrap();

        let result = read_state_dict(&path, CheckpointFormat::Pytorch);
        assert!(matches!(result, Err(ClassifierError::Checkpoint(_))));

        let path = dir.path().join("broken.safetensors");
        std::fs::write(&path, b"garbage").unwrap();
        let result = read_state_dict(&path, CheckpointFormat::Safetensors);
        assert!(matches!(result, Err(ClassifierError::Checkpoint(_))));
    }

    #[test]
    fn test_pytorch_layouts_are_detected() {
        assert_eq!(
            detect_pytorch_layout(&fixture("bare.pth")).unwrap(),
            WeightsLayout::Bare
        );
        assert_eq!(
            detect_pytorch_layout(&fixture("wrapped_state_dict.pth"))
                .unwrap()
                .key(),
            Some("state_dict")
        );
        assert_eq!(
            detect_pytorch_layout(&fixture("wrapped_model.pth"))
                .unwrap()
                .key(),
            Some("model")
        );
    }

    #[test]
    fn test_pytorch_bare_and_wrapped_normalize_identically() {
        let bare = read_state_dict(&fixture("bare.pth"), CheckpointFormat::Pytorch).unwrap();
        let mut names: Vec<_> = bare.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["head.bias", "head.weight"]);

        let bias = bare["head.bias"].to_vec1::<f32>().unwrap();
        let weight = bare["head.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(bias, vec![0.5, -0.5]);
        assert_eq!(weight, vec![vec![1., 2., 3.], vec![4., 5., 6.]]);

        for wrapped in ["wrapped_state_dict.pth", "wrapped_model.pth"] {
            let state = read_state_dict(&fixture(wrapped), CheckpointFormat::Pytorch).unwrap();
            let mut wrapped_names: Vec<_> = state.keys().cloned().collect();
            wrapped_names.sort();

            assert_eq!(wrapped_names, names, "{}", wrapped);
            assert_eq!(state["head.bias"].to_vec1::<f32>().unwrap(), bias);
            assert_eq!(state["head.weight"].to_vec2::<f32>().unwrap(), weight);
        }
    }
}
