use crate::{
    config::DevicePreference,
    error::{ClassifierError, ClassifierResult},
    model_service::Classifier,
    preprocess::InputTensor,
};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

fn cuda_available() -> bool {
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

/// Classifier backed by an ONNX export, served from a pool of sessions.
pub struct OrtClassifier {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    output_name: String,
    num_classes: usize,
    device: &'static str,
}

impl OrtClassifier {
    pub fn new(
        path: &Path,
        num_classes: usize,
        num_instances: usize,
        preference: DevicePreference,
    ) -> ClassifierResult<Self> {
        let use_cuda = match preference {
            DevicePreference::Cpu => false,
            DevicePreference::Auto => cuda_available(),
            DevicePreference::Cuda => {
                if !cuda_available() {
                    return Err(ClassifierError::Checkpoint(
                        "CUDA execution provider requested but unavailable".to_string(),
                    ));
                }
                true
            }
        };

        let sessions = (0..num_instances.max(1))
            .map(|_| {
                let mut builder =
                    Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
                if use_cuda {
                    builder = builder
                        .with_execution_providers([CUDAExecutionProvider::default().build()])?;
                }
                Ok(Mutex::new(builder.commit_from_file(path)?))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ClassifierError::Checkpoint(format!("{:?}: {}", path, e)))?;

        let output_name = {
            let session = sessions[0]
                .lock()
                .map_err(|e| ClassifierError::Checkpoint(format!("session mutex poisoned: {}", e)))?;
            let output = session.outputs.first().ok_or_else(|| {
                ClassifierError::Checkpoint(format!("{:?} declares no outputs", path))
            })?;
            if let Some(&classes) = output
                .output_type
                .tensor_shape()
                .and_then(|dims| dims.last())
            {
                // Dynamic dimensions are reported as -1.
                if classes > 0 && classes as usize != num_classes {
                    return Err(ClassifierError::ShapeMismatch(format!(
                        "graph output `{}` has {} classes, expected {}",
                        output.name, classes, num_classes
                    )));
                }
            }
            output.name.clone()
        };

        tracing::info!(
            "Created {} ONNX sessions on {}",
            sessions.len(),
            if use_cuda { "cuda" } else { "cpu" }
        );

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            output_name,
            num_classes,
            device: if use_cuda { "cuda" } else { "cpu" },
        })
    }
}

impl Classifier for OrtClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn device(&self) -> &str {
        self.device
    }

    fn logits(&self, input: &InputTensor) -> ClassifierResult<Vec<f32>> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ClassifierError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)?;
        let outputs = session.run(ort::inputs![tensor_ref])?;
        let (_, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

        Ok(data.to_vec())
    }
}
