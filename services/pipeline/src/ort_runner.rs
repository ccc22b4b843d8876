//! ONNX Runtime backend for [`ModelRunner`].

use crate::model::{top1, ClassScore, ModelError, ModelRunner};
use ndarray::{Array2, Array4, Axis, Ix2};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::path::Path;
use std::sync::Mutex;

fn runtime(e: ort::Error) -> ModelError {
    ModelError::Runtime(e.to_string())
}

/// ONNX classifier producing one row of logits per input image.
///
/// CUDA is registered first; ONNX Runtime falls back to the CPU provider when
/// no device is available.
pub struct OrtModelRunner {
    session: Mutex<Session>,
    num_classes: usize,
}

impl OrtModelRunner {
    pub fn load(model_path: &Path, input_size: u32) -> Result<Self, ModelError> {
        ort::init()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .commit()
            .map_err(runtime)?;

        let session = Session::builder()
            .map_err(runtime)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(runtime)?
            .commit_from_file(model_path)
            .map_err(runtime)?;

        let mut runner = Self {
            session: Mutex::new(session),
            num_classes: 0,
        };

        // Output cardinality is read from a probe run rather than graph
        // metadata, which may leave the class dimension symbolic.
        let edge = input_size as usize;
        let probe = Array4::<f32>::zeros((1, 3, edge, edge));
        let logits = runner.run(&probe)?;
        if logits.ncols() == 0 {
            return Err(ModelError::OutputShape("model reports zero classes".to_string()));
        }
        runner.num_classes = logits.ncols();

        tracing::info!(
            path = %model_path.display(),
            classes = runner.num_classes,
            "Loaded ONNX model"
        );

        Ok(runner)
    }

    fn run(&self, input: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| ModelError::Runtime(format!("session mutex poisoned: {}", e)))?;

        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| ModelError::Runtime(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Runtime(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Runtime(format!("failed to extract tensor: {}", e)))?;

        let logits = ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| ModelError::OutputShape(e.to_string()))?
            .into_dimensionality::<Ix2>()
            .map_err(|e| ModelError::OutputShape(e.to_string()))?;

        if logits.len_of(Axis(0)) != input.len_of(Axis(0)) {
            return Err(ModelError::OutputShape(format!(
                "{} rows for a batch of {}",
                logits.len_of(Axis(0)),
                input.len_of(Axis(0))
            )));
        }

        Ok(logits)
    }
}

impl ModelRunner for OrtModelRunner {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, batch: &Array4<f32>) -> Result<Vec<ClassScore>, ModelError> {
        let logits = self.run(batch)?;
        Ok(top1(logits.view()))
    }
}
