// Melforge - ONNX Runtime models
// Acoustic models and vocoders exported to ONNX, run through ort.

use std::borrow::Cow;
use std::path::Path;

use ort::{
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue, SessionInputs},
    value::{DynValue, Tensor},
};

use crate::adapter::{EngineError, InferenceModel, ModelSignature};
use crate::tensor::{EngineTensor, TensorData, TensorSet};

impl From<ort::Error> for EngineError {
    fn from(e: ort::Error) -> Self {
        EngineError::Runtime(e.to_string())
    }
}

/// An ONNX model loaded into its own session
pub struct OnnxModel {
    session: Session,
    signature: ModelSignature,
}

impl OnnxModel {
    pub fn load<P: AsRef<Path>>(path: P, intra_threads: usize) -> Result<Self, EngineError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EngineError::ModelNotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(path)?;

        let label = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let signature = ModelSignature::new(
            label,
            session.inputs().iter().map(|i| i.name().to_string()),
            session.outputs().iter().map(|o| o.name().to_string()),
        );

        log::info!(
            "Loaded ONNX model '{}' ({} threads): inputs {:?}, outputs {:?}",
            signature.model,
            intra_threads,
            signature.inputs,
            signature.outputs
        );

        Ok(Self { session, signature })
    }
}

impl InferenceModel for OnnxModel {
    fn signature(&self) -> &ModelSignature {
        &self.signature
    }

    fn invoke(
        &mut self,
        inputs: &TensorSet,
        output_names: &[&str],
    ) -> Result<Vec<EngineTensor>, EngineError> {
        let mut values: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for named in inputs {
            values.push((
                Cow::Owned(named.name.clone()),
                SessionInputValue::Owned(to_value(&named.tensor)?),
            ));
        }

        let outputs = self.session.run(SessionInputs::from(values))?;

        output_names
            .iter()
            .map(|&name| {
                let value = outputs
                    .get(name)
                    .ok_or_else(|| EngineError::runtime(format!("no output named '{}'", name)))?;
                from_value(value)
            })
            .collect()
    }
}

fn to_value(tensor: &EngineTensor) -> Result<DynValue, EngineError> {
    let shape = tensor
        .shape()
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<Result<Vec<usize>, _>>()
        .map_err(|_| EngineError::runtime(format!("negative input dimension in {:?}", tensor.shape())))?;

    let value = match tensor.data() {
        TensorData::Float32(values) => Tensor::from_array((shape, values.clone()))?.into_dyn(),
        TensorData::Int32(values) => Tensor::from_array((shape, values.clone()))?.into_dyn(),
        TensorData::Int64(values) => Tensor::from_array((shape, values.clone()))?.into_dyn(),
    };
    Ok(value)
}

fn from_value(value: &DynValue) -> Result<EngineTensor, EngineError> {
    if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        return Ok(EngineTensor::from_values(shape.to_vec(), data.to_vec()));
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<i32>() {
        return Ok(EngineTensor::from_values(shape.to_vec(), data.to_vec()));
    }
    let (shape, data) = value.try_extract_tensor::<i64>()?;
    Ok(EngineTensor::from_values(shape.to_vec(), data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_file_is_reported_before_touching_the_runtime() {
        let result = OnnxModel::load("/nonexistent/melforge/fastspeech2.onnx", 1);
        assert!(matches!(result, Err(EngineError::ModelNotFound(_))));
    }
}
