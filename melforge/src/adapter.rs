//! Black-box model invocation.
//!
//! Acoustic models and vocoders are interchangeable implementations of
//! [`InferenceModel`]. [`run`] checks the requested slot names against the
//! model's declared signature and normalises engine failures; it does not look
//! at shapes or dtypes (see [`crate::tensor::copy_tensor`]).

use std::fmt;
use std::time::Instant;

use crate::tensor::{EngineTensor, TensorSet};

/// Declared interface of a loaded model
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelSignature {
    /// Label used in logs and errors (usually the model file stem)
    pub model: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl ModelSignature {
    pub fn new<I, O>(model: impl Into<String>, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            model: model.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|input| input == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output == name)
    }
}

/// Error raised by an inference engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Engine error: {0}")]
    Runtime(String),
}

impl EngineError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

/// A loaded model exposing named-signature invocation.
pub trait InferenceModel {
    fn signature(&self) -> &ModelSignature;

    /// Run the model once. Returns one tensor per requested output name, in
    /// the requested order. Names have already been checked by [`run`].
    fn invoke(
        &mut self,
        inputs: &TensorSet,
        output_names: &[&str],
    ) -> Result<Vec<EngineTensor>, EngineError>;
}

impl<M: InferenceModel + ?Sized> InferenceModel for Box<M> {
    fn signature(&self) -> &ModelSignature {
        (**self).signature()
    }

    fn invoke(
        &mut self,
        inputs: &TensorSet,
        output_names: &[&str],
    ) -> Result<Vec<EngineTensor>, EngineError> {
        (**self).invoke(inputs, output_names)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Input,
    Output,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Model '{model}' declares no {slot} named '{name}'")]
    UnknownSignatureName {
        model: String,
        slot: Slot,
        name: String,
    },

    #[error("Inference failed in model '{model}': {message}")]
    InferenceFailure { model: String, message: String },
}

/// Invoke `model` with named inputs and return the requested outputs in the
/// order they were requested. Single-shot, no retries.
pub fn run<M: InferenceModel + ?Sized>(
    model: &mut M,
    inputs: &TensorSet,
    output_names: &[&str],
) -> Result<Vec<EngineTensor>, AdapterError> {
    let signature = model.signature();
    let label = signature.model.clone();

    if let Some(name) = inputs.names().find(|name| !signature.has_input(name)) {
        return Err(AdapterError::UnknownSignatureName {
            model: label,
            slot: Slot::Input,
            name: name.to_string(),
        });
    }

    if let Some(name) = output_names.iter().find(|name| !signature.has_output(name)) {
        return Err(AdapterError::UnknownSignatureName {
            model: label,
            slot: Slot::Output,
            name: name.to_string(),
        });
    }

    log::debug!(
        "[{}] invoking with inputs {:?}, requesting {:?}",
        label,
        inputs.names().collect::<Vec<_>>(),
        output_names
    );

    let started = Instant::now();
    let outputs = model
        .invoke(inputs, output_names)
        .map_err(|e| AdapterError::InferenceFailure {
            model: label.clone(),
            message: e.to_string(),
        })?;

    if outputs.len() != output_names.len() {
        return Err(AdapterError::InferenceFailure {
            model: label,
            message: format!(
                "engine returned {} outputs for {} requested",
                outputs.len(),
                output_names.len()
            ),
        });
    }

    log::debug!(
        "[{}] inference finished in {}ms",
        label,
        started.elapsed().as_millis()
    );

    Ok(outputs)
}
