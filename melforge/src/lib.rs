//! Melforge - Two-stage neural text-to-speech inference
//!
//! Token ids go through an acoustic model (FastSpeech2-style, tokens -> mel
//! spectrogram), the mel goes through a vocoder (mel -> waveform), and the
//! waveform is written as a mono 32-bit float WAV.
//!
//! Models are black boxes behind [`InferenceModel`]; enable the `onnx`
//! feature for an ONNX Runtime backed implementation.

// Core modules
pub mod adapter;
pub mod config;
pub mod export;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pipeline;
pub mod tensor;

/// Output sample rate used when the caller does not pick one (Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

// Re-export main types for convenience
pub use adapter::{AdapterError, EngineError, InferenceModel, ModelSignature, Slot};
pub use config::{AcousticSignature, ConfigError, PipelineConfig, VocoderSignature};
pub use export::{export_wav, inspect_wav, AudioFileDescriptor, ExportError};
#[cfg(feature = "onnx")]
pub use onnx::OnnxModel;
pub use pipeline::{
    AcousticFeatures, Conditioning, LogEventSink, NoopEventSink, PipelineState, Stage,
    SynthesisError, SynthesisEvent, SynthesisEventSink, SynthesisPipeline, SynthesisReport,
    SynthesisRequest, SynthesizedAudio,
};
pub use tensor::{
    copy_tensor, ElementType, EngineTensor, NamedTensor, TensorBuffer, TensorData, TensorElement,
    TensorError, TensorSet, WaveformBuffer,
};
