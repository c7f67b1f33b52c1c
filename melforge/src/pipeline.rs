//! Synthesis Pipeline - token ids -> mel spectrogram -> waveform -> WAV
//!
//! Owns an acoustic model and a vocoder (any [`InferenceModel`]) and drives
//! one utterance at a time through them. Each stage runs exactly once; the
//! first failure ends the run in [`PipelineState::Failed`] carrying the stage.
//! Consumers implement [`SynthesisEventSink`] to observe state changes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};

use crate::adapter::{self, AdapterError, InferenceModel};
use crate::config::{AcousticSignature, PipelineConfig, VocoderSignature};
use crate::export::{self, AudioFileDescriptor, ExportError};
use crate::tensor::{copy_tensor, EngineTensor, TensorBuffer, TensorError, TensorSet, WaveformBuffer};
use crate::DEFAULT_SAMPLE_RATE;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    TokensReady,
    AcousticFeaturesReady,
    WaveformReady,
    Exported,
    Succeeded,
    Failed(Stage),
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

/// Stage in which a synthesis run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Input,
    Acoustic,
    Vocoder,
    Export,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Acoustic => "acoustic",
            Self::Vocoder => "vocoder",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the synthesis pipeline
#[derive(Debug, Clone)]
pub enum SynthesisEvent {
    StateChanged { state: PipelineState },
    Failed { stage: Stage, message: String },
}

/// Trait for receiving synthesis pipeline events
pub trait SynthesisEventSink: Send + Sync {
    fn on_event(&self, event: SynthesisEvent);
}

/// No-op event sink (silent operation)
pub struct NoopEventSink;
impl SynthesisEventSink for NoopEventSink {
    fn on_event(&self, _event: SynthesisEvent) {}
}

/// Logging event sink
pub struct LogEventSink;
impl SynthesisEventSink for LogEventSink {
    fn on_event(&self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::StateChanged { state } => {
                log::debug!("[Synthesis] State: {:?}", state)
            }
            SynthesisEvent::Failed { stage, message } => {
                log::error!("[Synthesis] {} stage failed: {}", stage, message)
            }
        }
    }
}

/// Scalar conditioning fed to the acoustic model alongside the tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Conditioning {
    pub energy_ratio: f32,
    pub f0_ratio: f32,
    pub speaker_id: i32,
    pub speed_ratio: f32,
}

impl Default for Conditioning {
    fn default() -> Self {
        Self {
            energy_ratio: 1.0,
            f0_ratio: 1.0,
            speaker_id: 0,
            speed_ratio: 1.0,
        }
    }
}

impl Conditioning {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("energy_ratio", self.energy_ratio),
            ("f0_ratio", self.f0_ratio),
            ("speed_ratio", self.speed_ratio),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{name} must be finite and > 0, got {value}"));
            }
        }
        if self.speaker_id < 0 {
            return Err(format!("speaker_id must be >= 0, got {}", self.speaker_id));
        }
        Ok(())
    }
}

/// One utterance to synthesize
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub token_ids: Vec<i32>,
    pub conditioning: Conditioning,
    pub output_path: PathBuf,
    pub sample_rate: u32,
}

impl SynthesisRequest {
    pub fn new(token_ids: Vec<i32>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            token_ids,
            conditioning: Conditioning::default(),
            output_path: output_path.into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    pub fn with_conditioning(mut self, conditioning: Conditioning) -> Self {
        self.conditioning = conditioning;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }
}

/// Outputs of the acoustic model, copied out of the engine.
///
/// Durations and pitch are reported but not consumed by later stages.
#[derive(Debug, Clone, PartialEq)]
pub struct AcousticFeatures {
    pub mel: TensorBuffer<f32>,
    pub durations: TensorBuffer<i32>,
    pub pitch: Option<TensorBuffer<f32>>,
}

impl AcousticFeatures {
    /// Sum of predicted per-token durations, in mel frames
    pub fn total_duration_frames(&self) -> i64 {
        self.durations.data().iter().map(|&d| d as i64).sum()
    }
}

/// In-memory result of the two inference stages
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub features: AcousticFeatures,
    pub waveform: WaveformBuffer,
    pub acoustic_ms: u64,
    pub vocoder_ms: u64,
}

/// Summary of a successful synthesis run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisReport {
    pub output_path: PathBuf,
    pub audio: AudioFileDescriptor,
    pub token_count: usize,
    pub mel_shape: Vec<i64>,
    pub duration_frames: i64,
    pub acoustic_ms: u64,
    pub vocoder_ms: u64,
    pub export_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Acoustic model failed: {0}")]
    AcousticInference(#[source] AdapterError),

    #[error("Acoustic model output rejected: {0}")]
    AcousticOutput(#[source] TensorError),

    #[error("Vocoder failed: {0}")]
    VocoderInference(#[source] AdapterError),

    #[error("Vocoder output rejected: {0}")]
    VocoderOutput(#[source] TensorError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}

impl SynthesisError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidInput(_) => Stage::Input,
            Self::AcousticInference(_) | Self::AcousticOutput(_) => Stage::Acoustic,
            Self::VocoderInference(_) | Self::VocoderOutput(_) => Stage::Vocoder,
            Self::Export(_) => Stage::Export,
        }
    }
}

/// Acoustic model + vocoder, owned by the caller's pipeline instance
pub struct SynthesisPipeline<A, V> {
    acoustic: A,
    vocoder: V,
    acoustic_signature: AcousticSignature,
    vocoder_signature: VocoderSignature,
    state: PipelineState,
    event_sink: Arc<dyn SynthesisEventSink>,
}

impl<A: InferenceModel, V: InferenceModel> SynthesisPipeline<A, V> {
    /// Create a pipeline using the default serving signature names
    pub fn new(acoustic: A, vocoder: V) -> Self {
        Self {
            acoustic,
            vocoder,
            acoustic_signature: AcousticSignature::default(),
            vocoder_signature: VocoderSignature::default(),
            state: PipelineState::Idle,
            event_sink: Arc::new(NoopEventSink),
        }
    }

    /// Create a pipeline using the signature names from `config`
    pub fn from_config(acoustic: A, vocoder: V, config: &PipelineConfig) -> Self {
        Self::new(acoustic, vocoder).with_signatures(config.acoustic.clone(), config.vocoder.clone())
    }

    pub fn with_signatures(mut self, acoustic: AcousticSignature, vocoder: VocoderSignature) -> Self {
        self.acoustic_signature = acoustic;
        self.vocoder_signature = vocoder;
        self
    }

    pub fn with_event_sink(mut self, event_sink: Arc<dyn SynthesisEventSink>) -> Self {
        self.event_sink = event_sink;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn acoustic_model(&self) -> &A {
        &self.acoustic
    }

    pub fn vocoder_model(&self) -> &V {
        &self.vocoder
    }

    /// Idle -> TokensReady: validate and wrap tokens plus conditioning as
    /// the acoustic model's five named inputs.
    pub fn prepare_inputs(
        &mut self,
        token_ids: &[i32],
        conditioning: &Conditioning,
    ) -> Result<TensorSet, SynthesisError> {
        let result = self.build_inputs(token_ids, conditioning);
        self.finish_stage(result, PipelineState::TokensReady)
    }

    /// TokensReady -> AcousticFeaturesReady
    pub fn run_acoustic(&mut self, inputs: &TensorSet) -> Result<AcousticFeatures, SynthesisError> {
        let result = self.acoustic_features(inputs);
        self.finish_stage(result, PipelineState::AcousticFeaturesReady)
    }

    /// AcousticFeaturesReady -> WaveformReady. The mel buffer is handed to
    /// the vocoder with its data and shape untouched.
    pub fn run_vocoder(&mut self, mel: &TensorBuffer<f32>) -> Result<WaveformBuffer, SynthesisError> {
        let result = self.waveform(mel);
        self.finish_stage(result, PipelineState::WaveformReady)
    }

    /// Run both inference stages without touching the filesystem
    pub fn synthesize_waveform(
        &mut self,
        token_ids: &[i32],
        conditioning: &Conditioning,
    ) -> Result<SynthesizedAudio, SynthesisError> {
        self.transition(PipelineState::Idle);

        let inputs = self.prepare_inputs(token_ids, conditioning)?;

        let started = Instant::now();
        let features = self.run_acoustic(&inputs)?;
        let acoustic_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let waveform = self.run_vocoder(&features.mel)?;
        let vocoder_ms = started.elapsed().as_millis() as u64;

        Ok(SynthesizedAudio {
            features,
            waveform,
            acoustic_ms,
            vocoder_ms,
        })
    }

    /// Synthesize one utterance to a WAV file
    pub fn synthesize(&mut self, request: &SynthesisRequest) -> Result<SynthesisReport, SynthesisError> {
        self.transition(PipelineState::Idle);

        if request.sample_rate == 0 {
            let err = SynthesisError::InvalidInput("sample_rate must be greater than 0".to_string());
            self.fail(&err);
            return Err(err);
        }

        let audio = self.synthesize_waveform(&request.token_ids, &request.conditioning)?;

        let started = Instant::now();
        let exported = export::export_wav(
            &request.output_path,
            audio.waveform.samples(),
            request.sample_rate,
        )
        .map_err(SynthesisError::from);
        let descriptor = self.finish_stage(exported, PipelineState::Exported)?;
        let export_ms = started.elapsed().as_millis() as u64;

        let report = SynthesisReport {
            output_path: request.output_path.clone(),
            audio: descriptor,
            token_count: request.token_ids.len(),
            mel_shape: audio.features.mel.shape().to_vec(),
            duration_frames: audio.features.total_duration_frames(),
            acoustic_ms: audio.acoustic_ms,
            vocoder_ms: audio.vocoder_ms,
            export_ms,
        };

        self.transition(PipelineState::Succeeded);
        log::info!(
            "Synthesized {} tokens -> {} samples ({} ms audio) in {}ms",
            report.token_count,
            report.audio.sample_count,
            report.audio.duration_ms(),
            report.acoustic_ms + report.vocoder_ms + report.export_ms
        );

        Ok(report)
    }

    fn build_inputs(
        &self,
        token_ids: &[i32],
        conditioning: &Conditioning,
    ) -> Result<TensorSet, SynthesisError> {
        if token_ids.is_empty() {
            return Err(SynthesisError::InvalidInput(
                "token sequence must not be empty".to_string(),
            ));
        }
        conditioning.validate().map_err(SynthesisError::InvalidInput)?;

        let ids = Array1::from(token_ids.to_vec()).insert_axis(Axis(0)).into_dyn();
        let ids = TensorBuffer::from_array(ids);
        log::debug!("Token ids wrapped as {:?}", ids.shape());

        let names = &self.acoustic_signature;
        let mut inputs = TensorSet::with_capacity(5);
        inputs
            .insert(names.input_ids.as_str(), ids.into_engine())
            .insert(
                names.speaker_ids.as_str(),
                EngineTensor::scalar(conditioning.speaker_id),
            )
            .insert(
                names.energy_ratios.as_str(),
                EngineTensor::scalar(conditioning.energy_ratio),
            )
            .insert(
                names.f0_ratios.as_str(),
                EngineTensor::scalar(conditioning.f0_ratio),
            )
            .insert(
                names.speed_ratios.as_str(),
                EngineTensor::scalar(conditioning.speed_ratio),
            );

        Ok(inputs)
    }

    fn acoustic_features(&mut self, inputs: &TensorSet) -> Result<AcousticFeatures, SynthesisError> {
        let output_names = self.acoustic_signature.output_names();
        let outputs = adapter::run(&mut self.acoustic, inputs, &output_names)
            .map_err(SynthesisError::AcousticInference)?;

        // run() guarantees one tensor per requested name: mel, durations[, pitch]
        let mel = copy_tensor::<f32>(&outputs[0]).map_err(SynthesisError::AcousticOutput)?;
        let durations = copy_tensor::<i32>(&outputs[1]).map_err(SynthesisError::AcousticOutput)?;
        let pitch = outputs
            .get(2)
            .map(copy_tensor::<f32>)
            .transpose()
            .map_err(SynthesisError::AcousticOutput)?;

        log::debug!(
            "Acoustic features: mel {:?}, durations {:?}, pitch {:?}",
            mel.shape(),
            durations.shape(),
            pitch.as_ref().map(|p| p.shape().to_vec())
        );

        Ok(AcousticFeatures {
            mel,
            durations,
            pitch,
        })
    }

    fn waveform(&mut self, mel: &TensorBuffer<f32>) -> Result<WaveformBuffer, SynthesisError> {
        let mut inputs = TensorSet::with_capacity(1);
        inputs.insert(self.vocoder_signature.mel_input.as_str(), mel.to_engine());

        let output_names = [self.vocoder_signature.audio_output.as_str()];
        let outputs = adapter::run(&mut self.vocoder, &inputs, &output_names)
            .map_err(SynthesisError::VocoderInference)?;

        let audio = copy_tensor::<f32>(&outputs[0]).map_err(SynthesisError::VocoderOutput)?;
        let waveform = WaveformBuffer::from_tensor(audio).map_err(SynthesisError::VocoderOutput)?;
        log::debug!(
            "Vocoder produced {} samples from {:?}",
            waveform.len(),
            waveform.source_shape()
        );

        Ok(waveform)
    }

    fn finish_stage<T>(
        &mut self,
        result: Result<T, SynthesisError>,
        next: PipelineState,
    ) -> Result<T, SynthesisError> {
        match result {
            Ok(value) => {
                self.transition(next);
                Ok(value)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn transition(&mut self, state: PipelineState) {
        if self.state != state {
            self.state = state;
            self.event_sink.on_event(SynthesisEvent::StateChanged { state });
        }
    }

    fn fail(&mut self, err: &SynthesisError) {
        let stage = err.stage();
        self.transition(PipelineState::Failed(stage));
        self.event_sink.on_event(SynthesisEvent::Failed {
            stage,
            message: err.to_string(),
        });
    }
}
