// Melforge - Pipeline configuration
// JSON file naming the two models, their signature slots and the output format.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::DEFAULT_SAMPLE_RATE;

const DEFAULT_INTRA_THREADS: usize = 2;

/// Signature names of the acoustic (token -> mel) model.
///
/// Defaults match the TensorFlowTTS FastSpeech2 / LightSpeech serving signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcousticSignature {
    pub input_ids: String,
    pub speaker_ids: String,
    pub energy_ratios: String,
    pub f0_ratios: String,
    pub speed_ratios: String,
    pub mel_output: String,
    pub duration_output: String,
    /// Pitch contour output. Copied and reported when set; `null` skips it.
    pub pitch_output: Option<String>,
}

impl Default for AcousticSignature {
    fn default() -> Self {
        Self {
            input_ids: "serving_default_input_ids:0".to_string(),
            speaker_ids: "serving_default_speaker_ids:0".to_string(),
            energy_ratios: "serving_default_energy_ratios:0".to_string(),
            f0_ratios: "serving_default_f0_ratios:0".to_string(),
            speed_ratios: "serving_default_speed_ratios:0".to_string(),
            mel_output: "StatefulPartitionedCall:0".to_string(),
            duration_output: "StatefulPartitionedCall:1".to_string(),
            pitch_output: Some("StatefulPartitionedCall:2".to_string()),
        }
    }
}

impl AcousticSignature {
    pub fn input_names(&self) -> [&str; 5] {
        [
            &self.input_ids,
            &self.speaker_ids,
            &self.energy_ratios,
            &self.f0_ratios,
            &self.speed_ratios,
        ]
    }

    /// Outputs to request, in order: mel, durations, then pitch if configured.
    pub fn output_names(&self) -> Vec<&str> {
        let mut names = vec![self.mel_output.as_str(), self.duration_output.as_str()];
        if let Some(pitch) = &self.pitch_output {
            names.push(pitch.as_str());
        }
        names
    }
}

/// Signature names of the vocoder (mel -> waveform) model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VocoderSignature {
    pub mel_input: String,
    pub audio_output: String,
}

impl Default for VocoderSignature {
    fn default() -> Self {
        Self {
            mel_input: "serving_default_mels:0".to_string(),
            audio_output: "StatefulPartitionedCall:0".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub acoustic_model: PathBuf,
    pub vocoder_model: PathBuf,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    #[serde(default)]
    pub acoustic: AcousticSignature,
    #[serde(default)]
    pub vocoder: VocoderSignature,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_intra_threads() -> usize {
    DEFAULT_INTRA_THREADS
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn new<A: Into<PathBuf>, V: Into<PathBuf>>(acoustic_model: A, vocoder_model: V) -> Self {
        Self {
            acoustic_model: acoustic_model.into(),
            vocoder_model: vocoder_model.into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            intra_threads: DEFAULT_INTRA_THREADS,
            acoustic: AcousticSignature::default(),
            vocoder: VocoderSignature::default(),
        }
    }

    /// Load from a JSON file. Relative model paths resolve against the
    /// directory containing the config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(base) = path.parent() {
            config.acoustic_model = resolve(base, &config.acoustic_model);
            config.vocoder_model = resolve(base, &config.vocoder_model);
        }

        config.validate()?;

        log::info!(
            "Loaded pipeline config from {:?} (acoustic: {:?}, vocoder: {:?}, {} Hz)",
            path,
            config.acoustic_model,
            config.vocoder_model,
            config.sample_rate
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "sample_rate must be greater than 0".to_string(),
            ));
        }
        if self.intra_threads == 0 {
            return Err(ConfigError::Invalid(
                "intra_threads must be greater than 0".to_string(),
            ));
        }

        let acoustic_inputs = self.acoustic.input_names();
        let acoustic_outputs = self.acoustic.output_names();
        let vocoder_names = [self.vocoder.mel_input.as_str(), self.vocoder.audio_output.as_str()];
        let names = acoustic_inputs
            .iter()
            .chain(acoustic_outputs.iter())
            .chain(vocoder_names.iter());
        for name in names {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "signature names must not be empty".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = acoustic_inputs.iter().find(|name| !seen.insert(**name)) {
            return Err(ConfigError::Invalid(format!(
                "acoustic input '{}' is mapped more than once",
                duplicate
            )));
        }

        Ok(())
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
