// Melforge - WAV export
// Mono, 32-bit IEEE float, uncompressed RIFF/WAVE.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 32;

// RIFF size fields are u32; leave room for the header chunks.
const HEADER_RESERVE_BYTES: u64 = 4096;
const MAX_SAMPLES: u64 = (u32::MAX as u64 - HEADER_RESERVE_BYTES) / (BITS_PER_SAMPLE as u64 / 8);

/// What a written (or inspected) audio file contains
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AudioFileDescriptor {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub sample_count: u32,
    pub float_samples: bool,
}

impl AudioFileDescriptor {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            0
        } else {
            (self.sample_count as u64 * 1000) / self.sample_rate as u64
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Sample rate must be greater than 0")]
    InvalidSampleRate,

    #[error("Waveform of {samples} samples does not fit in a WAV file")]
    TooLong { samples: usize },

    #[error("Failed to write WAV {path}: {source}")]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: CHANNELS,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Float,
    }
}

/// Write `samples` to `path` as a mono 32-bit float WAV.
///
/// The file is assembled next to the target under a per-call
/// `<name>.<pid>-<nanos>.partial` name, created exclusively, and renamed into
/// place once the header is finalised. The target path either holds a complete
/// file or is left untouched, and no pre-existing file other than the target is
/// ever overwritten. An empty `samples` slice produces a valid zero-length
/// recording.
pub fn export_wav<P: AsRef<Path>>(
    path: P,
    samples: &[f32],
    sample_rate: u32,
) -> Result<AudioFileDescriptor, ExportError> {
    let path = path.as_ref();
    if sample_rate == 0 {
        return Err(ExportError::InvalidSampleRate);
    }
    let sample_count = checked_sample_count(samples.len())?;

    if samples.is_empty() {
        log::warn!("Exporting empty waveform to {}", path.display());
    }

    let partial = partial_path(path);
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&partial)
        .map_err(|source| ExportError::Io {
            path: partial.clone(),
            source,
        })?;

    if let Err(e) = write_samples(file, &partial, samples, sample_rate) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    if let Err(source) = fs::rename(&partial, path) {
        let _ = fs::remove_file(&partial);
        return Err(ExportError::Io {
            path: path.to_path_buf(),
            source,
        });
    }

    log::info!(
        "Wrote {} samples ({} Hz, mono, f32) to {}",
        samples.len(),
        sample_rate,
        path.display()
    );

    Ok(AudioFileDescriptor {
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        channels: CHANNELS,
        sample_count,
        float_samples: true,
    })
}

fn checked_sample_count(len: usize) -> Result<u32, ExportError> {
    let too_long = ExportError::TooLong { samples: len };
    if len as u64 > MAX_SAMPLES {
        return Err(too_long);
    }
    u32::try_from(len).map_err(|_| too_long)
}

fn write_samples(
    file: fs::File,
    path: &Path,
    samples: &[f32],
    sample_rate: u32,
) -> Result<(), ExportError> {
    let wav_err = |source: hound::Error| ExportError::Wav {
        path: path.to_path_buf(),
        source,
    };

    let mut writer =
        hound::WavWriter::new(BufWriter::new(file), wav_spec(sample_rate)).map_err(wav_err)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)
}

fn partial_path(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    path.with_file_name(format!(
        "{}.{}-{}.partial",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        nanos
    ))
}

/// Read back the header of a WAV file.
pub fn inspect_wav<P: AsRef<Path>>(path: P) -> Result<AudioFileDescriptor, ExportError> {
    let path = path.as_ref();
    let reader = hound::WavReader::open(path).map_err(|source| ExportError::Wav {
        path: path.to_path_buf(),
        source,
    })?;
    let spec = reader.spec();

    Ok(AudioFileDescriptor {
        sample_rate: spec.sample_rate,
        bits_per_sample: spec.bits_per_sample,
        channels: spec.channels,
        sample_count: reader.duration(),
        float_samples: spec.sample_format == hound::SampleFormat::Float,
    })
}
