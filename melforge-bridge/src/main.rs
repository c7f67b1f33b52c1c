mod protocol;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use env_logger::Env;
use melforge::{
    inspect_wav, Conditioning, InferenceModel, LogEventSink, PipelineConfig, SynthesisError,
    SynthesisPipeline, SynthesisRequest, DEFAULT_SAMPLE_RATE,
};
use protocol::{
    ErrorCode, RequestEnvelope, ResponseEnvelope, RpcError, RpcMethod, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

const UNKNOWN_REQUEST_ID: &str = "_unknown";

type DynModel = Box<dyn InferenceModel>;

/// JSON-lines bridge to the melforge synthesis pipeline
#[derive(Parser, Debug)]
#[command(name = "melforge-bridge", version, about)]
struct Cli {
    /// Pipeline config (JSON) naming the acoustic model and vocoder
    #[arg(long, env = "MELFORGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Default)]
struct BridgeState {
    config_path: Option<PathBuf>,
    config: Option<PipelineConfig>,
    config_error: Option<String>,
    pipeline: Option<SynthesisPipeline<DynModel, DynModel>>,
}

impl BridgeState {
    fn from_cli(cli: &Cli) -> Self {
        let mut state = Self {
            config_path: cli.config.clone(),
            ..Self::default()
        };

        if let Some(path) = &cli.config {
            match PipelineConfig::from_json_file(path) {
                Ok(config) => state.config = Some(config),
                Err(err) => {
                    log::error!("[bridge] {err}");
                    state.config_error = Some(err.to_string());
                }
            }
        }

        state
    }

    fn pipeline_config(&self) -> Result<&PipelineConfig, RpcError> {
        if let Some(err) = &self.config_error {
            return Err(RpcError::new(ErrorCode::ConfigInvalid, err.clone()));
        }
        self.config.as_ref().ok_or_else(|| {
            RpcError::new(
                ErrorCode::ModelMissing,
                "No pipeline config (pass --config or set MELFORGE_CONFIG)",
            )
        })
    }

    fn default_sample_rate(&self) -> u32 {
        self.config
            .as_ref()
            .map_or(DEFAULT_SAMPLE_RATE, |config| config.sample_rate)
    }
}

struct MethodOutcome {
    result: Value,
    should_shutdown: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TtsSynthesizeParams {
    token_ids: Vec<i32>,
    #[serde(default)]
    conditioning: Conditioning,
    output_path: String,
    #[serde(default)]
    sample_rate: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AudioInspectParams {
    path: String,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        log::error!("[bridge] fatal error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut state = BridgeState::from_cli(cli);

    for line_result in stdin.lock().lines() {
        let line = match line_result {
            Ok(line) => line,
            Err(err) => {
                log::error!("[bridge] stdin read error: {err}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let started = Instant::now();

        let (response, should_shutdown) = if line.len() > MAX_REQUEST_BYTES {
            let fallback_id =
                extract_request_id(&line).unwrap_or_else(|| UNKNOWN_REQUEST_ID.to_string());
            (
                ResponseEnvelope::err(
                    fallback_id,
                    RpcError::new(
                        ErrorCode::PayloadTooLarge,
                        format!(
                            "Request exceeds max size ({} > {})",
                            line.len(),
                            MAX_REQUEST_BYTES
                        ),
                    ),
                ),
                false,
            )
        } else {
            handle_line(&line, &mut state)
        };

        write_response(&mut stdout, &response)?;

        log::info!(
            "[bridge] id={} ok={} latency_ms={}",
            response.id,
            response.ok,
            started.elapsed().as_millis()
        );

        if should_shutdown {
            break;
        }
    }

    Ok(())
}

fn handle_line(line: &str, state: &mut BridgeState) -> (ResponseEnvelope, bool) {
    let json_value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            return (
                ResponseEnvelope::err(
                    UNKNOWN_REQUEST_ID,
                    RpcError::new(
                        ErrorCode::ParseError,
                        format!("Invalid JSON request: {err}"),
                    ),
                ),
                false,
            );
        }
    };

    let request_id = json_value
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(UNKNOWN_REQUEST_ID)
        .to_string();

    let request: RequestEnvelope = match serde_json::from_value(json_value) {
        Ok(request) => request,
        Err(err) => {
            return (
                ResponseEnvelope::err(
                    request_id,
                    RpcError::new(
                        ErrorCode::InvalidRequest,
                        format!("Invalid request envelope: {err}"),
                    ),
                ),
                false,
            );
        }
    };

    if request.message_type != "request" {
        return (
            ResponseEnvelope::err(
                request.id,
                RpcError::new(
                    ErrorCode::InvalidRequest,
                    format!(
                        "Unsupported message type '{}' (expected 'request')",
                        request.message_type
                    ),
                ),
            ),
            false,
        );
    }

    if request.id.trim().is_empty() {
        return (
            ResponseEnvelope::err(
                request.id,
                RpcError::new(ErrorCode::InvalidRequest, "Request id must not be empty"),
            ),
            false,
        );
    }

    let method = match RpcMethod::from_str(&request.method) {
        Ok(method) => method,
        Err(err) => return (ResponseEnvelope::err(request.id, err), false),
    };

    match dispatch_request(state, method, request.params) {
        Ok(outcome) => (
            ResponseEnvelope::ok(request.id, outcome.result),
            outcome.should_shutdown,
        ),
        Err(err) => (ResponseEnvelope::err(request.id, err), false),
    }
}

fn dispatch_request(
    state: &mut BridgeState,
    method: RpcMethod,
    params: Value,
) -> Result<MethodOutcome, RpcError> {
    match method {
        RpcMethod::RuntimeHello => Ok(MethodOutcome {
            result: handle_runtime_hello(state),
            should_shutdown: false,
        }),
        RpcMethod::TtsSynthesize => {
            let params: TtsSynthesizeParams = parse_params(params)?;
            let result = handle_tts_synthesize(state, params)?;
            Ok(MethodOutcome {
                result,
                should_shutdown: false,
            })
        }
        RpcMethod::AudioInspect => {
            let params: AudioInspectParams = parse_params(params)?;
            let result = handle_audio_inspect(params)?;
            Ok(MethodOutcome {
                result,
                should_shutdown: false,
            })
        }
        RpcMethod::RuntimeShutdown => Ok(MethodOutcome {
            result: json!({"shutting_down": true}),
            should_shutdown: true,
        }),
    }
}

fn handle_runtime_hello(state: &BridgeState) -> Value {
    json!({
        "protocol_version": PROTOCOL_VERSION,
        "bridge": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "methods": RpcMethod::supported(),
        "audio": {
            "container": "wav",
            "sample_format": "f32",
            "channels": melforge::export::CHANNELS,
            "default_sample_rate_hz": state.default_sample_rate()
        },
        "models": {
            "onnx": cfg!(feature = "onnx"),
            "config": state.config_path.as_ref().map(|p| p.display().to_string()),
            "config_error": state.config_error,
            "loaded": state.pipeline.is_some()
        }
    })
}

fn handle_tts_synthesize(
    state: &mut BridgeState,
    params: TtsSynthesizeParams,
) -> Result<Value, RpcError> {
    validate_synthesize_params(&params)?;

    let sample_rate = params
        .sample_rate
        .unwrap_or_else(|| state.default_sample_rate());
    let request = SynthesisRequest::new(params.token_ids, params.output_path.trim())
        .with_conditioning(params.conditioning)
        .with_sample_rate(sample_rate);

    let pipeline = ensure_pipeline(state)?;
    let report = pipeline.synthesize(&request).map_err(map_synthesis_error)?;

    serde_json::to_value(&report).map_err(|err| {
        RpcError::new(
            ErrorCode::InternalError,
            format!("Failed to encode report: {err}"),
        )
    })
}

/// Reject bad requests before any model is loaded
fn validate_synthesize_params(params: &TtsSynthesizeParams) -> Result<(), RpcError> {
    if params.token_ids.is_empty() {
        return Err(RpcError::new(
            ErrorCode::InvalidParams,
            "token_ids must not be empty",
        ));
    }
    if params.output_path.trim().is_empty() {
        return Err(RpcError::new(
            ErrorCode::InvalidParams,
            "output_path must not be empty",
        ));
    }
    if params.sample_rate == Some(0) {
        return Err(RpcError::new(
            ErrorCode::InvalidParams,
            "sample_rate must be greater than 0",
        ));
    }
    params
        .conditioning
        .validate()
        .map_err(|message| RpcError::new(ErrorCode::InvalidParams, message))
}

fn ensure_pipeline(
    state: &mut BridgeState,
) -> Result<&mut SynthesisPipeline<DynModel, DynModel>, RpcError> {
    if state.pipeline.is_none() {
        let config = state.pipeline_config()?.clone();
        let (acoustic, vocoder) = load_models(&config)?;
        state.pipeline = Some(
            SynthesisPipeline::from_config(acoustic, vocoder, &config)
                .with_event_sink(Arc::new(LogEventSink)),
        );
    }

    state
        .pipeline
        .as_mut()
        .ok_or_else(|| RpcError::new(ErrorCode::InternalError, "Pipeline state unavailable"))
}

#[cfg(feature = "onnx")]
fn load_models(config: &PipelineConfig) -> Result<(DynModel, DynModel), RpcError> {
    use melforge::{EngineError, OnnxModel, Stage};

    let map_engine_error = |stage: Stage| {
        move |err: EngineError| match err {
            EngineError::ModelNotFound(path) => {
                RpcError::new(ErrorCode::ModelMissing, format!("Model not found: {path}"))
                    .with_stage(stage.as_str())
            }
            other => RpcError::new(ErrorCode::InternalError, other.to_string())
                .with_stage(stage.as_str()),
        }
    };

    let acoustic = OnnxModel::load(&config.acoustic_model, config.intra_threads)
        .map_err(map_engine_error(Stage::Acoustic))?;
    let vocoder = OnnxModel::load(&config.vocoder_model, config.intra_threads)
        .map_err(map_engine_error(Stage::Vocoder))?;

    Ok((Box::new(acoustic), Box::new(vocoder)))
}

#[cfg(not(feature = "onnx"))]
fn load_models(config: &PipelineConfig) -> Result<(DynModel, DynModel), RpcError> {
    Err(RpcError::new(
        ErrorCode::ModelMissing,
        format!(
            "Cannot load {} / {}: bridge built without the onnx feature",
            config.acoustic_model.display(),
            config.vocoder_model.display()
        ),
    ))
}

fn handle_audio_inspect(params: AudioInspectParams) -> Result<Value, RpcError> {
    let path = params.path.trim();
    if path.is_empty() {
        return Err(RpcError::new(ErrorCode::InvalidParams, "path must not be empty"));
    }

    let descriptor = inspect_wav(path)
        .map_err(|err| RpcError::new(ErrorCode::InvalidParams, err.to_string()))?;

    Ok(json!({
        "path": path,
        "sample_rate": descriptor.sample_rate,
        "bits_per_sample": descriptor.bits_per_sample,
        "channels": descriptor.channels,
        "sample_count": descriptor.sample_count,
        "float_samples": descriptor.float_samples,
        "duration_ms": descriptor.duration_ms()
    }))
}

fn map_synthesis_error(err: SynthesisError) -> RpcError {
    let code = match &err {
        SynthesisError::InvalidInput(_) => ErrorCode::InvalidParams,
        SynthesisError::AcousticInference(_)
        | SynthesisError::AcousticOutput(_)
        | SynthesisError::VocoderInference(_)
        | SynthesisError::VocoderOutput(_) => ErrorCode::InferenceFailed,
        SynthesisError::Export(_) => ErrorCode::ExportFailed,
    };
    RpcError::new(code, err.to_string()).with_stage(err.stage().as_str())
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = if params.is_null() { json!({}) } else { params };

    serde_json::from_value(params)
        .map_err(|err| RpcError::new(ErrorCode::InvalidParams, format!("Invalid params: {err}")))
}

fn extract_request_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(ToString::to_string)
}

fn write_response(stdout: &mut dyn Write, response: &ResponseEnvelope) -> io::Result<()> {
    let encoded = serde_json::to_string(response)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    writeln!(stdout, "{encoded}")?;
    stdout.flush()
}
