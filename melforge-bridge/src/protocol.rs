use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            message_type: "response",
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, err: RpcError) -> Self {
        Self {
            message_type: "response",
            id: id.into(),
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: err.code.as_str(),
                message: err.message,
                retryable: err.retryable,
                stage: err.stage,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    /// Pipeline stage that failed, for synthesis errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub stage: Option<&'static str>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.retryable(),
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: &'static str) -> Self {
        self.stage = Some(stage);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    InvalidParams,
    MethodNotFound,
    PayloadTooLarge,
    ConfigInvalid,
    ModelMissing,
    InferenceFailed,
    ExportFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::ModelMissing => "MODEL_MISSING",
            Self::InferenceFailed => "INFERENCE_FAILED",
            Self::ExportFailed => "EXPORT_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn retryable(self) -> bool {
        matches!(self, Self::InternalError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    RuntimeHello,
    TtsSynthesize,
    AudioInspect,
    RuntimeShutdown,
}

impl RpcMethod {
    pub fn supported() -> &'static [&'static str] {
        &[
            "runtime.hello",
            "tts.synthesize",
            "audio.inspect",
            "runtime.shutdown",
        ]
    }
}

impl FromStr for RpcMethod {
    type Err = RpcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "runtime.hello" => Ok(Self::RuntimeHello),
            "tts.synthesize" => Ok(Self::TtsSynthesize),
            "audio.inspect" => Ok(Self::AudioInspect),
            "runtime.shutdown" => Ok(Self::RuntimeShutdown),
            _ => Err(RpcError::new(
                ErrorCode::MethodNotFound,
                format!("Unknown method '{value}'"),
            )),
        }
    }
}
