use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

struct BridgeHarness {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BridgeHarness {
    fn spawn() -> Self {
        Self::spawn_with_args(&[])
    }

    fn spawn_with_args(args: &[&str]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_melforge-bridge"))
            .args(args)
            .env_remove("MELFORGE_CONFIG")
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn bridge process");

        let stdin = child.stdin.take().expect("missing child stdin");
        let stdout = child.stdout.take().expect("missing child stdout");

        Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        }
    }

    fn send_line(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{line}").expect("failed to write request");
        self.stdin.flush().expect("failed to flush request");

        let mut response = String::new();
        let bytes_read = self
            .stdout
            .read_line(&mut response)
            .expect("failed to read response");
        assert!(bytes_read > 0, "bridge closed stdout unexpectedly");

        serde_json::from_str(response.trim()).expect("response should be valid json")
    }

    fn request(&mut self, payload: Value) -> Value {
        let encoded = serde_json::to_string(&payload).expect("request should serialize");
        self.send_line(&encoded)
    }

    fn rpc(&mut self, id: &str, method: &str, params: Value, expect_ok: bool) -> Value {
        let response = self.request(json!({
            "type": "request",
            "id": id,
            "method": method,
            "params": params
        }));

        assert_eq!(
            response.get("type").and_then(Value::as_str),
            Some("response"),
            "unexpected response type: {response}"
        );
        assert_eq!(
            response.get("id").and_then(Value::as_str),
            Some(id),
            "unexpected response id: {response}"
        );
        assert_eq!(
            response.get("ok").and_then(Value::as_bool),
            Some(expect_ok),
            "unexpected ok flag: {response}"
        );

        response
    }

    fn rpc_ok(&mut self, id: &str, method: &str, params: Value) -> Value {
        self.rpc(id, method, params, true)
    }

    fn rpc_err_code(&mut self, id: &str, method: &str, params: Value) -> String {
        let response = self.rpc(id, method, params, false);
        response["error"]["code"]
            .as_str()
            .expect("error response should include a code")
            .to_string()
    }

    fn shutdown(mut self) {
        let _ = self.request(json!({
            "type": "request",
            "id": "shutdown",
            "method": "runtime.shutdown",
            "params": {}
        }));

        let status = self.child.wait().expect("failed to wait for bridge");
        assert!(status.success(), "bridge exited with status: {status}");
    }
}

fn unique_temp_path(name: &str, extension: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join("melforge-bridge-tests");
    std::fs::create_dir_all(&dir).expect("failed to create temp test dir");
    dir.join(format!("{name}-{nanos}.{extension}"))
}

#[test]
fn runtime_hello_reports_methods_and_model_status() {
    let mut bridge = BridgeHarness::spawn();

    let response = bridge.rpc_ok("1", "runtime.hello", json!({}));
    let result = &response["result"];

    assert_eq!(result["protocol_version"], "1.0.0");
    let methods = result["methods"]
        .as_array()
        .expect("runtime.hello should include methods array");
    for method in ["tts.synthesize", "audio.inspect", "runtime.shutdown"] {
        assert!(
            methods.iter().any(|v| v.as_str() == Some(method)),
            "runtime.hello methods should advertise {method}: {methods:?}"
        );
    }
    assert!(result["models"]["onnx"].is_boolean());
    assert_eq!(result["models"]["loaded"], false);
    assert!(result["models"]["config"].is_null());
    assert_eq!(result["audio"]["channels"], 1);
    assert_eq!(result["audio"]["default_sample_rate_hz"], 44100);

    bridge.shutdown();
}

#[test]
fn tts_synthesize_validates_params_before_loading_models() {
    let mut bridge = BridgeHarness::spawn();

    let code = bridge.rpc_err_code(
        "1",
        "tts.synthesize",
        json!({"token_ids": [], "output_path": "out.wav"}),
    );
    assert_eq!(code, "INVALID_PARAMS");

    let code = bridge.rpc_err_code(
        "2",
        "tts.synthesize",
        json!({
            "token_ids": [1, 2],
            "output_path": "out.wav",
            "conditioning": {"speed_ratio": -1.0}
        }),
    );
    assert_eq!(code, "INVALID_PARAMS");

    bridge.shutdown();
}

#[test]
fn tts_synthesize_without_config_reports_model_missing() {
    let mut bridge = BridgeHarness::spawn();

    let output = unique_temp_path("no-config", "wav");
    let code = bridge.rpc_err_code(
        "1",
        "tts.synthesize",
        json!({"token_ids": [4, 8, 15], "output_path": output.display().to_string()}),
    );
    assert_eq!(code, "MODEL_MISSING");
    assert!(!output.exists());

    bridge.shutdown();
}

#[test]
fn invalid_config_is_reported_on_synthesis() {
    let config = unique_temp_path("zero-rate", "json");
    std::fs::write(
        &config,
        r#"{"acoustic_model": "a.onnx", "vocoder_model": "v.onnx", "sample_rate": 0}"#,
    )
    .expect("failed to write config");

    let config_arg = config.display().to_string();
    let mut bridge = BridgeHarness::spawn_with_args(&["--config", &config_arg]);

    let hello = bridge.rpc_ok("1", "runtime.hello", json!({}));
    assert!(hello["result"]["models"]["config_error"].is_string());

    let code = bridge.rpc_err_code(
        "2",
        "tts.synthesize",
        json!({"token_ids": [1], "output_path": "out.wav"}),
    );
    assert_eq!(code, "CONFIG_INVALID");

    bridge.shutdown();
    let _ = std::fs::remove_file(config);
}

#[test]
fn audio_inspect_reads_back_wav_header() {
    let path = unique_temp_path("inspect", "wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 22050,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("failed to create wav");
    for _ in 0..2205 {
        writer.write_sample(0.0f32).expect("failed to write sample");
    }
    writer.finalize().expect("failed to finalize wav");

    let mut bridge = BridgeHarness::spawn();
    let response = bridge.rpc_ok(
        "1",
        "audio.inspect",
        json!({"path": path.display().to_string()}),
    );
    let result = &response["result"];

    assert_eq!(result["sample_rate"], 22050);
    assert_eq!(result["sample_count"], 2205);
    assert_eq!(result["channels"], 1);
    assert_eq!(result["bits_per_sample"], 32);
    assert_eq!(result["float_samples"], true);
    assert_eq!(result["duration_ms"], 100);

    let code = bridge.rpc_err_code(
        "2",
        "audio.inspect",
        json!({"path": unique_temp_path("missing", "wav").display().to_string()}),
    );
    assert_eq!(code, "INVALID_PARAMS");

    bridge.shutdown();
    let _ = std::fs::remove_file(path);
}

#[test]
fn malformed_requests_get_protocol_errors() {
    let mut bridge = BridgeHarness::spawn();

    let response = bridge.send_line("{ not json");
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "PARSE_ERROR");

    let response = bridge.request(json!({"type": "event", "id": "7", "method": "runtime.hello"}));
    assert_eq!(response["error"]["code"], "INVALID_REQUEST");
    assert_eq!(response["id"], "7");

    let code = bridge.rpc_err_code("8", "tts.stream", json!({}));
    assert_eq!(code, "METHOD_NOT_FOUND");

    bridge.shutdown();
}

#[test]
fn oversized_request_is_rejected_and_bridge_keeps_serving() {
    let mut bridge = BridgeHarness::spawn();

    let oversized = "x".repeat(8 * 1024 * 1024 + 1);
    let response = bridge.send_line(&oversized);
    assert_eq!(response["ok"], false);
    assert_eq!(response["id"], "_unknown");
    assert_eq!(response["error"]["code"], "PAYLOAD_TOO_LARGE");

    let hello = bridge.rpc_ok("after", "runtime.hello", json!({}));
    assert_eq!(hello["result"]["protocol_version"], "1.0.0");

    bridge.shutdown();
}
