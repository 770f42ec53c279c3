//! End-to-end runs of an application container against a stub controller
//! and stub file storage served by the same mock server.

use anyhow::Result;
use container_worker::WorkerOptions;
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;
use wiremock::{
    matchers::{body_bytes, body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

const SUCCESS: u64 = 3;
const FAILED: u64 = 4;

fn settings(server: &MockServer, container_type: &str) -> String {
    json!({
        "container_id": "app-1",
        "callback_key": "cb-secret",
        "callback_url": format!("{}/cb", server.uri()),
        "container_type": container_type
    })
    .to_string()
}

fn options(dir: &TempDir, server: &MockServer) -> WorkerOptions {
    let mut options = WorkerOptions::with_settings(settings(server, "application"));
    options.config_path = Some(dir.path().join("config.json"));
    options.tracing_dir = dir.path().join("trace");
    options.data_dir = Some(dir.path().join("data"));
    options
}

/// Two inputs concatenated into one keyed result file.
fn write_static_config(dir: &Path, command_suffix: &str) {
    let base = dir.to_string_lossy();
    let config = json!({
        "application_command": format!(
            "cat {base}/in/a.txt {base}/in/b.txt > {base}/out/merged.txt{command_suffix}"
        ),
        "local_input_files": [
            {"dir": format!("{base}/in"), "name": "a.txt"},
            {"dir": format!("{base}/in"), "name": "b.txt"}
        ],
        "local_result_files": {
            "merged": {"dir": format!("{base}/out"), "name": "merged.txt"}
        }
    });
    fs::write(dir.join("config.json"), config.to_string()).unwrap();
}

fn task_parameters(server: &MockServer, extra: Value) -> Value {
    let mut params = json!({
        "task_id": "task-42",
        "input_files": [
            {"connector_type": "http", "connector_access": {"url": format!("{}/files/a", server.uri())}},
            {"connector_type": "http", "connector_access": {"url": format!("{}/files/b", server.uri())}}
        ],
        "result_files": [
            {
                "connector_type": "http",
                "connector_access": {"url": format!("{}/results/merged", server.uri()), "method": "PUT"},
                "local_result_file": "merged"
            }
        ]
    });
    if let (Value::Object(params), Value::Object(extra)) = (&mut params, extra) {
        params.extend(extra);
    }
    params
}

async fn mount_controller(server: &MockServer, params: Value) {
    Mock::given(method("POST"))
        .and(path("/cb"))
        .and(body_partial_json(json!({"callback_type": 0, "content": {"state": SUCCESS}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(params))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn mount_inputs(server: &MockServer, expected: u64) {
    for (name, body) in [("a", "alpha\n"), ("b", "beta\n")] {
        Mock::given(method("GET"))
            .and(path(format!("/files/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(expected)
            .mount(server)
            .await;
    }
}

async fn callbacks(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.url.path() == "/cb")
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

fn phases(callbacks: &[Value]) -> Vec<(u64, u64)> {
    callbacks
        .iter()
        .map(|cb| {
            (
                cb["callback_type"].as_u64().unwrap(),
                cb["content"]["state"].as_u64().unwrap(),
            )
        })
        .collect()
}

#[tokio::test]
async fn successful_task_reports_four_phases_in_order() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    mount_controller(&server, task_parameters(&server, json!({}))).await;
    mount_inputs(&server, 1).await;
    Mock::given(method("PUT"))
        .and(path("/results/merged"))
        .and(body_bytes(b"alpha\nbeta\n".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let code = container_worker::run(options(&dir, &server)).await;

    assert_eq!(code, 0);
    let callbacks = callbacks(&server).await;
    assert_eq!(
        phases(&callbacks),
        vec![(0, SUCCESS), (1, SUCCESS), (2, SUCCESS), (3, SUCCESS)]
    );
    assert!(callbacks
        .iter()
        .all(|cb| cb["callback_key"] == "cb-secret" && cb["container_id"] == "app-1"));

    let telemetry = &callbacks[2]["content"]["telemetry"];
    assert_eq!(telemetry["return_code"], 0);
    assert_eq!(telemetry["input_file_sizes"].as_array().unwrap().len(), 2);
    assert_eq!(telemetry["result_file_sizes"]["merged"]["file_size"], 1);
    assert!(telemetry["wall_time"].as_f64().unwrap() >= 0.0);
    assert!(telemetry.get("std_out").is_none());
    assert!(telemetry.get("tracing").is_none());
    assert_eq!(callbacks[3]["content"]["description"], "Result files sent.");
    Ok(())
}

#[tokio::test]
async fn non_zero_exit_fails_processed_phase_with_code_nine() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "; echo giving up >&2; exit 7");
    mount_controller(&server, task_parameters(&server, json!({}))).await;
    mount_inputs(&server, 1).await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let code = container_worker::run(options(&dir, &server)).await;

    assert_eq!(code, 9);
    let callbacks = callbacks(&server).await;
    assert_eq!(phases(&callbacks), vec![(0, SUCCESS), (1, SUCCESS), (2, FAILED)]);
    let content = &callbacks[2]["content"];
    assert_eq!(
        content["description"],
        "Processing failed: application exited with return code 7."
    );
    assert_eq!(content["telemetry"]["return_code"], 7);
    assert_eq!(content["telemetry"]["std_err"], "giving up\n");
    Ok(())
}

#[tokio::test]
async fn whitelist_without_rules_denies_workload() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    let sandbox = json!({"sandbox": {"seccomp": {"mode": "whitelist", "filter_items": []}}});
    mount_controller(&server, task_parameters(&server, sandbox)).await;
    mount_inputs(&server, 1).await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let code = container_worker::run(options(&dir, &server)).await;

    // Denied before exec: either the spawn itself fails or the child dies
    // with a non-zero status.
    assert!(code == 8 || code == 9, "unexpected exit code {code}");
    let callbacks = callbacks(&server).await;
    assert_eq!(phases(&callbacks), vec![(0, SUCCESS), (1, SUCCESS), (2, FAILED)]);
    assert!(!dir.path().join("out/merged.txt").exists());
    Ok(())
}

#[tokio::test]
async fn input_count_mismatch_exits_five_without_downloading() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    let mut params = task_parameters(&server, json!({}));
    params["input_files"].as_array_mut().unwrap().pop();
    mount_controller(&server, params).await;
    mount_inputs(&server, 0).await;

    let code = container_worker::run(options(&dir, &server)).await;

    assert_eq!(code, 5);
    let callbacks = callbacks(&server).await;
    assert_eq!(phases(&callbacks), vec![(0, SUCCESS), (1, FAILED)]);
    assert_eq!(
        callbacks[1]["content"]["description"],
        "Number of local_input_files in config does not match input_files."
    );
    assert!(callbacks[1]["content"]["exception"]
        .as_str()
        .unwrap()
        .contains("2 local input files declared but 1 descriptors received"));
    Ok(())
}

#[tokio::test]
async fn unknown_result_key_exits_five() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    let mut params = task_parameters(&server, json!({}));
    params["result_files"][0]["local_result_file"] = json!("summary");
    mount_controller(&server, params).await;
    mount_inputs(&server, 0).await;

    assert_eq!(container_worker::run(options(&dir, &server)).await, 5);
    Ok(())
}

#[tokio::test]
async fn failed_download_exits_six() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    mount_controller(&server, task_parameters(&server, json!({}))).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let code = container_worker::run(options(&dir, &server)).await;

    assert_eq!(code, 6);
    let callbacks = callbacks(&server).await;
    assert_eq!(phases(&callbacks), vec![(0, SUCCESS), (1, FAILED)]);
    assert_eq!(callbacks[1]["content"]["description"], "Could not retrieve input files.");
    Ok(())
}

#[tokio::test]
async fn missing_result_file_fails_upload_with_code_ten() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    // The workload never writes the declared result.
    let base = dir.path().to_string_lossy().to_string();
    write_static_config(dir.path(), "");
    let mut config: Value = serde_json::from_str(&fs::read_to_string(dir.path().join("config.json"))?)?;
    config["application_command"] = json!("true");
    fs::write(dir.path().join("config.json"), config.to_string())?;
    mount_controller(&server, task_parameters(&server, json!({}))).await;
    mount_inputs(&server, 1).await;

    let code = container_worker::run(options(&dir, &server)).await;

    assert_eq!(code, 10);
    let callbacks = callbacks(&server).await;
    assert_eq!(
        phases(&callbacks),
        vec![(0, SUCCESS), (1, SUCCESS), (2, SUCCESS), (3, FAILED)]
    );
    assert!(callbacks[3]["content"]["exception"]
        .as_str()
        .unwrap()
        .contains(&format!("{base}/out/merged.txt")));
    Ok(())
}

#[tokio::test]
async fn unreadable_static_config_fails_started_phase() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let code = container_worker::run(options(&dir, &server)).await;

    assert_eq!(code, 3);
    let callbacks = callbacks(&server).await;
    assert_eq!(phases(&callbacks), vec![(0, FAILED)]);
    let description = callbacks[0]["content"]["description"].as_str().unwrap();
    assert!(description.starts_with("Could not load JSON config file from path "));
    Ok(())
}

#[tokio::test]
async fn rejected_callback_exits_one() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert_eq!(container_worker::run(options(&dir, &server)).await, 1);
    Ok(())
}

#[tokio::test]
async fn invalid_parameters_fail_processing_with_code_eight() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    mount_controller(&server, task_parameters(&server, json!({"parameters": 17}))).await;
    mount_inputs(&server, 1).await;

    let code = container_worker::run(options(&dir, &server)).await;

    assert_eq!(code, 8);
    let callbacks = callbacks(&server).await;
    assert_eq!(phases(&callbacks), vec![(0, SUCCESS), (1, SUCCESS), (2, FAILED)]);
    assert_eq!(callbacks[2]["content"]["description"], "Processing failed.");
    Ok(())
}

/// Stand-in tracer: logs one file access, resumes the workload and waits for
/// it to be reaped.
fn write_fake_tracer(dir: &Path) -> std::path::PathBuf {
    let script = dir.join("fake-tracer");
    fs::write(
        &script,
        r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --pid) PID=$2; shift 2;;
    --log) LOG=$2; shift 2;;
    *) shift;;
  esac
done
echo "{\"event\":\"process_start\",\"pid\":$PID,\"time\":1.0}" > "$LOG"
echo "{\"event\":\"file_access\",\"pid\":$PID,\"time\":1.1,\"filename\":\"/etc/hostname\",\"exists\":true,\"syscall\":\"openat\",\"result\":3}" >> "$LOG"
kill -CONT "$PID"
while kill -0 "$PID" 2>/dev/null; do sleep 0.05; done
echo "{\"event\":\"process_end\",\"pid\":$PID,\"time\":2.0,\"exit_code\":0}" >> "$LOG"
"#,
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

#[tokio::test]
async fn traced_run_attaches_trace_and_uploads_log() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    let tracing = json!({"tracing": {
        "enabled": true,
        "file_access": "short",
        "tracing_file": {
            "connector_type": "http",
            "connector_access": {"url": format!("{}/trace", server.uri()), "method": "PUT"}
        }
    }});
    mount_controller(&server, task_parameters(&server, tracing)).await;
    mount_inputs(&server, 1).await;
    Mock::given(method("PUT"))
        .and(path("/trace"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/results/merged"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let mut options = options(&dir, &server);
    options.tracer_bin = Some(write_fake_tracer(dir.path()));
    let code = container_worker::run(options).await;

    assert_eq!(code, 0);
    let callbacks = callbacks(&server).await;
    let trace = &callbacks[2]["content"]["telemetry"]["tracing"];
    assert_eq!(trace["file_access"], json!(["/etc/hostname"]));
    assert_eq!(trace["processes"][0]["exit_code"], 0);
    assert!(trace.get("syscalls").is_none());
    Ok(())
}

#[tokio::test]
async fn tracing_without_tracer_program_fails_processing() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    mount_controller(&server, task_parameters(&server, json!({"tracing": {"syscall": "short"}}))).await;
    mount_inputs(&server, 1).await;

    assert_eq!(container_worker::run(options(&dir, &server)).await, 8);
    Ok(())
}

async fn run_with_tracer(tracer: &str) -> Result<(i32, Vec<Value>)> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    mount_controller(&server, task_parameters(&server, json!({"tracing": {"enabled": true}}))).await;
    mount_inputs(&server, 1).await;

    let mut options = options(&dir, &server);
    options.tracer_bin = Some(tracer.into());
    let code = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        container_worker::run(options),
    )
    .await?;
    Ok((code, callbacks(&server).await))
}

#[tokio::test]
async fn failing_tracer_kills_stopped_workload_and_exits_eight() -> Result<()> {
    let (code, callbacks) = run_with_tracer("/bin/false").await?;

    assert_eq!(code, 8);
    assert_eq!(phases(&callbacks), vec![(0, SUCCESS), (1, SUCCESS), (2, FAILED)]);
    assert_eq!(callbacks[2]["content"]["description"], "Processing failed.");
    assert!(callbacks[2]["content"]["exception"]
        .as_str()
        .unwrap()
        .contains("Tracer exited"));
    Ok(())
}

#[tokio::test]
async fn tracer_that_never_resumes_workload_exits_eight() -> Result<()> {
    let (code, callbacks) = run_with_tracer("/bin/true").await?;

    assert_eq!(code, 8);
    assert_eq!(phases(&callbacks), vec![(0, SUCCESS), (1, SUCCESS), (2, FAILED)]);
    assert!(callbacks[2]["content"]["exception"]
        .as_str()
        .unwrap()
        .contains("still stopped"));
    Ok(())
}

#[test]
fn binary_rejects_unknown_container_type() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_container-worker"))
        .arg(
            json!({
                "container_id": "c",
                "callback_key": "k",
                "callback_url": "http://127.0.0.1:9/cb",
                "container_type": "quantum"
            })
            .to_string(),
        )
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(42));
}

#[test]
fn binary_exits_one_on_malformed_settings() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_container-worker"))
        .arg("{not json")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

/// Serves input content straight from `connector_access.content`.
struct InlineDownloader;

#[async_trait::async_trait]
impl connectors::Downloader for InlineDownloader {
    async fn download(
        &self,
        access: &Value,
        local: &task_config::LocalFileRef,
    ) -> Result<(), connectors::ConnectorError> {
        let content = access["content"].as_str().unwrap_or_default();
        fs::create_dir_all(&local.dir).unwrap();
        fs::write(local.path(), content).unwrap();
        Ok(())
    }
}

#[tokio::test]
async fn extra_connectors_are_resolved_by_identifier() -> Result<()> {
    let dir = TempDir::new()?;
    let server = MockServer::start().await;
    write_static_config(dir.path(), "");
    let mut params = task_parameters(&server, json!({}));
    params["input_files"] = json!([
        {"connector_type": "inline", "connector_access": {"content": "one\n"}},
        {"connector_type": "inline", "connector_access": {"content": "two\n"}}
    ]);
    mount_controller(&server, params).await;
    Mock::given(method("PUT"))
        .and(path("/results/merged"))
        .and(body_bytes(b"one\ntwo\n".to_vec()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut downloads = connectors::DownloaderRegistry::new(connectors::Direction::Download);
    downloads.register("inline", std::sync::Arc::new(InlineDownloader));
    let code = container_worker::run_with_connectors(
        options(&dir, &server),
        downloads,
        connectors::UploaderRegistry::new(connectors::Direction::Upload),
    )
    .await;

    assert_eq!(code, 0);
    Ok(())
}
