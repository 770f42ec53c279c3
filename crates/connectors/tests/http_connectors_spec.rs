//! Integration tests for the HTTP connectors against a stub server.

use connectors::{first_party, ConnectorError, Metadata};
use serde_json::json;
use std::fs;
use task_config::LocalFileRef;
use tempfile::TempDir;
use wiremock::{
    matchers::{body_bytes, body_json, header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn local_in(dir: &TempDir, name: &str) -> LocalFileRef {
    LocalFileRef::new(dir.path().to_string_lossy(), name)
}

#[tokio::test]
async fn test_download_streams_body_into_nested_dir() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/reads.fastq"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"@r1\nACGT\n+\n!!!!\n".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let local = LocalFileRef::new(dir.path().join("in/nested").to_string_lossy(), "reads.fastq");
    let (downloaders, _) = first_party().unwrap();

    downloaders
        .resolve("http")
        .unwrap()
        .download(&json!({"url": format!("{}/files/reads.fastq", server.uri())}), &local)
        .await
        .unwrap();

    assert_eq!(fs::read(local.path()).unwrap(), b"@r1\nACGT\n+\n!!!!\n");
}

#[tokio::test]
async fn test_download_sends_basic_auth_and_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export"))
        // "alice:secret"
        .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
        .and(body_json(json!({"query": "latest"})))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let local = local_in(&dir, "export.csv");
    let (downloaders, _) = first_party().unwrap();

    let access = json!({
        "url": format!("{}/export", server.uri()),
        "auth": {"username": "alice", "password": "secret"},
        "json": {"query": "latest"}
    });
    downloaders.resolve("http").unwrap().download(&access, &local).await.unwrap();

    assert_eq!(fs::read_to_string(local.path()).unwrap(), "ok");
}

#[tokio::test]
async fn test_download_answers_digest_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_string("granted"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "www-authenticate",
            r#"Digest realm="files", qop="auth", nonce="abc123", opaque="xyz""#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let local = local_in(&dir, "protected.bin");
    let (downloaders, _) = first_party().unwrap();

    let access = json!({
        "url": format!("{}/protected", server.uri()),
        "auth": {"auth_type": "digest", "username": "bob", "password": "pw"}
    });
    downloaders.resolve("http").unwrap().download(&access, &local).await.unwrap();

    assert_eq!(fs::read_to_string(local.path()).unwrap(), "granted");
}

#[tokio::test]
async fn test_download_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (downloaders, _) = first_party().unwrap();
    let err = downloaders
        .resolve("http")
        .unwrap()
        .download(&json!({"url": format!("{}/gone", server.uri())}), &local_in(&dir, "gone"))
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::Status { status: 404, .. }));
}

#[tokio::test]
async fn test_upload_puts_raw_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/results/report.json"))
        .and(body_bytes(b"{\"rows\": 12}".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let local = local_in(&dir, "report.json");
    fs::write(local.path(), "{\"rows\": 12}").unwrap();
    let (_, uploaders) = first_party().unwrap();

    let access = json!({"url": format!("{}/results/report.json", server.uri()), "method": "put"});
    uploaders.resolve("http").unwrap().upload(&access, &local, None).await.unwrap();
}

#[tokio::test]
async fn test_upload_rejects_unsupported_method() {
    let dir = TempDir::new().unwrap();
    let local = local_in(&dir, "r.txt");
    fs::write(local.path(), "x").unwrap();
    let (_, uploaders) = first_party().unwrap();

    let err = uploaders
        .resolve("http")
        .unwrap()
        .upload(&json!({"url": "http://127.0.0.1:9/r", "method": "PATCH"}), &local, None)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("HTTP method not valid: PATCH"));
}

#[tokio::test]
async fn test_json_upload_merges_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records"))
        .and(body_json(json!({
            "accuracy": 0.93,
            "application_container_id": "c-17",
            "task_id": "t-4"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let local = local_in(&dir, "metrics.json");
    fs::write(local.path(), r#"{"accuracy": 0.93}"#).unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("application_container_id".into(), json!("c-17"));
    metadata.insert("task_id".into(), json!("t-4"));

    let (_, uploaders) = first_party().unwrap();
    let access = json!({"url": format!("{}/records", server.uri())});
    for id in ["http_json", "json"] {
        uploaders
            .resolve(id)
            .unwrap()
            .upload(&access, &local, Some(&metadata))
            .await
            .unwrap();
    }
}
