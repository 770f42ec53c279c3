//! HTTP connectors.
//!
//! | id | direction | behaviour |
//! |----|-----------|-----------|
//! | `http` | download | GET (optional JSON body), streamed to disk |
//! | `http` | upload | PUT or POST of the raw file bytes |
//! | `http_json`, `json` | upload | POST of the file as JSON, metadata merged in |

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use task_config::LocalFileRef;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::auth::{generate_cnonce, DigestChallenge, HttpAuth};
use crate::{parse_access, read_json_document, ConnectorError, Downloader, Metadata, Uploader};

/// A verifying client and one that skips certificate checks for
/// descriptors with `ssl_verify: false`.
#[derive(Clone)]
pub struct HttpClients {
    verified: Client,
    insecure: Client,
}

impl HttpClients {
    pub fn new() -> Result<Self, ConnectorError> {
        let build = |insecure: bool| {
            Client::builder()
                .danger_accept_invalid_certs(insecure)
                .build()
                .map_err(|e| ConnectorError::Transport {
                    connector: "http".to_string(),
                    message: format!("Failed to create HTTP client: {}", e),
                })
        };
        Ok(Self {
            verified: build(false)?,
            insecure: build(true)?,
        })
    }

    fn for_access(&self, ssl_verify: bool) -> &Client {
        if ssl_verify {
            &self.verified
        } else {
            &self.insecure
        }
    }
}

fn default_ssl_verify() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct HttpAccess {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, alias = "http_auth")]
    auth: Option<HttpAuth>,
    #[serde(default = "default_ssl_verify")]
    ssl_verify: bool,
    /// Request body for downloads that need one.
    #[serde(default)]
    json: Option<Value>,
}

enum RequestBody {
    Empty,
    Json(Value),
    File(PathBuf),
}

/// Send one request, answering a digest challenge if the credentials call
/// for it. Non-2xx responses become [`ConnectorError::Status`].
async fn execute(
    client: &Client,
    method: Method,
    url: &str,
    auth: Option<&HttpAuth>,
    body: &RequestBody,
) -> Result<Response, ConnectorError> {
    let request_error = |e: reqwest::Error| ConnectorError::Request {
        url: url.to_string(),
        message: e.to_string(),
    };

    let mut response = build_request(client, &method, url, auth, body, None)
        .await?
        .send()
        .await
        .map_err(request_error)?;

    if let Some(HttpAuth::Digest { username, password }) = auth {
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find_map(DigestChallenge::parse);
            if let Some(challenge) = challenge {
                debug!(url = %url, realm = %challenge.realm, "Answering digest challenge");
                let uri = digest_uri(url);
                let header = challenge.authorization(
                    username,
                    password,
                    method.as_str(),
                    &uri,
                    &generate_cnonce(),
                );
                response = build_request(client, &method, url, auth, body, Some(header))
                    .await?
                    .send()
                    .await
                    .map_err(request_error)?;
            }
        }
    }

    let status = response.status();
    if !status.is_success() {
        return Err(ConnectorError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

async fn build_request(
    client: &Client,
    method: &Method,
    url: &str,
    auth: Option<&HttpAuth>,
    body: &RequestBody,
    authorization: Option<String>,
) -> Result<RequestBuilder, ConnectorError> {
    let mut request = client.request(method.clone(), url);
    request = match body {
        RequestBody::Empty => request,
        RequestBody::Json(value) => request.json(value),
        RequestBody::File(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| ConnectorError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            request.body(file)
        }
    };
    if let Some(HttpAuth::Basic { username, password }) = auth {
        request = request.basic_auth(username, Some(password));
    }
    if let Some(value) = authorization {
        request = request.header(AUTHORIZATION, value);
    }
    Ok(request)
}

fn digest_uri(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
}

pub struct HttpDownloader {
    clients: HttpClients,
}

impl HttpDownloader {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, access: &Value, local: &LocalFileRef) -> Result<(), ConnectorError> {
        let access: HttpAccess = parse_access("http", access)?;
        let body = match access.json {
            Some(value) => RequestBody::Json(value),
            None => RequestBody::Empty,
        };

        tokio::fs::create_dir_all(&local.dir)
            .await
            .map_err(|e| ConnectorError::io(local, e))?;

        let client = self.clients.for_access(access.ssl_verify);
        let response = execute(client, Method::GET, &access.url, access.auth.as_ref(), &body).await?;

        let path = local.path();
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ConnectorError::io(local, e))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ConnectorError::Request {
                url: access.url.clone(),
                message: e.to_string(),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ConnectorError::io(local, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| ConnectorError::io(local, e))?;

        info!(url = %access.url, path = %path.display(), bytes = written, "Downloaded file");
        Ok(())
    }
}

pub struct HttpUploader {
    clients: HttpClients,
}

impl HttpUploader {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        access: &Value,
        local: &LocalFileRef,
        _metadata: Option<&Metadata>,
    ) -> Result<(), ConnectorError> {
        let access: HttpAccess = parse_access("http", access)?;
        let method = match access.method.as_deref().map(str::to_ascii_uppercase).as_deref() {
            Some("PUT") => Method::PUT,
            Some("POST") => Method::POST,
            other => {
                return Err(ConnectorError::InvalidAccess {
                    connector: "http".to_string(),
                    message: format!("HTTP method not valid: {}", other.unwrap_or("<missing>")),
                })
            }
        };

        let client = self.clients.for_access(access.ssl_verify);
        let body = RequestBody::File(local.path());
        execute(client, method.clone(), &access.url, access.auth.as_ref(), &body).await?;

        info!(url = %access.url, method = %method, path = %local.path().display(), "Uploaded file");
        Ok(())
    }
}

pub struct HttpJsonUploader {
    clients: HttpClients,
}

impl HttpJsonUploader {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl Uploader for HttpJsonUploader {
    async fn upload(
        &self,
        access: &Value,
        local: &LocalFileRef,
        metadata: Option<&Metadata>,
    ) -> Result<(), ConnectorError> {
        let access: HttpAccess = parse_access("http_json", access)?;
        let document = read_json_document(local, metadata).await?;

        let client = self.clients.for_access(access.ssl_verify);
        let body = RequestBody::Json(Value::Object(document));
        execute(client, Method::POST, &access.url, access.auth.as_ref(), &body).await?;

        info!(url = %access.url, path = %local.path().display(), "Posted JSON document");
        Ok(())
    }
}
