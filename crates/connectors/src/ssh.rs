//! SFTP connector (`ssh` feature, on by default).
//!
//! libssh2 is blocking, so each transfer runs on the blocking pool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use ssh2::{Session, Sftp};
use std::fs::File;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use task_config::LocalFileRef;
use tracing::info;

use crate::{parse_access, ConnectorError, Downloader, Metadata, Uploader};

fn default_port() -> u16 {
    22
}

#[derive(Debug, Clone, Deserialize)]
struct SshAccess {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    password: String,
    file_dir: String,
    file_name: String,
}

impl SshAccess {
    fn remote_path(&self) -> PathBuf {
        Path::new(&self.file_dir).join(&self.file_name)
    }
}

fn transport_error(err: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Transport {
        connector: "ssh".to_string(),
        message: err.to_string(),
    }
}

fn open_sftp(access: &SshAccess) -> Result<Sftp, ConnectorError> {
    let tcp = TcpStream::connect((access.host.as_str(), access.port)).map_err(transport_error)?;
    let mut session = Session::new().map_err(transport_error)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(transport_error)?;
    session
        .userauth_password(&access.username, &access.password)
        .map_err(transport_error)?;
    session.sftp().map_err(transport_error)
}

/// Create `dir` and any missing parents on the remote side.
fn remote_mkdir_all(sftp: &Sftp, dir: &Path) -> Result<(), ConnectorError> {
    if dir.as_os_str().is_empty() || sftp.stat(dir).is_ok() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        remote_mkdir_all(sftp, parent)?;
    }
    sftp.mkdir(dir, 0o755).map_err(transport_error)
}

async fn run_blocking<F>(job: F) -> Result<(), ConnectorError>
where
    F: FnOnce() -> Result<(), ConnectorError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(transport_error)?
}

pub struct SshConnector;

#[async_trait]
impl Downloader for SshConnector {
    async fn download(&self, access: &Value, local: &LocalFileRef) -> Result<(), ConnectorError> {
        let access: SshAccess = parse_access("ssh", access)?;
        let local = local.clone();

        run_blocking(move || {
            std::fs::create_dir_all(&local.dir).map_err(|e| ConnectorError::io(&local, e))?;
            let sftp = open_sftp(&access)?;
            let mut remote = sftp.open(&access.remote_path()).map_err(transport_error)?;
            let mut file = File::create(local.path()).map_err(|e| ConnectorError::io(&local, e))?;
            let bytes = std::io::copy(&mut remote, &mut file).map_err(transport_error)?;
            info!(host = %access.host, path = %local.path().display(), bytes, "Fetched file over SFTP");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Uploader for SshConnector {
    async fn upload(
        &self,
        access: &Value,
        local: &LocalFileRef,
        _metadata: Option<&Metadata>,
    ) -> Result<(), ConnectorError> {
        let access: SshAccess = parse_access("ssh", access)?;
        let local = local.clone();

        run_blocking(move || {
            let mut file = File::open(local.path()).map_err(|e| ConnectorError::io(&local, e))?;
            let sftp = open_sftp(&access)?;
            remote_mkdir_all(&sftp, Path::new(&access.file_dir))?;
            let mut remote = sftp.create(&access.remote_path()).map_err(transport_error)?;
            let bytes = std::io::copy(&mut file, &mut remote).map_err(transport_error)?;
            info!(host = %access.host, remote = %access.remote_path().display(), bytes, "Sent file over SFTP");
            Ok(())
        })
        .await
    }
}
