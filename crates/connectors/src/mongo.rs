//! Document database uploaders (`mongodb` feature, on by default).

use async_trait::async_trait;
use futures_util::io::AsyncWriteExt;
use mongodb::bson::{self, oid::ObjectId, Bson, Document};
use mongodb::options::{GridFsBucketOptions, GridFsUploadOptions};
use mongodb::Client;
use serde::Deserialize;
use serde_json::Value;
use task_config::LocalFileRef;
use tracing::info;

use crate::{parse_access, read_json_document, ConnectorError, Metadata, Uploader};

const GRIDFS_CHUNK_SIZE: u32 = 1024;

#[derive(Debug, Deserialize)]
struct MongoAccess {
    host: String,
    username: String,
    password: String,
    dbname: String,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    /// Extra GridFS metadata, merged with the caller's.
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
}

impl MongoAccess {
    fn uri(&self) -> String {
        format!(
            "mongodb://{}:{}@{}/{}",
            self.username, self.password, self.host, self.dbname
        )
    }
}

fn required<'a>(
    connector: &str,
    field: &'a Option<String>,
    name: &str,
) -> Result<&'a str, ConnectorError> {
    field.as_deref().ok_or_else(|| ConnectorError::InvalidAccess {
        connector: connector.to_string(),
        message: format!("missing field `{}`", name),
    })
}

fn transport_error(connector: &str, err: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Transport {
        connector: connector.to_string(),
        message: err.to_string(),
    }
}

/// Identity values that parse as object ids are stored as `[ObjectId]`.
fn coerce_metadata(metadata: &Metadata) -> Document {
    metadata
        .iter()
        .map(|(key, value)| {
            let coerced = value
                .as_str()
                .and_then(|s| ObjectId::parse_str(s).ok())
                .map(|oid| Bson::Array(vec![Bson::ObjectId(oid)]))
                .or_else(|| Bson::try_from(value.clone()).ok())
                .unwrap_or(Bson::Null);
            (key.clone(), coerced)
        })
        .collect()
}

async fn connect(
    connector: &str,
    access: &MongoAccess,
) -> Result<mongodb::Database, ConnectorError> {
    let client = Client::with_uri_str(access.uri())
        .await
        .map_err(|e| transport_error(connector, e))?;
    Ok(client.database(&access.dbname))
}

pub struct MongoJsonUploader;

#[async_trait]
impl Uploader for MongoJsonUploader {
    async fn upload(
        &self,
        access: &Value,
        local: &LocalFileRef,
        metadata: Option<&Metadata>,
    ) -> Result<(), ConnectorError> {
        const ID: &str = "mongodb_json";
        let access: MongoAccess = parse_access(ID, access)?;
        let collection_name = required(ID, &access.collection, "collection")?;

        let document = read_json_document(local, None).await?;
        let mut document = bson::to_document(&document).map_err(|e| transport_error(ID, e))?;
        if let Some(metadata) = metadata {
            document.extend(coerce_metadata(metadata));
        }

        let db = connect(ID, &access).await?;
        let result = db
            .collection::<Document>(collection_name)
            .insert_one(document, None)
            .await
            .map_err(|e| transport_error(ID, e))?;

        info!(collection = %collection_name, id = %result.inserted_id, "Inserted JSON document");
        Ok(())
    }
}

pub struct MongoGridFsUploader;

#[async_trait]
impl Uploader for MongoGridFsUploader {
    async fn upload(
        &self,
        access: &Value,
        local: &LocalFileRef,
        metadata: Option<&Metadata>,
    ) -> Result<(), ConnectorError> {
        const ID: &str = "mongodb_gridfs";
        let access: MongoAccess = parse_access(ID, access)?;
        let file_name = required(ID, &access.file_name, "file_name")?;

        let mut stored = access.metadata.clone().unwrap_or_default();
        if let Some(metadata) = metadata {
            stored.extend(metadata.clone());
        }
        let stored_metadata = coerce_metadata(&stored);

        let contents = tokio::fs::read(local.path())
            .await
            .map_err(|e| ConnectorError::io(local, e))?;

        let db = connect(ID, &access).await?;
        let bucket = db.gridfs_bucket(
            GridFsBucketOptions::builder()
                .chunk_size_bytes(GRIDFS_CHUNK_SIZE)
                .build(),
        );
        let mut stream = bucket.open_upload_stream(
            file_name,
            GridFsUploadOptions::builder()
                .metadata(stored_metadata)
                .build(),
        );
        stream
            .write_all(&contents)
            .await
            .map_err(|e| transport_error(ID, e))?;
        stream.close().await.map_err(|e| transport_error(ID, e))?;

        info!(file_name = %file_name, bytes = contents.len(), "Stored file in GridFS");
        Ok(())
    }
}
