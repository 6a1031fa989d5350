use crate::utils::settings::StorageSettings;
use async_trait::async_trait;
use axum::body::Bytes;
use azure_core::{error::ErrorKind, StatusCode};
use azure_storage::{ConnectionString, StorageCredentials};
use azure_storage_blobs::prelude::{BlobServiceClient, ClientBuilder};
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use std::error::Error;

/// Container and blob name of the served document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentLocation {
    pub container: String,
    pub blob: String,
}

pub type DocumentStream = BoxStream<'static, azure_core::Result<Bytes>>;

/// Read access to the object store holding the document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn exists(&self, location: &DocumentLocation) -> azure_core::Result<bool>;

    /// Starts the download and returns the blob's chunks in order, or `None`
    /// when the blob is gone. Errors surface here, before any byte is sent.
    async fn open(&self, location: &DocumentLocation) -> azure_core::Result<Option<DocumentStream>>;
}

pub struct AzureBlobStore {
    service: BlobServiceClient,
}

impl AzureBlobStore {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let service = match settings {
            StorageSettings::ConnectionString(connection_string) => {
                let parsed = ConnectionString::new(connection_string)?;
                if parsed.use_development_storage == Some(true) {
                    log::info!("Using the local storage emulator");
                    ClientBuilder::emulator().blob_service_client()
                } else {
                    let account = parsed
                        .account_name
                        .ok_or("Storage connection string has no AccountName")?;
                    ClientBuilder::new(account, parsed.storage_credentials()?).blob_service_client()
                }
            }
            StorageSettings::Account(account) => {
                let credential = azure_identity::create_credential()?;
                BlobServiceClient::new(account, StorageCredentials::token_credential(credential))
            }
        };

        Ok(Self { service })
    }
}

#[async_trait]
impl DocumentStore for AzureBlobStore {
    async fn exists(&self, location: &DocumentLocation) -> azure_core::Result<bool> {
        self.service
            .container_client(location.container.as_str())
            .blob_client(location.blob.as_str())
            .exists()
            .await
    }

    async fn open(&self, location: &DocumentLocation) -> azure_core::Result<Option<DocumentStream>> {
        let mut pages = self
            .service
            .container_client(location.container.as_str())
            .blob_client(location.blob.as_str())
            .get()
            .into_stream();

        let first = match pages.next().await {
            Some(Ok(first)) => first,
            Some(Err(err)) if is_not_found(&err) => return Ok(None),
            Some(Err(err)) => return Err(err),
            None => return Ok(Some(stream::empty().boxed())),
        };

        let rest = pages.map_ok(|chunk| chunk.data).try_flatten();
        Ok(Some(first.data.chain(rest).boxed()))
    }
}

/// The blob was deleted between the existence check and the read.
fn is_not_found(err: &azure_core::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::HttpResponse { status: StatusCode::NotFound, .. }
    )
}
