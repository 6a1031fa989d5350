use crate::{storage::DocumentLocation, turnstile::SITEVERIFY_URL};
use std::{error::Error, str::FromStr, time::Duration};
use tracing::Level;
use url::Url;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_CONTAINER: &str = "cv";
pub const DEFAULT_BLOB: &str = "cv.pdf";
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 10;

/// How the handler reaches Azure Blob Storage.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageSettings {
    ConnectionString(String),
    /// Account name only, authenticated with the ambient Azure identity.
    Account(String),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_level: Level,
    pub turnstile_secret: Option<String>,
    pub verify_url: Url,
    pub verify_timeout: Duration,
    pub document: DocumentLocation,
    pub storage: StorageSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the settings from an arbitrary variable source. Empty values count as unset.
    pub fn from_vars<F>(lookup: F) -> Result<Self, Box<dyn Error + Send + Sync>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = match var("FUNCTIONS_CUSTOMHANDLER_PORT") {
            Some(val) => val
                .parse()
                .map_err(|_| format!("Custom Handler port is not a number: {val}"))?,
            None => DEFAULT_PORT,
        };

        let log_level = match var("LOG_LEVEL") {
            Some(val) => Level::from_str(&val).map_err(|_| format!("Unknown LOG_LEVEL: {val}"))?,
            None => Level::INFO,
        };

        let verify_url = match var("TURNSTILE_VERIFY_URL") {
            Some(val) => Url::parse(&val)?,
            None => Url::parse(SITEVERIFY_URL)?,
        };

        let verify_timeout = match var("TURNSTILE_TIMEOUT_SECS") {
            Some(val) => Duration::from_secs(
                val.parse()
                    .map_err(|_| format!("TURNSTILE_TIMEOUT_SECS is not a number: {val}"))?,
            ),
            None => Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
        };

        let document = DocumentLocation {
            container: var("CV_CONTAINER_NAME").unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
            blob: var("CV_BLOB_NAME").unwrap_or_else(|| DEFAULT_BLOB.to_string()),
        };

        let storage = match (
            var("CV_STORAGE_CONNECTION_STRING").or_else(|| var("AzureWebJobsStorage")),
            var("CV_STORAGE_ACCOUNT"),
        ) {
            (Some(connection_string), _) => StorageSettings::ConnectionString(connection_string),
            (None, Some(account)) => StorageSettings::Account(account),
            (None, None) => {
                return Err("Missing CV_STORAGE_CONNECTION_STRING, AzureWebJobsStorage or CV_STORAGE_ACCOUNT environment variable.".into())
            }
        };

        Ok(Settings {
            port,
            log_level,
            turnstile_secret: var("TURNSTILE_SECRET_KEY"),
            verify_url,
            verify_timeout,
            document,
            storage,
        })
    }
}
