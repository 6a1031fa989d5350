use crate::utils::app_error::AppError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const SITEVERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

/// Reply of the verification service. Only `success` decides anything,
/// the rest is kept for the log.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct VerificationResult {
    #[serde(default)]
    pub success: bool,
    /// Cloudflare sends `error-codes`; some proxies rewrite it to `errorCodes`.
    #[serde(default, rename = "error-codes")]
    pub error_codes: Option<Vec<String>>,
    #[serde(default, rename = "errorCodes")]
    pub error_codes_camel: Option<Vec<String>>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub challenge_ts: Option<String>,
}

impl VerificationResult {
    /// Codes from both spellings, `error-codes` first, without repeats.
    pub fn error_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = Vec::new();
        for code in self.error_codes.iter().chain(&self.error_codes_camel).flatten() {
            if !codes.contains(code) {
                codes.push(code.clone());
            }
        }
        codes
    }
}

/// Anything that can tell whether a captcha token is genuine.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerificationResult, AppError>;
}

/// Cloudflare Turnstile `siteverify` client.
pub struct Turnstile {
    client: Client,
    url: Url,
    secret: Option<String>,
}

impl Turnstile {
    pub fn new(url: Url, secret: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, secret })
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }
}

#[async_trait]
impl TokenVerifier for Turnstile {
    /// Posts the token once; there are no retries.
    async fn verify(&self, token: &str) -> Result<VerificationResult, AppError> {
        let secret = self
            .secret
            .as_deref()
            .ok_or(AppError::Misconfigured("TURNSTILE_SECRET_KEY"))?;

        log::info!("Verifying token with {}", self.url.host_str().unwrap_or("verification service"));

        let response = self
            .client
            .post(self.url.clone())
            .form(&[("secret", secret), ("response", token)])
            .send()
            .await
            .map_err(|err| AppError::UpstreamUnavailable(err.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamUnavailable(format!("status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| AppError::UpstreamUnavailable(err.without_url().to_string()))?;

        let result: VerificationResult =
            serde_json::from_slice(&body).map_err(AppError::UpstreamMalformed)?;

        log::info!(
            "Verification finished: success={} hostname={:?} challenge_ts={:?}",
            result.success,
            result.hostname,
            result.challenge_ts
        );

        Ok(result)
    }
}
