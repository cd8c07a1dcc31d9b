//! Registration exchange with the provisioning service.

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::info;

use iotlink_core::{RegistrationRequest, RegistrationResult};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("registration service not configured")]
    NotConfigured,
}

#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResult, RegistrationError>;
}

#[derive(Clone)]
pub struct RegistrationClient {
    http: Client,
    base_url: String,
    token: String,
}

impl RegistrationClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/registerIotDevice", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Registrar for RegistrationClient {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResult, RegistrationError> {
        info!(device_id = %request.device_id, "registering device");
        let res = self
            .http
            .post(self.endpoint())
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .json(request)
            .send()
            .await?;

        if res.status().is_success() {
            Ok(res.json::<RegistrationResult>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(RegistrationError::UnexpectedStatus { status, body })
        }
    }
}

/// Stand-in used when no registration endpoint is configured.
pub struct NoRegistrar;

#[async_trait]
impl Registrar for NoRegistrar {
    async fn register(
        &self,
        _request: &RegistrationRequest,
    ) -> Result<RegistrationResult, RegistrationError> {
        Err(RegistrationError::NotConfigured)
    }
}
