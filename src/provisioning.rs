//! Card-generation client — one POST per validated request to the
//! provisioning service.
//!
//! Any response that arrives with a JSON body counts as delivered, whatever
//! its status code. Only transport failures (connect, timeout, unreadable or
//! non-JSON body) are errors. No retries.

use async_trait::async_trait;

use crate::error::HttpError;
use crate::pipeline::types::ProvisioningPayload;

/// What the provisioning service answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ProvisioningResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends card-generation requests.
#[async_trait]
pub trait CardGenerationClient: Send + Sync {
    async fn request_card_generation(
        &self,
        payload: &ProvisioningPayload,
    ) -> Result<ProvisioningResponse, HttpError>;
}

/// reqwest-backed client. Cheap to share; the connection pool lives inside.
#[derive(Debug, Clone)]
pub struct HttpCardGenerationClient {
    client: reqwest::Client,
    url: String,
}

impl HttpCardGenerationClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CardGenerationClient for HttpCardGenerationClient {
    async fn request_card_generation(
        &self,
        payload: &ProvisioningPayload,
    ) -> Result<ProvisioningResponse, HttpError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| HttpError::Request {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| HttpError::InvalidBody {
                url: self.url.clone(),
                status,
                reason: e.to_string(),
            })?;

        Ok(ProvisioningResponse { status, body })
    }
}
