//! Back-channel transport from the SP to the IDP's artifact resolution service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::{
    soap::{SOAP_ACTION, SOAP_CONTENT_TYPE},
    SamlError,
};

/// Sends a SOAP envelope and returns the raw reply body.
///
/// One call per artifact; implementations must not retry.
#[async_trait]
pub trait ArtifactResolutionClient: Send + Sync {
    async fn send(&self, endpoint: &str, envelope: String) -> Result<String, SamlError>;
}

/// SOAP over HTTP(S) with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpSoapClient {
    client: reqwest::Client,
}

impl HttpSoapClient {
    pub fn new(timeout: Duration) -> Result<Self, SamlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SamlError::Configuration(format!("HTTP client: {e}")))?;
        Ok(HttpSoapClient { client })
    }
}

fn transport_error(error: reqwest::Error) -> SamlError {
    if error.is_timeout() {
        SamlError::Timeout
    } else {
        SamlError::Transport(error.to_string())
    }
}

#[async_trait]
impl ArtifactResolutionClient for HttpSoapClient {
    async fn send(&self, endpoint: &str, envelope: String) -> Result<String, SamlError> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SamlError::Transport(format!(
                "artifact resolution service answered {status}"
            )));
        }
        response.text().await.map_err(transport_error)
    }
}
