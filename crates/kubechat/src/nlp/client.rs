//! HTTP client for the command generation service.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::error::{GenerationError, GenerationResult};
use super::{CommandGenerator, GeneratedCommand, GenerationRequest};

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: String,
}

/// Posts queries to `<base_url>/generate`.
#[derive(Debug, Clone)]
pub struct HttpCommandGenerator {
    client: Client,
    base_url: String,
}

impl HttpCommandGenerator {
    /// The engine applies its own deadline; the client timeout is only a backstop.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> GenerationResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn handle_response(&self, response: reqwest::Response) -> GenerationResult<GeneratedCommand> {
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ApiErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
            };
            return Err(GenerationError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let generated: GeneratedCommand = response
            .json()
            .await
            .map_err(|e| GenerationError::ParseError(e.to_string()))?;
        if generated.command.trim().is_empty() {
            return Err(GenerationError::EmptyCommand);
        }
        Ok(generated)
    }
}

#[async_trait]
impl CommandGenerator for HttpCommandGenerator {
    async fn generate(&self, request: GenerationRequest) -> GenerationResult<GeneratedCommand> {
        let url = format!("{}/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::ConnectionFailed {
                url: url.clone(),
                message: e.to_string(),
            })?;

        self.handle_response(response).await
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = HttpCommandGenerator::new("http://nlp.local:8090/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://nlp.local:8090");
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let client = HttpCommandGenerator::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client
            .generate(GenerationRequest {
                query: "list pods".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ConnectionFailed { .. }));
        assert!(!client.is_available().await);
    }
}
