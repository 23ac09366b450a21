//! HTTP client for a remote policy evaluator.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{PolicyError, PolicyEvaluator, PolicyRequest, PolicyResponse};

/// Calls `POST {base_url}/policy/evaluate`
pub struct HttpPolicyEvaluator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPolicyEvaluator {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, PolicyError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PolicyError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/policy/evaluate", self.base_url)
    }
}

#[async_trait]
impl PolicyEvaluator for HttpPolicyEvaluator {
    fn name(&self) -> &str {
        "http"
    }

    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyResponse, PolicyError> {
        let url = self.endpoint();
        debug!(%url, action = %request.action, "Evaluating policy");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PolicyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<PolicyResponse>()
            .await
            .map_err(|e| PolicyError::Decode(e.to_string()))
    }
}
