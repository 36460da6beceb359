//! Bootstrap RPC Client
//!
//! HTTP client for the remote "enable live updates for this resource" call.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::error::{ProviderError, ProviderResult};
use super::BootstrapRpc;

/// Configuration for the HTTP bootstrap client
#[derive(Debug, Clone)]
pub struct HttpBootstrapConfig {
    /// Base URL of the data API (e.g., "http://localhost:54321")
    pub base_url: String,
    /// Path of the RPC endpoint
    pub rpc_path: String,
    /// API key sent as `apikey` and bearer token
    pub api_key: Option<String>,
    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for HttpBootstrapConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            rpc_path: "/rest/v1/rpc/enable_realtime".to_string(),
            api_key: None,
            request_timeout_ms: 5000,
        }
    }
}

/// Calls the bootstrap RPC over HTTP
pub struct HttpBootstrapClient {
    client: Client,
    config: HttpBootstrapConfig,
}

#[derive(Debug, Serialize)]
struct EnableRealtimeRequest<'a> {
    resource: &'a str,
}

impl HttpBootstrapClient {
    pub fn new(config: HttpBootstrapConfig) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpBootstrapConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.rpc_path
        )
    }
}

#[async_trait]
impl BootstrapRpc for HttpBootstrapClient {
    async fn enable_realtime(&self, resource: &str) -> ProviderResult<()> {
        let mut request = self
            .client
            .post(self.endpoint())
            .json(&EnableRealtimeRequest { resource });

        if let Some(key) = &self.config.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else if e.is_connect() {
                ProviderError::Unavailable
            } else {
                ProviderError::Request(e)
            }
        })?;

        if response.status().is_success() {
            tracing::debug!(resource = %resource, "Realtime enabled for resource");
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(ProviderError::Rpc {
                status: status.as_u16(),
                message: text,
            })
        }
    }
}
