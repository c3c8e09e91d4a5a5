//! HTTP Controller Client
//!
//! Reference implementation of [`ControllerEndpoint`] over HTTP + JSON,
//! plus the matching [`ContainerDownloader`] used by the default
//! replicator. A deployment with a different wire transport implements
//! the same traits at this seam and the rest of the agent is unchanged.
//!
//! Authentication is an opaque bearer token handed over by the
//! certificate layer; the client attaches it to every request and never
//! inspects it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use slate_common::command::ControllerCommand;
use slate_common::report::HeartbeatPayload;

use crate::connection::{ControllerEndpoint, EndpointError};
use crate::replication::{ContainerDownloader, ReplicationError};

/// Response body of `POST /v1/heartbeat`.
#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    commands: Vec<ControllerCommand>,
}

pub struct HttpControllerClient {
    base: String,
    auth_token: Option<String>,
    client: Client,
}

impl HttpControllerClient {
    /// `base` is the controller base URL, e.g. `http://controller-0:9860`.
    pub fn new(
        base: impl Into<String>,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, EndpointError> {
        let base = base.into();
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EndpointError::Protocol(base.clone(), e.to_string()))?;
        Ok(Self {
            base,
            auth_token,
            client,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl ControllerEndpoint for HttpControllerClient {
    fn address(&self) -> &str {
        &self.base
    }

    async fn heartbeat(
        &self,
        payload: &HeartbeatPayload,
    ) -> Result<Vec<ControllerCommand>, EndpointError> {
        let url = format!("{}/v1/heartbeat", self.base);
        let resp = self
            .authorized(self.client.post(&url).json(payload))
            .send()
            .await
            .map_err(|e| EndpointError::Unreachable(self.base.clone(), e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EndpointError::Protocol(
                self.base.clone(),
                format!("heartbeat returned {} {}", status, body),
            ));
        }
        let parsed: HeartbeatResponse = resp
            .json()
            .await
            .map_err(|e| EndpointError::Protocol(self.base.clone(), e.to_string()))?;
        debug!(
            endpoint = %self.base,
            commands = parsed.commands.len(),
            "heartbeat accepted"
        );
        Ok(parsed.commands)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CONTAINER DOWNLOADER
// ════════════════════════════════════════════════════════════════════════════

/// Fetches replicated container data from a peer node over HTTP.
///
/// Only the byte count crosses this seam; the payload itself is handed
/// straight to the storage engine by the replicator.
pub struct HttpContainerDownloader {
    client: Client,
    auth_token: Option<String>,
}

impl HttpContainerDownloader {
    pub fn new(
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, ReplicationError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ReplicationError::Download {
                container_id: 0,
                source_node: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(Self { client, auth_token }))
    }
}

#[async_trait]
impl ContainerDownloader for HttpContainerDownloader {
    async fn download(&self, container_id: u64, source: &str) -> Result<u64, ReplicationError> {
        let url = format!("http://{}/v1/containers/{}", source, container_id);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| ReplicationError::Download {
            container_id,
            source_node: source.to_string(),
            reason: e.to_string(),
        })?;
        if !resp.status().is_success() {
            return Err(ReplicationError::Download {
                container_id,
                source_node: source.to_string(),
                reason: format!("status {}", resp.status()),
            });
        }
        let body = resp.bytes().await.map_err(|e| ReplicationError::Download {
            container_id,
            source_node: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_common::command::CommandKind;

    #[test]
    fn heartbeat_response_parses_commands() {
        let raw = r#"{
            "commands": [
                {"id": 12, "payload": {"type": "close_container", "container_id": 4}},
                {"id": 13, "payload": {"type": "replicate_container",
                                        "container_id": 5,
                                        "sources": ["10.0.0.2:9859"]}}
            ]
        }"#;
        let parsed: HeartbeatResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.commands.len(), 2);
        assert_eq!(parsed.commands[0].kind(), CommandKind::CloseContainer);
        assert_eq!(parsed.commands[1].id, 13);
    }

    #[test]
    fn empty_response_means_no_commands() {
        let parsed: HeartbeatResponse = serde_json::from_str("{}").expect("parse");
        assert!(parsed.commands.is_empty());
    }
}
