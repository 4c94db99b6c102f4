//! JSON-over-HTTP agent RPC client.
//!
//! Agents serve three endpoints:
//!
//! | method | path              | body                        |
//! |--------|-------------------|-----------------------------|
//! | POST   | `/initialize`     | [`InitializeRequest`]       |
//! | POST   | `/evaluate/block` | [`EvaluatePayload`]         |
//! | POST   | `/evaluate/tx`    | [`EvaluatePayload`]         |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::{
    AgentDescriptor, AgentId, DialError, EvaluationRequest, EvaluationResponse, Finding,
};
use crate::session::{AgentChannel, AgentConnector, ChannelError};

/// Handshake sent when a session opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub agent_id: AgentId,
    pub chain_id: Option<u64>,
}

/// Agent's answer to the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of an evaluate call.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluatePayload<'a> {
    pub request_id: &'a str,
    pub chain_id: Option<u64>,
    pub payload: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EvaluateReply {
    #[serde(default)]
    findings: Vec<Finding>,
}

/// Settings for [`HttpConnector`].
#[derive(Debug, Clone)]
pub struct HttpConnectorConfig {
    /// Container name prefix used to derive agent endpoints
    pub container_prefix: String,
    /// Connect timeout for every request
    pub connect_timeout: Duration,
    /// Upper bound for the initialize handshake
    pub handshake_timeout: Duration,
}

impl Default for HttpConnectorConfig {
    fn default() -> Self {
        Self {
            container_prefix: "fleet".to_string(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Opens [`HttpChannel`]s to agents.
pub struct HttpConnector {
    config: HttpConnectorConfig,
    http_client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(config: HttpConnectorConfig) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("fleetd/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl AgentConnector for HttpConnector {
    #[instrument(skip(self, descriptor), fields(agent_id = %descriptor.id))]
    async fn connect(
        &self,
        descriptor: &AgentDescriptor,
    ) -> Result<Arc<dyn AgentChannel>, DialError> {
        let endpoint = descriptor.resolved_endpoint(&self.config.container_prefix);
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let unreachable = |reason: String| DialError::Unreachable {
            agent_id: descriptor.id.clone(),
            endpoint: endpoint.clone(),
            reason,
        };

        let body = InitializeRequest {
            agent_id: descriptor.id.clone(),
            chain_id: descriptor.chain_id,
        };
        let response = self
            .http_client
            .post(format!("{endpoint}/initialize"))
            .timeout(self.config.handshake_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DialError::Rejected {
                agent_id: descriptor.id.clone(),
                reason: format!("initialize returned {}", response.status()),
            });
        }
        let reply: InitializeResponse = response.json().await.map_err(|e| DialError::Rejected {
            agent_id: descriptor.id.clone(),
            reason: format!("malformed initialize response: {e}"),
        })?;
        if !reply.accepted {
            return Err(DialError::Rejected {
                agent_id: descriptor.id.clone(),
                reason: reply.reason.unwrap_or_else(|| "rejected".to_string()),
            });
        }

        debug!(endpoint = %endpoint, "agent accepted initialize");
        Ok(Arc::new(HttpChannel {
            endpoint,
            http_client: self.http_client.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One agent's HTTP channel.
pub struct HttpChannel {
    endpoint: String,
    http_client: reqwest::Client,
    closed: AtomicBool,
}

impl HttpChannel {
    fn url_for(&self, request: &EvaluationRequest) -> String {
        format!("{}/evaluate/{}", self.endpoint, request.kind.as_str())
    }
}

/// Map a reqwest failure onto the channel taxonomy.
fn classify(err: reqwest::Error) -> ChannelError {
    if err.is_decode() || err.is_status() {
        ChannelError::Agent(err.to_string())
    } else {
        ChannelError::Transport(err.to_string())
    }
}

#[async_trait]
impl AgentChannel for HttpChannel {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResponse, ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Transport("channel closed".to_string()));
        }

        let started = Instant::now();
        let body = EvaluatePayload {
            request_id: &request.id.0,
            chain_id: request.chain_id,
            payload: &request.payload,
        };
        let response = self
            .http_client
            .post(self.url_for(request))
            .json(&body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChannelError::Agent(format!("{status}: {text}")));
        }
        let reply: EvaluateReply = response.json().await.map_err(classify)?;

        Ok(EvaluationResponse {
            findings: reply.findings,
            latency_ms: Some(started.elapsed().as_millis() as u64),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluate_urls_follow_request_kind() {
        let channel = HttpChannel {
            endpoint: "http://fleet-agent-a:50051".to_string(),
            http_client: reqwest::Client::new(),
            closed: AtomicBool::new(false),
        };
        assert_eq!(
            channel.url_for(&EvaluationRequest::block(json!({}))),
            "http://fleet-agent-a:50051/evaluate/block"
        );
        assert_eq!(
            channel.url_for(&EvaluationRequest::transaction(json!({}))),
            "http://fleet-agent-a:50051/evaluate/tx"
        );
    }

    #[test]
    fn initialize_response_reason_is_optional() {
        let reply: InitializeResponse = serde_json::from_value(json!({"accepted": true})).unwrap();
        assert!(reply.accepted);
        assert!(reply.reason.is_none());
    }

    #[tokio::test]
    async fn closed_channel_reports_transport_error() {
        let channel = HttpChannel {
            endpoint: "http://127.0.0.1:9".to_string(),
            http_client: reqwest::Client::new(),
            closed: AtomicBool::new(false),
        };
        channel.close().await;
        let err = channel
            .evaluate(&EvaluationRequest::block(json!({"n": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let connector = HttpConnector::new(HttpConnectorConfig {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .unwrap();
        let descriptor = AgentDescriptor::new("a", "img").with_endpoint("http://127.0.0.1:1");
        let err = connector.connect(&descriptor).await.err().unwrap();
        assert!(matches!(err, DialError::Unreachable { .. }));
    }
}
