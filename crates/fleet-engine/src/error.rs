//! Error types for fleet-engine

use thiserror::Error;

/// Errors surfaced by a [`ContainerEngine`](crate::ContainerEngine).
///
/// Each variant maps to one adapter operation so callers can tell which step
/// of a container lifecycle failed without parsing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Image could not be pulled (auth failure, unknown reference, timeout)
    #[error("failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    /// Network could not be created or looked up
    #[error("failed to create network {name}: {reason}")]
    NetworkCreate { name: String, reason: String },

    /// Container could not be attached to a network
    #[error("failed to attach container {container_id} to network {network_id}: {reason}")]
    Attach {
        container_id: String,
        network_id: String,
        reason: String,
    },

    /// Container could not be created or started
    #[error("failed to start container {name}: {reason}")]
    Start { name: String, reason: String },

    /// Container could not be stopped
    #[error("failed to stop container {container_id}: {reason}")]
    Stop {
        container_id: String,
        reason: String,
    },

    /// Engine-wide prune failed
    #[error("prune failed: {0}")]
    Prune(String),

    /// Listing containers failed
    #[error("failed to list containers: {0}")]
    List(String),

    /// Could not reach the engine at all
    #[error("container engine connection failed: {0}")]
    Connection(String),
}

impl EngineError {
    /// Short, stable label for the failing operation (used in logs).
    pub fn operation(&self) -> &'static str {
        match self {
            Self::ImagePull { .. } => "pull_image",
            Self::NetworkCreate { .. } => "create_network",
            Self::Attach { .. } => "attach_network",
            Self::Start { .. } => "start_container",
            Self::Stop { .. } => "stop_container",
            Self::Prune(_) => "prune",
            Self::List(_) => "list_containers",
            Self::Connection(_) => "connect",
        }
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        EngineError::Connection(err.to_string())
    }
}
