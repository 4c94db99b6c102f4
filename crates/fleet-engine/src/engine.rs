//! The container engine capability set.
//!
//! Everything the node does to containers goes through [`ContainerEngine`].
//! The Docker implementation lives in [`crate::docker`]; an in-memory fake for
//! tests lives in [`crate::fakes`].

use async_trait::async_trait;

use crate::error::EngineError;
use crate::types::{ContainerHandle, ContainerSpec, NetworkHandle};

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Container runtime adapter.
///
/// Guarantees:
/// - `create_*_network(name)` returns the existing handle when `name` exists.
/// - `stop_container` on an unknown or stopped container is `Ok(())`.
/// - `start_container` returns only after every network in the spec is attached.
/// - `attach_network` on an already-attached pair is `Ok(())`.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull `image` from its registry. Always goes to the network.
    async fn pull_image(&self, image: &str) -> EngineResult<()>;

    /// Whether `image` is present in the local image cache. Never pulls.
    async fn has_local_image(&self, image: &str) -> bool;

    /// Create (or look up) the node's public network.
    async fn create_public_network(&self, name: &str) -> EngineResult<NetworkHandle>;

    /// Create (or look up) the node's internal, host-isolated network.
    async fn create_internal_network(&self, name: &str) -> EngineResult<NetworkHandle>;

    /// Attach a running container to an existing network.
    async fn attach_network(&self, container_id: &str, network_id: &str) -> EngineResult<()>;

    /// Snapshot of every container known to the engine.
    async fn list_containers(&self) -> EngineResult<Vec<ContainerHandle>>;

    /// Create and start a container from `spec`.
    async fn start_container(&self, spec: &ContainerSpec) -> EngineResult<ContainerHandle>;

    /// Stop (and release) a container.
    async fn stop_container(&self, container_id: &str) -> EngineResult<()>;

    /// Remove stopped containers, dangling images and unused networks.
    async fn prune(&self) -> EngineResult<()>;
}
