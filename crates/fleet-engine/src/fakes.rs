//! In-memory fakes for the engine trait (testing only)
//!
//! `MemoryEngine` satisfies the [`ContainerEngine`] contract without a Docker
//! daemon. Failures can be injected per image / container name, and every
//! mutating call is appended to a [`Journal`] that can be shared with other
//! fakes to assert cross-component call ordering.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::engine::{ContainerEngine, EngineResult};
use crate::error::EngineError;
use crate::types::{ContainerHandle, ContainerSpec, ContainerStatus, NetworkClass, NetworkHandle};

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Append-only, shareable log of calls made against fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Position of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().unwrap().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }

    /// Number of entries starting with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

// ---------------------------------------------------------------------------
// MemoryEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeContainer {
    handle: ContainerHandle,
    networks: HashSet<String>,
}

#[derive(Debug, Default)]
struct EngineState {
    local_images: HashSet<String>,
    networks: HashMap<String, NetworkHandle>,
    containers: HashMap<String, FakeContainer>,
    failing_pulls: HashSet<String>,
    failing_starts: HashSet<String>,
    failing_stops: HashSet<String>,
    fail_prune: bool,
    fail_networks: bool,
    next_id: u64,
}

impl EngineState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }
}

/// In-memory container engine.
///
/// Every image is pullable unless marked with [`MemoryEngine::fail_pull`].
/// Starting a container requires its image to be local, mirroring a real
/// engine's "missing image" failure.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    journal: Journal,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record calls into an externally shared journal.
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            journal,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Seed the local image cache.
    pub fn add_local_image(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .local_images
            .insert(image.to_string());
    }

    /// Make every pull of `image` fail.
    pub fn fail_pull(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_pulls
            .insert(image.to_string());
    }

    /// Make every start of a container named `name` fail.
    pub fn fail_start(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_starts
            .insert(name.to_string());
    }

    /// Make stopping the container with `id` fail.
    pub fn fail_stop(&self, container_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_stops
            .insert(container_id.to_string());
    }

    pub fn set_fail_prune(&self, fail: bool) {
        self.state.lock().unwrap().fail_prune = fail;
    }

    pub fn set_fail_networks(&self, fail: bool) {
        self.state.lock().unwrap().fail_networks = fail;
    }

    /// Simulate a container exiting on its own.
    pub fn crash_container(&self, container_id: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container_id) {
            c.handle.status = ContainerStatus::Exited;
        }
    }

    /// Current handle for a container by name.
    pub fn container_by_name(&self, name: &str) -> Option<ContainerHandle> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.handle.name == name)
            .map(|c| c.handle.clone())
    }

    /// Names of containers currently running.
    pub fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.handle.status == ContainerStatus::Running)
            .map(|c| c.handle.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Network IDs a container is attached to.
    pub fn networks_of(&self, container_id: &str) -> HashSet<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.networks.clone())
            .unwrap_or_default()
    }

    fn ensure_network(&self, name: &str, class: NetworkClass) -> EngineResult<NetworkHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail_networks {
            return Err(EngineError::NetworkCreate {
                name: name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        if let Some(existing) = state.networks.get(name) {
            return Ok(existing.clone());
        }
        let handle = NetworkHandle {
            id: state.next_id("net"),
            name: name.to_string(),
            class,
        };
        state.networks.insert(name.to_string(), handle.clone());
        self.journal.record(format!("create_network:{name}"));
        Ok(handle)
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        self.journal.record(format!("pull:{image}"));
        let mut state = self.state.lock().unwrap();
        if state.failing_pulls.contains(image) {
            return Err(EngineError::ImagePull {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        state.local_images.insert(image.to_string());
        Ok(())
    }

    async fn has_local_image(&self, image: &str) -> bool {
        self.state.lock().unwrap().local_images.contains(image)
    }

    async fn create_public_network(&self, name: &str) -> EngineResult<NetworkHandle> {
        self.ensure_network(name, NetworkClass::Public)
    }

    async fn create_internal_network(&self, name: &str) -> EngineResult<NetworkHandle> {
        self.ensure_network(name, NetworkClass::Internal)
    }

    async fn attach_network(&self, container_id: &str, network_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let network_known = state.networks.values().any(|n| n.id == network_id);
        let attach_err = |reason: &str| EngineError::Attach {
            container_id: container_id.to_string(),
            network_id: network_id.to_string(),
            reason: reason.to_string(),
        };
        if !network_known {
            return Err(attach_err("no such network"));
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| attach_err("no such container"))?;
        if container.handle.status != ContainerStatus::Running {
            return Err(attach_err("container is not running"));
        }
        if container.networks.insert(network_id.to_string()) {
            self.journal
                .record(format!("attach:{}:{network_id}", container.handle.name));
        }
        Ok(())
    }

    async fn list_containers(&self) -> EngineResult<Vec<ContainerHandle>> {
        let state = self.state.lock().unwrap();
        let mut handles: Vec<ContainerHandle> =
            state.containers.values().map(|c| c.handle.clone()).collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(handles)
    }

    async fn start_container(&self, spec: &ContainerSpec) -> EngineResult<ContainerHandle> {
        let mut state = self.state.lock().unwrap();
        let start_err = |reason: &str| EngineError::Start {
            name: spec.name.clone(),
            reason: reason.to_string(),
        };

        if state.failing_starts.contains(&spec.name) {
            return Err(start_err("injected failure"));
        }
        if !state.local_images.contains(&spec.image) {
            return Err(start_err("no such image"));
        }
        if state.containers.values().any(|c| c.handle.name == spec.name) {
            return Err(start_err("container name already in use"));
        }
        for network_id in &spec.networks {
            if !state.networks.values().any(|n| &n.id == network_id) {
                return Err(start_err(&format!("no such network {network_id}")));
            }
        }

        let handle = ContainerHandle {
            id: state.next_id("ctr"),
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: ContainerStatus::Running,
        };
        state.containers.insert(
            handle.id.clone(),
            FakeContainer {
                handle: handle.clone(),
                networks: spec.networks.iter().cloned().collect(),
            },
        );
        self.journal.record(format!("start:{}", spec.name));
        Ok(handle)
    }

    async fn stop_container(&self, container_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_stops.contains(container_id) {
            return Err(EngineError::Stop {
                container_id: container_id.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        // Stopped containers are removed so their name can be reused.
        if let Some(removed) = state.containers.remove(container_id) {
            self.journal.record(format!("stop:{}", removed.handle.name));
        }
        Ok(())
    }

    async fn prune(&self) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_prune {
            return Err(EngineError::Prune("injected failure".to_string()));
        }
        state
            .containers
            .retain(|_, c| c.handle.status == ContainerStatus::Running);
        let in_use: HashSet<String> = state
            .containers
            .values()
            .map(|c| c.handle.image.clone())
            .collect();
        state.local_images.retain(|image| in_use.contains(image));
        self.journal.record("prune");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_requires_local_image() {
        let engine = MemoryEngine::new();
        let err = engine
            .start_container(&ContainerSpec::new("a", "img:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Start { .. }));

        engine.pull_image("img:1").await.unwrap();
        let handle = engine
            .start_container(&ContainerSpec::new("a", "img:1"))
            .await
            .unwrap();
        assert_eq!(handle.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn journal_is_shared() {
        let journal = Journal::new();
        let engine = MemoryEngine::with_journal(journal.clone());
        engine.pull_image("img:1").await.unwrap();
        assert!(journal.contains("pull:img:1"));
    }
}
