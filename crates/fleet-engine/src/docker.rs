//! Docker-backed [`ContainerEngine`] built on `bollard`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, PruneContainersOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, PruneImagesOptions};
use bollard::models::{ContainerSummary, EndpointSettings, HostConfig};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions, PruneNetworksOptions,
};
use bollard::Docker;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::engine::{ContainerEngine, EngineResult};
use crate::error::EngineError;
use crate::types::{ContainerHandle, ContainerSpec, ContainerStatus, NetworkClass, NetworkHandle};

/// Label stamped on every container and network this node creates.
pub const NODE_LABEL: &str = "fleet.node";

/// Registry credentials used for image pulls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub server: Option<String>,
    pub username: String,
    pub password: String,
}

/// Tunables for the Docker adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerEngineConfig {
    /// Value of the [`NODE_LABEL`] label
    pub node_name: String,
    /// Grace period before the engine kills a stopping container (seconds)
    pub stop_grace_secs: i64,
    /// Upper bound on a single image pull (seconds)
    pub pull_timeout_secs: u64,
    /// Optional registry credentials
    pub registry_auth: Option<RegistryAuth>,
}

impl Default for DockerEngineConfig {
    fn default() -> Self {
        Self {
            node_name: "fleet".to_string(),
            stop_grace_secs: 10,
            pull_timeout_secs: 300,
            registry_auth: None,
        }
    }
}

/// [`ContainerEngine`] talking to a local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
    config: DockerEngineConfig,
}

/// Whether a bollard error is a server response with one of `codes`.
fn is_status(err: &BollardError, codes: &[u16]) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

/// Scale a resource limit into engine units, rejecting values that do not fit.
fn scaled_limit(value: Option<u64>, factor: u64, what: &str) -> Result<Option<i64>, String> {
    value
        .map(|v| {
            v.checked_mul(factor)
                .and_then(|scaled| i64::try_from(scaled).ok())
                .ok_or_else(|| format!("{what} limit {v} is out of range"))
        })
        .transpose()
}

/// Map a list entry to a handle. Entries without an ID are skipped.
fn container_handle(summary: ContainerSummary) -> Option<ContainerHandle> {
    let id = summary.id?;
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    Some(ContainerHandle {
        id,
        name,
        image: summary.image.unwrap_or_default(),
        status: summary
            .state
            .as_deref()
            .map(ContainerStatus::from_engine_state)
            .unwrap_or(ContainerStatus::Unknown),
    })
}

/// Whether `network_id` (by name or ID) is among a container's endpoints.
fn is_attached(networks: Option<&HashMap<String, EndpointSettings>>, network_id: &str) -> bool {
    networks.is_some_and(|nets| {
        nets.iter().any(|(name, endpoint)| {
            name == network_id || endpoint.network_id.as_deref() == Some(network_id)
        })
    })
}

impl DockerEngine {
    /// Connect using the platform defaults (unix socket / named pipe / `DOCKER_HOST`).
    pub fn connect(config: DockerEngineConfig) -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(Self { docker, config })
    }

    /// Wrap an existing client.
    pub fn from_client(docker: Docker, config: DockerEngineConfig) -> Self {
        Self { docker, config }
    }

    fn labels(&self) -> HashMap<String, String> {
        HashMap::from([(NODE_LABEL.to_string(), self.config.node_name.clone())])
    }

    fn credentials(&self) -> Option<DockerCredentials> {
        self.config.registry_auth.as_ref().map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: auth.server.clone(),
            ..Default::default()
        })
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, BollardError> {
        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;
        // The name filter matches substrings; require an exact match.
        Ok(networks
            .into_iter()
            .find(|n| n.name.as_deref() == Some(name))
            .and_then(|n| n.id))
    }

    async fn ensure_network(
        &self,
        name: &str,
        class: NetworkClass,
    ) -> EngineResult<NetworkHandle> {
        let create_err = |e: BollardError| EngineError::NetworkCreate {
            name: name.to_string(),
            reason: e.to_string(),
        };

        if let Some(id) = self.find_network(name).await.map_err(create_err)? {
            debug!(network = %name, id = %id, "network already exists");
            return Ok(NetworkHandle {
                id,
                name: name.to_string(),
                class,
            });
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            internal: class == NetworkClass::Internal,
            attachable: true,
            labels: self.labels(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(create_err)?;

        let id = self
            .find_network(name)
            .await
            .map_err(create_err)?
            .ok_or_else(|| EngineError::NetworkCreate {
                name: name.to_string(),
                reason: "network not visible after creation".to_string(),
            })?;

        info!(network = %name, id = %id, class = ?class, "created network");
        Ok(NetworkHandle {
            id,
            name: name.to_string(),
            class,
        })
    }

    async fn remove_quietly(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            if !is_status(&e, &[404, 409]) {
                warn!(container_id = %container_id, error = %e, "failed to remove container");
            }
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let pull = self
            .docker
            .create_image(Some(options), None, self.credentials())
            .try_collect::<Vec<_>>();

        let timeout = Duration::from_secs(self.config.pull_timeout_secs);
        match tokio::time::timeout(timeout, pull).await {
            Ok(Ok(_)) => {
                info!(image = %image, "pulled image");
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(EngineError::ImagePull {
                image: image.to_string(),
                reason: format!("timed out after {}s", self.config.pull_timeout_secs),
            }),
        }
    }

    async fn has_local_image(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn create_public_network(&self, name: &str) -> EngineResult<NetworkHandle> {
        self.ensure_network(name, NetworkClass::Public).await
    }

    async fn create_internal_network(&self, name: &str) -> EngineResult<NetworkHandle> {
        self.ensure_network(name, NetworkClass::Internal).await
    }

    #[instrument(skip(self))]
    async fn attach_network(&self, container_id: &str, network_id: &str) -> EngineResult<()> {
        let attach_err = |reason: String| EngineError::Attach {
            container_id: container_id.to_string(),
            network_id: network_id.to_string(),
            reason,
        };

        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| attach_err(e.to_string()))?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(attach_err("container is not running".to_string()));
        }

        let networks = inspect
            .network_settings
            .as_ref()
            .and_then(|s| s.networks.as_ref());
        if is_attached(networks, network_id) {
            return Ok(());
        }

        self.docker
            .connect_network(
                network_id,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await
            .map_err(|e| attach_err(e.to_string()))
    }

    async fn list_containers(&self) -> EngineResult<Vec<ContainerHandle>> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| EngineError::List(e.to_string()))?;

        Ok(summaries.into_iter().filter_map(container_handle).collect())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn start_container(&self, spec: &ContainerSpec) -> EngineResult<ContainerHandle> {
        let start_err = |reason: String| EngineError::Start {
            name: spec.name.clone(),
            reason,
        };

        let memory = scaled_limit(spec.limits.memory_mb, 1024 * 1024, "memory").map_err(start_err)?;
        let nano_cpus = scaled_limit(spec.limits.cpu_millis, 1_000_000, "cpu").map_err(start_err)?;
        let host_config = HostConfig {
            network_mode: spec.networks.first().cloned(),
            memory,
            nano_cpus,
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env_pairs()),
            labels: Some(self.labels()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| start_err(e.to_string()))?;
        let container_id = response.id;

        // The first network is set as network_mode; connect the rest before start.
        for network_id in spec.networks.iter().skip(1) {
            if let Err(e) = self
                .docker
                .connect_network(
                    network_id,
                    ConnectNetworkOptions {
                        container: container_id.clone(),
                        endpoint_config: EndpointSettings::default(),
                    },
                )
                .await
            {
                self.remove_quietly(&container_id).await;
                return Err(start_err(format!("failed to attach {network_id}: {e}")));
            }
        }

        if let Err(e) = self
            .docker
            .start_container::<String>(&container_id, None)
            .await
        {
            self.remove_quietly(&container_id).await;
            return Err(start_err(format!("failed to start container: {e}")));
        }

        info!(container_id = %container_id, "started container");
        Ok(ContainerHandle {
            id: container_id,
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: ContainerStatus::Running,
        })
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, container_id: &str) -> EngineResult<()> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: self.config.stop_grace_secs,
                }),
            )
            .await
        {
            Ok(()) => {}
            // 304: already stopped, 404: unknown. Both satisfy the desired state.
            Err(e) if is_status(&e, &[304, 404]) => {
                debug!(container_id = %container_id, "container already stopped or absent");
            }
            Err(e) => {
                return Err(EngineError::Stop {
                    container_id: container_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        // Free the name so the same agent can be started again later.
        self.remove_quietly(container_id).await;
        info!(container_id = %container_id, "stopped container");
        Ok(())
    }

    async fn prune(&self) -> EngineResult<()> {
        self.docker
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await
            .map_err(|e| EngineError::Prune(format!("containers: {e}")))?;
        self.docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .map_err(|e| EngineError::Prune(format!("images: {e}")))?;
        self.docker
            .prune_networks(None::<PruneNetworksOptions<String>>)
            .await
            .map_err(|e| EngineError::Prune(format!("networks: {e}")))?;
        info!("pruned unreferenced containers, images and networks");
        Ok(())
    }
}
