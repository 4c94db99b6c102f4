//! Fleet-Engine: container engine adapter for the fleet node agent
//!
//! ## Layer 0 - Container Runtime
//!
//! Focus: image, network and container lifecycle behind one capability trait.
//!
//! ## Key Components
//!
//! - `ContainerEngine`: the adapter contract every runtime implements
//! - `DockerEngine`: production implementation over the Docker API
//! - `fakes::MemoryEngine`: deterministic in-memory double for tests

pub mod docker;
mod engine;
mod error;
pub mod fakes;
mod types;

pub use docker::{DockerEngine, DockerEngineConfig, RegistryAuth};
pub use engine::{ContainerEngine, EngineResult};
pub use error::EngineError;
pub use types::{
    ContainerHandle, ContainerSpec, ContainerStatus, NetworkClass, NetworkHandle, ResourceLimits,
};
