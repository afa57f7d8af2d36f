// Direktiv reconciler
//
// Converges the desired service list (from service files and workflow
// container functions) onto knative, docker, or an in-memory runtime.

pub mod docker;
pub mod error;
pub mod knative;
pub mod memory;
pub mod reconciler;
pub mod runtime;
pub mod service;

use std::sync::Arc;

use direktiv_core::{Config, FunctionsBackend};

pub use docker::DockerClient;
pub use error::ReconcileError;
pub use knative::KnativeClient;
pub use memory::MemoryRuntime;
pub use reconciler::{
    ItemError, Operation, Plan, ReconcileReport, Reconciler, ReconcilerConfig, ServiceFilter,
    ServiceStatus,
};
pub use runtime::{LogStream, PodInfo, RuntimeClient, RuntimeService};
pub use service::{service_id, service_url, ServiceDefinition, ServiceSize, ServiceType};

/// Runtime client for the configured back-end
pub fn runtime_from_config(config: &Config) -> Arc<dyn RuntimeClient> {
    match config.functions_backend {
        FunctionsBackend::Knative => Arc::new(KnativeClient::in_cluster(
            config.kube_api.clone(),
            config.knative_namespace.clone(),
        )),
        FunctionsBackend::Docker => Arc::new(DockerClient::new(config.docker_host.clone())),
        FunctionsBackend::Memory => Arc::new(MemoryRuntime::new()),
    }
}
