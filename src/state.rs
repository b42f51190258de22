use crate::backup::BackupEngine;
use crate::config::{Config, NamespaceFilter};
use crate::controller::{KubeWorkloadStore, WorkloadReconciler};
use crate::oci_registry::RegistryClient;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub type ClusterReconciler = WorkloadReconciler<KubeWorkloadStore, BackupEngine<RegistryClient>>;

pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Config,
    pub(crate) namespace_filter: NamespaceFilter,
    pub(crate) reconciler: ClusterReconciler,
    pub(crate) health: HealthState,
}

/// Shared between the controllers and the probe endpoints
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
