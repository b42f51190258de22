use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a workload as delivered by a watch event. `kind` is the kind that was watched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSection {
    InitContainers,
    Containers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSlot {
    pub section: SlotSection,
    pub index: usize,
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessSignal {
    pub desired: i32,
    pub ready: i32,
}

impl ReadinessSignal {
    /// A workload that wants zero instances is never ready
    pub fn is_ready(&self) -> bool {
        self.desired == self.ready && self.desired > 0
    }
}

/// Pod-template access shared by every workload kind the controller backs up
pub trait Workload: Send + Sync {
    fn workload_kind(&self) -> WorkloadKind;
    fn readiness(&self) -> ReadinessSignal;
    fn pod_spec(&self) -> Option<&PodSpec>;
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn is_ready(&self) -> bool {
        self.readiness().is_ready()
    }

    fn image_pull_secret_count(&self) -> usize {
        self.pod_spec()
            .and_then(|ps| ps.image_pull_secrets.as_ref())
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn init_container_slots(&self) -> Vec<ContainerSlot> {
        self.pod_spec()
            .and_then(|ps| ps.init_containers.as_deref())
            .map(|containers| slots(SlotSection::InitContainers, containers))
            .unwrap_or_default()
    }

    fn container_slots(&self) -> Vec<ContainerSlot> {
        self.pod_spec()
            .map(|ps| slots(SlotSection::Containers, &ps.containers))
            .unwrap_or_default()
    }

    /// Returns false when the slot does not exist
    fn set_slot_image(&mut self, section: SlotSection, index: usize, image: &str) -> bool {
        let Some(pod_spec) = self.pod_spec_mut() else {
            return false;
        };
        let containers = match section {
            SlotSection::InitContainers => pod_spec.init_containers.as_mut(),
            SlotSection::Containers => Some(&mut pod_spec.containers),
        };
        match containers.and_then(|c| c.get_mut(index)) {
            Some(container) => {
                container.image = Some(image.to_string());
                true
            }
            None => false,
        }
    }
}

fn slots(section: SlotSection, containers: &[Container]) -> Vec<ContainerSlot> {
    containers
        .iter()
        .enumerate()
        .map(|(index, container)| ContainerSlot {
            section,
            index,
            name: container.name.clone(),
            image: container.image.clone().unwrap_or_default(),
        })
        .collect()
}

impl Workload for Deployment {
    fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::Deployment
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/deployment-v1/#DeploymentStatus
    fn readiness(&self) -> ReadinessSignal {
        let status = self.status.as_ref();
        ReadinessSignal {
            desired: status.and_then(|s| s.replicas).unwrap_or(0),
            ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        }
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Workload for DaemonSet {
    fn workload_kind(&self) -> WorkloadKind {
        WorkloadKind::DaemonSet
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/daemon-set-v1/#DaemonSetStatus
    fn readiness(&self) -> ReadinessSignal {
        let status = self.status.as_ref();
        ReadinessSignal {
            desired: status.map(|s| s.desired_number_scheduled).unwrap_or(0),
            ready: status.map(|s| s.number_ready).unwrap_or(0),
        }
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// A workload fetched from the cluster, with its kind resolved
#[derive(Debug, Clone)]
pub enum FetchedWorkload {
    Deployment(Deployment),
    DaemonSet(DaemonSet),
}

impl FetchedWorkload {
    pub fn as_workload(&self) -> &dyn Workload {
        match self {
            FetchedWorkload::Deployment(d) => d,
            FetchedWorkload::DaemonSet(ds) => ds,
        }
    }

    pub fn as_workload_mut(&mut self) -> &mut dyn Workload {
        match self {
            FetchedWorkload::Deployment(d) => d,
            FetchedWorkload::DaemonSet(ds) => ds,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetSpec, DaemonSetStatus, DeploymentSpec, DeploymentStatus,
    };
    use k8s_openapi::api::core::v1::{LocalObjectReference, PodTemplateSpec};

    pub(crate) fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn pod_spec(init: &[&str], regular: &[&str]) -> PodSpec {
        PodSpec {
            init_containers: (!init.is_empty()).then(|| {
                init.iter()
                    .enumerate()
                    .map(|(i, image)| container(&format!("init-{}", i), image))
                    .collect()
            }),
            containers: regular
                .iter()
                .enumerate()
                .map(|(i, image)| container(&format!("app-{}", i), image))
                .collect(),
            ..Default::default()
        }
    }

    pub(crate) fn deployment(
        name: &str,
        init: &[&str],
        regular: &[&str],
        replicas: i32,
        ready: i32,
    ) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    spec: Some(pod_spec(init, regular)),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                ..Default::default()
            }),
        }
    }

    pub(crate) fn daemon_set(
        name: &str,
        init: &[&str],
        regular: &[&str],
        desired: i32,
        ready: i32,
    ) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec {
                    spec: Some(pod_spec(init, regular)),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(DaemonSetStatus {
                desired_number_scheduled: desired,
                number_ready: ready,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn with_pull_secret<W: Workload>(mut workload: W) -> W {
        if let Some(spec) = workload.pod_spec_mut() {
            spec.image_pull_secrets = Some(vec![LocalObjectReference {
                name: "regcred".to_string(),
            }]);
        }
        workload
    }

    #[test]
    fn test_readiness_gate() {
        assert!(!ReadinessSignal { desired: 0, ready: 0 }.is_ready());
        assert!(ReadinessSignal { desired: 3, ready: 3 }.is_ready());
        assert!(!ReadinessSignal { desired: 3, ready: 2 }.is_ready());
    }

    #[test]
    fn test_deployment_readiness_uses_status_replicas() {
        assert!(deployment("web", &[], &["nginx"], 2, 2).is_ready());
        assert!(!deployment("web", &[], &["nginx"], 2, 1).is_ready());

        let mut without_status = deployment("web", &[], &["nginx"], 2, 2);
        without_status.status = None;
        assert!(!without_status.is_ready());
    }

    #[test]
    fn test_daemon_set_readiness_uses_scheduled_counts() {
        assert!(daemon_set("exporter", &[], &["prom/node-exporter"], 4, 4).is_ready());
        assert!(!daemon_set("exporter", &[], &["prom/node-exporter"], 0, 0).is_ready());
    }

    #[test]
    fn test_slots_are_positional() {
        let workload = deployment("web", &["busybox:1.33.0"], &["nginx:1.14.2", "redis"], 1, 1);

        let init = workload.init_container_slots();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].section, SlotSection::InitContainers);
        assert_eq!(init[0].image, "busybox:1.33.0");

        let regular = workload.container_slots();
        assert_eq!(regular.len(), 2);
        assert_eq!(regular[1].index, 1);
        assert_eq!(regular[1].name, "app-1");
        assert_eq!(regular[1].image, "redis");
    }

    #[test]
    fn test_set_slot_image() {
        let mut fetched =
            FetchedWorkload::DaemonSet(daemon_set("exporter", &["busybox"], &["nginx"], 1, 1));
        let workload = fetched.as_workload_mut();

        assert!(workload.set_slot_image(SlotSection::InitContainers, 0, "foo/busybox"));
        assert!(workload.set_slot_image(SlotSection::Containers, 0, "foo/nginx"));
        assert!(!workload.set_slot_image(SlotSection::Containers, 5, "foo/nope"));

        assert_eq!(workload.init_container_slots()[0].image, "foo/busybox");
        assert_eq!(workload.container_slots()[0].image, "foo/nginx");
    }

    #[test]
    fn test_image_pull_secret_count() {
        let workload = deployment("web", &[], &["nginx"], 1, 1);
        assert_eq!(workload.image_pull_secret_count(), 0);
        assert_eq!(with_pull_secret(workload).image_pull_secret_count(), 1);
    }
}
