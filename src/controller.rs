use crate::backup::ImageBackup;
use crate::error::{Error, Result};
use crate::relocation::Resolver;
use crate::state::{ControllerContext, HealthState};
use crate::workload::{ContainerSlot, FetchedWorkload, Workload, WorkloadKind, WorkloadRef};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::api::{ListParams, PostParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

static BACKED_UP_AT_ANNOTATION: &str = "image-backup.io/backed-up-at";
static FIELD_MANAGER: &str = "kube-image-backup";
const WATCH_CHECK_RETRY: Duration = Duration::from_secs(5);

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Cluster access needed by the reconciler: typed fetches and a full-object update
pub trait WorkloadStore: Send + Sync {
    fn fetch_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Deployment>>> + Send;

    fn fetch_daemon_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<DaemonSet>>> + Send;

    /// Replaces the object. Fails with [`Error::UpdateConflict`] if it changed since it was fetched.
    fn update(&self, workload: &FetchedWorkload) -> impl Future<Output = Result<()>> + Send;
}

pub struct KubeWorkloadStore {
    client: Client,
}

impl KubeWorkloadStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl WorkloadStore for KubeWorkloadStore {
    async fn fetch_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn fetch_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update(&self, workload: &FetchedWorkload) -> Result<()> {
        match workload {
            FetchedWorkload::Deployment(deployment) => {
                replace(&self.client, WorkloadKind::Deployment, deployment).await
            }
            FetchedWorkload::DaemonSet(daemon_set) => {
                replace(&self.client, WorkloadKind::DaemonSet, daemon_set).await
            }
        }
    }
}

async fn replace<K>(client: &Client, kind: WorkloadKind, object: &K) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let namespace = object.namespace().unwrap_or_default();
    let name = object.name_any();
    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    let params = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };

    match api.replace(&name, &params, object).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 409 => Err(Error::UpdateConflict {
            kind: kind.as_str(),
            namespace,
            name,
        }),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Neither a Deployment nor a DaemonSet exists under the name
    NotFound,
    /// The pod template carries image pull secrets
    OptedOut,
    NotReady,
    UpToDate,
    Updated { rewritten: usize },
}

/// Decides, per workload, which images have to be backed up and rewrites them in a single update
pub struct WorkloadReconciler<S, B> {
    store: S,
    resolver: Resolver,
    backup: B,
}

impl<S: WorkloadStore, B: ImageBackup> WorkloadReconciler<S, B> {
    pub fn new(store: S, resolver: Resolver, backup: B) -> Self {
        Self {
            store,
            resolver,
            backup,
        }
    }

    pub async fn reconcile(&self, workload_ref: &WorkloadRef) -> Result<ReconcileOutcome> {
        let Some(mut fetched) = self.fetch(workload_ref).await? else {
            debug!("{} no longer exists, nothing to do", workload_ref);
            return Ok(ReconcileOutcome::NotFound);
        };
        let workload = fetched.as_workload();
        let kind = workload.workload_kind();

        let pull_secrets = workload.image_pull_secret_count();
        if pull_secrets > 0 {
            info!(
                "Skipping {} {}/{} as it has {} image pull secrets configured",
                kind, workload_ref.namespace, workload_ref.name, pull_secrets
            );
            return Ok(ReconcileOutcome::OptedOut);
        }

        let readiness = workload.readiness();
        if !readiness.is_ready() {
            info!(
                "Skipping {} {}/{} as desired count is {} and ready count is {}",
                kind, workload_ref.namespace, workload_ref.name, readiness.desired, readiness.ready
            );
            return Ok(ReconcileOutcome::NotReady);
        }

        let rewrites = self.plan_rewrites(workload).await?;
        if rewrites.is_empty() {
            debug!(
                "All images of {} {}/{} already point at the backup registry",
                kind, workload_ref.namespace, workload_ref.name
            );
            return Ok(ReconcileOutcome::UpToDate);
        }

        let workload = fetched.as_workload_mut();
        for (slot, destination) in &rewrites {
            workload.set_slot_image(slot.section, slot.index, destination);
        }
        workload
            .meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(BACKED_UP_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());

        self.store.update(&fetched).await?;
        info!(
            "Updated {} {}/{} with {} backed up images",
            kind,
            workload_ref.namespace,
            workload_ref.name,
            rewrites.len()
        );
        Ok(ReconcileOutcome::Updated {
            rewritten: rewrites.len(),
        })
    }

    /// Looks the object up under the watched kind first, then under the other kind
    async fn fetch(&self, workload_ref: &WorkloadRef) -> Result<Option<FetchedWorkload>> {
        let WorkloadRef {
            namespace, name, ..
        } = workload_ref;
        let order = match workload_ref.kind {
            WorkloadKind::Deployment => [WorkloadKind::Deployment, WorkloadKind::DaemonSet],
            WorkloadKind::DaemonSet => [WorkloadKind::DaemonSet, WorkloadKind::Deployment],
        };

        for kind in order {
            let fetched = match kind {
                WorkloadKind::Deployment => self
                    .store
                    .fetch_deployment(namespace, name)
                    .await?
                    .map(FetchedWorkload::Deployment),
                WorkloadKind::DaemonSet => self
                    .store
                    .fetch_daemon_set(namespace, name)
                    .await?
                    .map(FetchedWorkload::DaemonSet),
            };
            if fetched.is_some() {
                return Ok(fetched);
            }
            debug!("{}/{} is not a {}", namespace, name, kind);
        }
        Ok(None)
    }

    /// Backs up every non-conformant image, init containers first, and returns the new
    /// image per slot. Any failure aborts before the workload is touched.
    async fn plan_rewrites(&self, workload: &dyn Workload) -> Result<Vec<(ContainerSlot, String)>> {
        let slots = workload
            .init_container_slots()
            .into_iter()
            .chain(workload.container_slots());
        let mut rewrites = Vec::new();

        for slot in slots {
            if slot.image.is_empty() {
                continue;
            }
            let destination =
                self.resolver
                    .resolve(&slot.image)
                    .map_err(|source| Error::ResolutionFailed {
                        image: slot.image.clone(),
                        source: Box::new(source),
                    })?;
            if destination.is_empty() {
                warn!(
                    "Skipping image {} of container {} as it names no repository",
                    slot.image, slot.name
                );
                continue;
            }
            if destination == slot.image {
                continue;
            }

            info!(
                "Backing up image {} of container {} to {}",
                slot.image, slot.name, destination
            );
            self.backup.ensure_copied(&slot.image, &destination).await?;
            rewrites.push((slot, destination));
        }

        Ok(rewrites)
    }
}

/// Bounds required to watch a workload kind with a kube-runtime controller
pub trait WatchedWorkload:
    Workload
    + Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + 'static
{
}

impl<T> WatchedWorkload for T where
    T: Workload
        + Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + 'static
{
}

async fn reconcile<K: WatchedWorkload>(object: Arc<K>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let workload_ref = WorkloadRef {
        namespace: object.namespace().unwrap_or_default(),
        name: object.name_any(),
        kind: object.workload_kind(),
    };

    if ctx.namespace_filter.is_ignored(&workload_ref.namespace) {
        debug!("Ignoring {} in ignored namespace", workload_ref);
        return Ok(Action::await_change());
    }

    let outcome = ctx.reconciler.reconcile(&workload_ref).await?;
    debug!("Reconciled {} with outcome {:?}", workload_ref, outcome);
    Ok(Action::await_change())
}

fn error_policy<K: WatchedWorkload>(
    object: Arc<K>,
    error: &Error,
    ctx: Arc<ControllerContext>,
) -> Action {
    let requeue_after = error.requeue_after(&ctx.config.requeue);
    if error.is_retriable() {
        warn!(
            "Reconciling {} {}/{} failed, retrying in {:?}: {}",
            object.workload_kind(),
            object.namespace().unwrap_or_default(),
            object.name_any(),
            requeue_after,
            error
        );
    } else {
        error!(
            "Reconciling {} {}/{} failed and needs operator attention, retrying in {:?}: {}",
            object.workload_kind(),
            object.namespace().unwrap_or_default(),
            object.name_any(),
            requeue_after,
            error
        );
    }
    Action::requeue(requeue_after)
}

fn watcher_config(ctx: &ControllerContext) -> watcher::Config {
    match ctx.namespace_filter.field_selector() {
        Some(selector) => {
            info!("Watching workloads with field selector {}", selector);
            watcher::Config::default().fields(&selector)
        }
        None => watcher::Config::default(),
    }
}

async fn run_for<K: WatchedWorkload>(ctx: Arc<ControllerContext>) {
    let api: Api<K> = Api::all(ctx.kube_client.clone());
    let kind = <K as Resource>::kind(&());
    let concurrency = ctx.config.reconcile_concurrency();
    info!("Running {} controller with {} concurrent reconciles", kind, concurrency);

    Controller::new(api, watcher_config(&ctx))
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object),
                Err(e) => debug!("Reconcile loop error: {}", e),
            }
        })
        .await;

    info!("{} controller stopped", kind);
}

/// Lists one object of the kind with the watch's field selector, which fails the
/// same way the watch would on missing RBAC or an unreachable API server
async fn check_watch_access<K: WatchedWorkload>(ctx: &ControllerContext) -> Result<()> {
    let api: Api<K> = Api::all(ctx.kube_client.clone());
    let mut params = ListParams::default().limit(1);
    if let Some(selector) = ctx.namespace_filter.field_selector() {
        params = params.fields(&selector);
    }
    api.list_metadata(&params).await?;
    Ok(())
}

async fn mark_ready_when<F, Fut>(health: &HealthState, retry: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        match check().await {
            Ok(()) => {
                health.mark_ready();
                return;
            }
            Err(e) => {
                warn!(
                    "Workload watches are not available yet, retrying in {:?}: {}",
                    retry, e
                );
                tokio::time::sleep(retry).await;
            }
        }
    }
}

/// Runs the Deployment and DaemonSet controllers until a shutdown signal arrives.
/// Readiness is reported once both kinds can be listed.
pub async fn run(ctx: Arc<ControllerContext>) {
    info!("Starting Deployment and DaemonSet controllers");

    let readiness_ctx = ctx.clone();
    tokio::spawn(async move {
        let health = readiness_ctx.health.clone();
        mark_ready_when(&health, WATCH_CHECK_RETRY, move || {
            let ctx = readiness_ctx.clone();
            async move {
                check_watch_access::<Deployment>(&ctx).await?;
                check_watch_access::<DaemonSet>(&ctx).await
            }
        })
        .await;
        info!("Deployment and DaemonSet watches are available, reporting ready");
    });

    futures::join!(
        run_for::<Deployment>(ctx.clone()),
        run_for::<DaemonSet>(ctx.clone())
    );
}
