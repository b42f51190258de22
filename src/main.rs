use crate::backup::BackupEngine;
use crate::config::{CONTROLLER_NAMESPACE_ENV, NamespaceFilter};
use crate::controller::{KubeWorkloadStore, WorkloadReconciler};
use crate::credentials::{CredentialsProvider, EnvCredentials};
use crate::oci_registry::RegistryClient;
use crate::relocation::Resolver;
use crate::state::{ControllerContext, HealthState};
use std::env;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod backup;
mod config;
mod controller;
mod credentials;
mod error;
mod image_reference;
mod oci_registry;
mod relocation;
mod secret_string;
mod state;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-image-backup {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    let controller_namespace = env::var(CONTROLLER_NAMESPACE_ENV).ok();
    let ignored_namespaces =
        config::parse_ignore_namespaces(&config.ignore_namespaces, controller_namespace.as_deref());
    info!("Ignoring namespaces {:?}", ignored_namespaces);
    let namespace_filter = NamespaceFilter::new(&ignored_namespaces)?;

    // Credentials are read again on every reconcile, this only surfaces misconfiguration early
    if let Err(e) = EnvCredentials.load() {
        warn!("Registry credentials are not usable yet: {}", e);
    }

    let kube_client = controller::create_client().await?;
    let http_client = oci_registry::create_client(&config.registry)?;
    let registry = RegistryClient::new(http_client, config.registry.insecure_registries.clone());

    let cancel = CancellationToken::new();
    let credentials: Arc<dyn CredentialsProvider> = Arc::new(EnvCredentials);
    let reconciler = WorkloadReconciler::new(
        KubeWorkloadStore::new(kube_client.clone()),
        Resolver::new(credentials.clone()),
        BackupEngine::new(registry, credentials, cancel.clone()),
    );

    let health = HealthState::default();
    let port = config.webserver.port;
    let ctx = Arc::new(ControllerContext {
        kube_client,
        config,
        namespace_filter,
        reconciler,
        health: health.clone(),
    });

    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    let app = webserver::create_app(health);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = cancel.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });

    let (server_result, ()) = tokio::join!(server.into_future(), controller::run(ctx));
    server_result?;

    info!("kube-image-backup stopped");
    Ok(())
}

/// Cancels in-flight registry operations on SIGINT or SIGTERM
async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal, cancelling in-flight backups");
    cancel.cancel();
}
