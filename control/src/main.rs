use anyhow::Result;
use control::admin::ApisixConnector;
use control::apis::gateway::route::Route;
use control::apis::gateway::route_controller::RouteReconciler;
use control::apis::metrics::serve_metrics;
use control::config::ControllerConfig;
use control::error::ControllerError;
use control::store::KubeRouteStore;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::events::Reporter;
use kube::CustomResourceExt;
use std::env;
use std::net::SocketAddr;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Event reporter name
const CONTROLLER_NAME: &str = "routesync";

/// routesync controller
///
/// Keeps APISIX gateway routes in step with Route resources.
/// `routesync crd` prints the Route CustomResourceDefinition and exits.
#[tokio::main]
async fn main() -> Result<()> {
    if env::args().nth(1).as_deref() == Some("crd") {
        println!("{}", serde_json::to_string_pretty(&Route::crd())?);
        return Ok(());
    }

    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting routesync controller");

    let mut config = ControllerConfig::from_env().map_err(ControllerError::from)?;
    let client = kube::Client::try_default()
        .await
        .map_err(ControllerError::from)?;

    load_global_config(&client, &mut config).await?;
    info!("   Admin API: {}", config.gateway.admin_url);

    let metrics_addr: SocketAddr = config.metrics_addr.parse().map_err(|e| {
        ControllerError::Metrics(format!("invalid address '{}': {}", config.metrics_addr, e))
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_shutdown = shutdown_rx.clone();
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = serve_metrics(metrics_addr, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    let reporter = Reporter {
        controller: CONTROLLER_NAME.to_string(),
        instance: env::var("POD_NAME").ok(),
    };
    let store = KubeRouteStore::new(client.clone(), reporter);
    let connector = ApisixConnector::new(config.gateway.clone());

    let api: Api<Route> = match &config.watch_namespace {
        Some(namespace) => {
            info!("   Watching namespace: {}", namespace);
            Api::namespaced(client.clone(), namespace)
        }
        None => Api::all(client.clone()),
    };

    let reconciler = RouteReconciler::new(store, connector, config.retry.clone(), shutdown_rx);
    let controller_handle = tokio::spawn(reconciler.run(api));

    info!("Press Ctrl-C to exit.");

    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    // In-flight gateway and store calls abort on this
    shutdown_tx.send(true).ok();

    if let Err(e) = controller_handle.await {
        error!("Route controller task failed: {}", e);
    }
    if let Err(e) = metrics_handle.await {
        error!("Metrics task failed: {}", e);
    }

    Ok(())
}

/// Apply the optional cluster-wide ConfigMap on top of the environment.
///
/// A missing ConfigMap leaves the configuration untouched.
async fn load_global_config(
    client: &kube::Client,
    config: &mut ControllerConfig,
) -> Result<(), ControllerError> {
    let Some(reference) = config.global_config.clone() else {
        return Ok(());
    };

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &reference.namespace);
    match api.get_opt(&reference.name).await? {
        Some(config_map) => {
            if config.apply_config_map(&config_map) {
                info!(
                    "Gateway settings overridden by ConfigMap {}/{}",
                    reference.namespace, reference.name
                );
            }
        }
        None => warn!(
            "Global ConfigMap {}/{} not found, using environment settings",
            reference.namespace, reference.name
        ),
    }

    Ok(())
}
