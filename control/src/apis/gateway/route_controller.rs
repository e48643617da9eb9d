//! Route controller
//!
//! Drives the gateway admin API to match Route resources.
//!
//! Every reconciliation re-reads the Route and classifies it:
//! - Gone: nothing left to do
//! - Active: ensure the finalizer, PUT the full document, record the applied domain
//! - Terminating: DELETE the document, then release the finalizer
//!
//! The finalizer is persisted before the first PUT and only removed after a
//! successful DELETE, so a gateway route never outlives its Route.

use crate::admin::{AdminError, GatewayAdmin, GatewayConnector};
use crate::apis::gateway::route::{Route, RouteLifecycle, RouteStatus};
use crate::apis::metrics::record_route_reconciliation;
use crate::config::RetryConfig;
use crate::store::{RouteEvent, RouteStore, StoreError};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::ResourceExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Reconciliation errors. All of them are transient.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Route is missing metadata.{0}")]
    MissingField(&'static str),

    #[error("Failed to apply gateway route {route_id}: {source}")]
    GatewayApply {
        route_id: String,
        #[source]
        source: AdminError,
        retry_after: Duration,
    },

    #[error("Failed to delete gateway route {route_id}: {source}")]
    GatewayDelete {
        route_id: String,
        #[source]
        source: AdminError,
        retry_after: Duration,
    },

    #[error("{0}")]
    Conflict(#[source] StoreError),

    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    #[error("Reconciliation cancelled by shutdown")]
    Cancelled,
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            ReconcileError::Conflict(err)
        } else {
            ReconcileError::Store(err)
        }
    }
}

impl ReconcileError {
    /// Explicit retry directive, if this failure carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::GatewayApply { retry_after, .. }
            | ReconcileError::GatewayDelete { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            ReconcileError::MissingField(_) => "invalid",
            ReconcileError::GatewayApply { .. } => "apply_failed",
            ReconcileError::GatewayDelete { .. } => "delete_failed",
            ReconcileError::Conflict(_) => "conflict",
            ReconcileError::Store(_) => "store_error",
            ReconcileError::Cancelled => "cancelled",
        }
    }
}

/// Route reconciler
pub struct RouteReconciler<S, C> {
    store: S,
    connector: C,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S, C> RouteReconciler<S, C>
where
    S: RouteStore,
    C: GatewayConnector,
{
    pub fn new(
        store: S,
        connector: C,
        retry: RetryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            connector,
            retry,
            shutdown,
        }
    }

    /// Run `fut` unless shutdown is requested first
    async fn until_shutdown<F: Future>(&self, fut: F) -> Result<F::Output, ReconcileError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(ReconcileError::Cancelled);
        }

        tokio::select! {
            out = fut => Ok(out),
            _ = wait_for_shutdown(&mut shutdown) => Err(ReconcileError::Cancelled),
        }
    }

    /// Reconcile the Route identified by `namespace`/`name`
    #[instrument(skip(self))]
    pub async fn reconcile_route(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ReconcileError> {
        let current = self.until_shutdown(self.store.get(namespace, name)).await??;

        match RouteLifecycle::observe(current) {
            RouteLifecycle::Gone => {
                debug!("Route no longer exists, nothing to do");
                Ok(Action::await_change())
            }
            RouteLifecycle::Terminating(route) => self.delete_route(route).await,
            RouteLifecycle::Active(route) => self.apply_route(route).await,
        }
    }

    async fn apply_route(&self, mut route: Route) -> Result<Action, ReconcileError> {
        let namespace = route
            .namespace()
            .ok_or(ReconcileError::MissingField("namespace"))?;
        let name = route.name_any();

        // The finalizer must be stored before anything exists on the gateway
        if route.add_finalizer() {
            route = self
                .until_shutdown(self.store.update_metadata(&route))
                .await??;
            info!("Added finalizer to route {}/{}", namespace, name);
        }

        let route_id = common::route_id(&namespace, &name);
        let document = route.gateway_document();

        let put = match self.connector.connect() {
            Ok(admin) => self.until_shutdown(admin.put(&route_id, &document)).await?,
            Err(e) => Err(e),
        };
        if let Err(source) = put {
            warn!(route_id = %route_id, "Failed to apply route: {}", source);
            self.publish(
                &route,
                RouteEvent::warning("ApplyFailed", "Apply", format!("{}: {}", route_id, source)),
            )
            .await;
            return Err(ReconcileError::GatewayApply {
                route_id,
                source,
                retry_after: self.retry.apply_failure(),
            });
        }

        let spec_changed = route.needs_applied_event();
        route.status = Some(RouteStatus {
            domain: Some(route.spec.domain.clone()),
            observed_generation: route.metadata.generation,
        });
        let route = self.until_shutdown(self.store.update_status(&route)).await??;

        if spec_changed {
            self.publish(
                &route,
                RouteEvent::normal(
                    "Applied",
                    "Apply",
                    format!("Gateway route {} serves {}", route_id, route.spec.domain),
                ),
            )
            .await;
        }

        info!(route_id = %route_id, domain = %route.spec.domain, "Route applied");
        Ok(Action::await_change())
    }

    async fn delete_route(&self, mut route: Route) -> Result<Action, ReconcileError> {
        let namespace = route
            .namespace()
            .ok_or(ReconcileError::MissingField("namespace"))?;
        let name = route.name_any();
        let route_id = common::route_id(&namespace, &name);

        let delete = match self.connector.connect() {
            Ok(admin) => self.until_shutdown(admin.delete(&route_id)).await?,
            Err(e) => Err(e),
        };
        if let Err(source) = delete {
            // Finalizer stays, so the Route stays until the gateway route is gone
            warn!(route_id = %route_id, "Failed to delete route: {}", source);
            self.publish(
                &route,
                RouteEvent::warning("DeleteFailed", "Delete", format!("{}: {}", route_id, source)),
            )
            .await;
            return Err(ReconcileError::GatewayDelete {
                route_id,
                source,
                retry_after: self.retry.delete_failure(),
            });
        }

        self.publish(
            &route,
            RouteEvent::normal(
                "Deleted",
                "Delete",
                format!("Gateway route {} removed", route_id),
            ),
        )
        .await;

        if route.remove_finalizer() {
            self.until_shutdown(self.store.update_metadata(&route))
                .await??;
            info!("Removed finalizer from route {}/{}", namespace, name);
        }

        info!(route_id = %route_id, "Route deleted");
        Ok(Action::await_change())
    }

    /// Best-effort event; failures are logged and never fail the reconciliation
    async fn publish(&self, route: &Route, event: RouteEvent) {
        match self
            .until_shutdown(self.store.publish_event(route, event))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to publish route event: {}", e),
            Err(_) => debug!("Skipped route event, shutting down"),
        }
    }

    /// Reconcile a single Route
    async fn reconcile(route: Arc<Route>, ctx: Arc<Self>) -> Result<Action, ReconcileError> {
        let start = Instant::now();
        let namespace = route
            .namespace()
            .ok_or(ReconcileError::MissingField("namespace"))?;
        let name = route.name_any();

        let result = ctx.reconcile_route(&namespace, &name).await;

        let label = match &result {
            Ok(_) => "success",
            Err(e) => e.metric_label(),
        };
        record_route_reconciliation(&name, &namespace, start.elapsed().as_secs_f64(), label);

        result
    }

    /// Error handler for controller
    fn error_policy(route: Arc<Route>, error: &ReconcileError, ctx: Arc<Self>) -> Action {
        if let Some(delay) = error.retry_after() {
            warn!(
                "Route {}/{} reconciliation failed, retrying in {}s: {}",
                route.namespace().unwrap_or_default(),
                route.name_any(),
                delay.as_secs(),
                error
            );
            return Action::requeue(delay);
        }

        match error {
            ReconcileError::Conflict(_) => {
                debug!("Route {} changed concurrently, re-reading: {}", route.name_any(), error);
                Action::requeue(ctx.retry.conflict())
            }
            _ => {
                error!("Route reconciliation error: {}", error);
                Action::requeue(ctx.retry.error())
            }
        }
    }

    /// Start the Route controller
    pub async fn run(self, api: Api<Route>) {
        let ctx = Arc::new(self);

        info!("Starting Route controller");

        Controller::new(api, WatcherConfig::default())
            .shutdown_on_signal()
            .run(Self::reconcile, Self::error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled Route: {:?}", o),
                    Err(e) => debug!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        info!("Route controller stopped");
    }
}

/// Resolves once `shutdown` reads true; never if the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
