//! Route store
//!
//! Reads Routes and writes back finalizers and status with optimistic
//! concurrency. Every write carries the `resourceVersion` the caller read, so
//! a concurrent edit surfaces as [`StoreError::Conflict`] instead of being
//! overwritten.

use crate::apis::gateway::route::Route;
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use thiserror::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "routesync-controller";

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Write conflict on Route {namespace}/{name}: {message}")]
    Conflict {
        namespace: String,
        name: String,
        message: String,
    },

    #[error("Route {0} has no namespace")]
    MissingNamespace(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    fn from_kube(err: kube::Error, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: ae.message,
            },
            other => StoreError::Kube(other),
        }
    }
}

/// Kubernetes event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEventKind {
    Normal,
    Warning,
}

/// Event attached to a Route for users to see with `kubectl describe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEvent {
    pub kind: RouteEventKind,
    pub reason: String,
    pub action: String,
    pub note: String,
}

impl RouteEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: RouteEventKind::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: RouteEventKind::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }
}

/// Desired-state storage for Routes
#[async_trait]
pub trait RouteStore: Send + Sync + 'static {
    /// Current Route, or None once it has been removed
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Route>, StoreError>;

    /// Persist `route`'s finalizers
    async fn update_metadata(&self, route: &Route) -> Result<Route, StoreError>;

    /// Persist `route`'s status
    async fn update_status(&self, route: &Route) -> Result<Route, StoreError>;

    /// Attach an event to `route`
    async fn publish_event(&self, route: &Route, event: RouteEvent) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: RouteStore + ?Sized> RouteStore for std::sync::Arc<T> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Route>, StoreError> {
        (**self).get(namespace, name).await
    }

    async fn update_metadata(&self, route: &Route) -> Result<Route, StoreError> {
        (**self).update_metadata(route).await
    }

    async fn update_status(&self, route: &Route) -> Result<Route, StoreError> {
        (**self).update_status(route).await
    }

    async fn publish_event(&self, route: &Route, event: RouteEvent) -> Result<(), StoreError> {
        (**self).publish_event(route, event).await
    }
}

/// [`RouteStore`] backed by the Kubernetes API server
pub struct KubeRouteStore {
    client: Client,
    recorder: Recorder,
}

impl KubeRouteStore {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    fn api_for(&self, route: &Route) -> Result<Api<Route>, StoreError> {
        let namespace = route
            .namespace()
            .ok_or_else(|| StoreError::MissingNamespace(route.name_any()))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait]
impl RouteStore for KubeRouteStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Route>, StoreError> {
        let api: Api<Route> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, namespace, name))
    }

    async fn update_metadata(&self, route: &Route) -> Result<Route, StoreError> {
        let api = self.api_for(route)?;
        let name = route.name_any();

        // Merge patches replace lists wholesale, so this sets the exact list
        let patch = json!({
            "metadata": {
                "resourceVersion": route.resource_version(),
                "finalizers": route.finalizers(),
            }
        });

        api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &route.namespace().unwrap_or_default(), &name))
    }

    async fn update_status(&self, route: &Route) -> Result<Route, StoreError> {
        let api = self.api_for(route)?;
        let name = route.name_any();

        let patch = json!({
            "metadata": {
                "resourceVersion": route.resource_version(),
            },
            "status": route.status,
        });

        api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &route.namespace().unwrap_or_default(), &name))
    }

    async fn publish_event(&self, route: &Route, event: RouteEvent) -> Result<(), StoreError> {
        let event = Event {
            type_: match event.kind {
                RouteEventKind::Normal => EventType::Normal,
                RouteEventKind::Warning => EventType::Warning,
            },
            reason: event.reason,
            note: Some(event.note),
            action: event.action,
            secondary: None,
        };

        self.recorder
            .publish(&event, &route.object_ref(&()))
            .await
            .map_err(StoreError::Kube)
    }
}
