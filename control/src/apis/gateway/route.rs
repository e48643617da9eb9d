//! Route custom resource
//!
//! `gateway.routesync.io/v1` Route: one host on the gateway, proxied to a
//! single upstream domain.

use common::GatewayRoute;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer that keeps a Route in the store until its gateway route is gone
pub const ROUTE_FINALIZER: &str = "route.gateway.routesync.io";

/// Desired gateway routing for one domain
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.routesync.io",
    version = "v1",
    kind = "Route",
    namespaced,
    status = "RouteStatus",
    shortname = "rt",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.domain"}"#,
    printcolumn = r#"{"name":"Applied","type":"string","jsonPath":".status.domain"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Host to match, also used as the only upstream node
    pub domain: String,

    #[serde(default)]
    pub enable_web_socket: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite: Option<PathRewrite>,

    /// Host header sent upstream instead of the client's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_host: Option<String>,
}

/// Regex path rewrite applied before proxying
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PathRewrite {
    pub regex: String,
    pub replacement: String,
}

/// Observed state, written only by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    /// Domain last pushed to the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// `metadata.generation` of the spec last pushed to the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Route {
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == ROUTE_FINALIZER)
    }

    /// Add the route finalizer. Returns false if it was already present.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.finalizers_mut().push(ROUTE_FINALIZER.to_string());
        true
    }

    /// Remove the route finalizer. Returns false if it was absent.
    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.finalizers().len();
        self.finalizers_mut().retain(|f| f != ROUTE_FINALIZER);
        before != self.finalizers().len()
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Domain recorded by the last successful apply
    pub fn applied_domain(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.domain.as_deref())
    }

    /// True when the spec changed since the last successful apply
    pub fn needs_applied_event(&self) -> bool {
        let status = self.status.as_ref();
        status.and_then(|s| s.domain.as_deref()) != Some(self.spec.domain.as_str())
            || status.and_then(|s| s.observed_generation) != self.metadata.generation
    }

    /// Build the gateway document for the current spec
    pub fn gateway_document(&self) -> GatewayRoute {
        let mut builder =
            GatewayRoute::builder(self.spec.domain.as_str()).websocket(self.spec.enable_web_socket);

        if let Some(rewrite) = &self.spec.path_rewrite {
            builder = builder.path_rewrite(rewrite.regex.as_str(), rewrite.replacement.as_str());
        }
        if let Some(host) = &self.spec.pass_host {
            builder = builder.pass_host(host.as_str());
        }

        builder.build()
    }
}

/// Lifecycle of a Route as seen by one reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum RouteLifecycle {
    /// Exists and is wanted on the gateway
    Active(Route),
    /// Deletion requested, gateway route must go before the object can
    Terminating(Route),
    /// Removed from the store
    Gone,
}

impl RouteLifecycle {
    /// Classify a freshly read Route. Deletion intent always wins over apply.
    pub fn observe(route: Option<Route>) -> Self {
        match route {
            None => RouteLifecycle::Gone,
            Some(route) if route.is_terminating() => RouteLifecycle::Terminating(route),
            Some(route) => RouteLifecycle::Active(route),
        }
    }
}
