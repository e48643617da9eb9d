//! routesync Common Types
//!
//! The gateway route document pushed to the admin API, and the identifier
//! scheme that keys it. Everything here is pure: building a document has no
//! side effects and the same inputs always produce the same document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// URI matcher sent with every route (match all paths on the host)
pub const ROUTE_URI_WILDCARD: &str = "/*";

/// Weight given to the single upstream node
pub const UPSTREAM_NODE_WEIGHT: u32 = 1;

/// Separator between namespace and name in a route identifier
pub const ROUTE_ID_SEPARATOR: char = '-';

/// Build the external route identifier for a resource.
///
/// The identifier is `namespace-name` and never changes for the lifetime of
/// the resource. Because Kubernetes names may themselves contain `-`, two
/// distinct pairs can collide (`a-b`/`c` and `a`/`b-c` both map to `a-b-c`).
pub fn route_id(namespace: &str, name: &str) -> String {
    let mut id = String::with_capacity(namespace.len() + name.len() + 1);
    id.push_str(namespace);
    id.push(ROUTE_ID_SEPARATOR);
    id.push_str(name);
    id
}

/// Load balancing policy of an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamType {
    #[serde(rename = "roundrobin")]
    RoundRobin,
}

/// How the upstream Host header is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassHost {
    /// Send `upstream_host` instead of the client's Host header
    #[serde(rename = "rewrite")]
    Rewrite,
}

/// Upstream section of a gateway route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(rename = "type")]
    pub kind: UpstreamType,

    /// Node address -> weight
    pub nodes: BTreeMap<String, u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_host: Option<PassHost>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_host: Option<String>,
}

/// `proxy-rewrite` plugin configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRewrite {
    /// Ordered pair: pattern, replacement
    pub regex_uri: [String; 2],
}

/// Plugins attached to a gateway route
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugins {
    #[serde(
        rename = "proxy-rewrite",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub proxy_rewrite: Option<ProxyRewrite>,
}

/// Full route document stored by the gateway under a route identifier.
///
/// Each PUT replaces the stored document entirely, so the document is always
/// built from scratch and never merged with what the gateway holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRoute {
    pub uri: String,
    pub host: String,
    pub upstream: Upstream,

    /// Only ever `Some(true)`; absent when websockets are disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_websocket: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Plugins>,
}

impl GatewayRoute {
    /// Start building a route for `domain`
    pub fn builder(domain: impl Into<String>) -> GatewayRouteBuilder {
        GatewayRouteBuilder {
            domain: domain.into(),
            enable_websocket: false,
            path_rewrite: None,
            pass_host: None,
        }
    }
}

/// Builder for [`GatewayRoute`]
#[derive(Debug, Clone)]
pub struct GatewayRouteBuilder {
    domain: String,
    enable_websocket: bool,
    path_rewrite: Option<(String, String)>,
    pass_host: Option<String>,
}

impl GatewayRouteBuilder {
    pub fn websocket(mut self, enabled: bool) -> Self {
        self.enable_websocket = enabled;
        self
    }

    pub fn path_rewrite(mut self, regex: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.path_rewrite = Some((regex.into(), replacement.into()));
        self
    }

    /// Override the Host header sent upstream. Empty hosts are ignored.
    pub fn pass_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.pass_host = if host.is_empty() { None } else { Some(host) };
        self
    }

    pub fn build(self) -> GatewayRoute {
        let mut nodes = BTreeMap::new();
        nodes.insert(self.domain.clone(), UPSTREAM_NODE_WEIGHT);

        let (pass_host, upstream_host) = match self.pass_host {
            Some(host) => (Some(PassHost::Rewrite), Some(host)),
            None => (None, None),
        };

        let plugins = self.path_rewrite.map(|(regex, replacement)| Plugins {
            proxy_rewrite: Some(ProxyRewrite {
                regex_uri: [regex, replacement],
            }),
        });

        GatewayRoute {
            uri: ROUTE_URI_WILDCARD.to_string(),
            host: self.domain,
            upstream: Upstream {
                kind: UpstreamType::RoundRobin,
                nodes,
                pass_host,
                upstream_host,
            },
            enable_websocket: self.enable_websocket.then_some(true),
            plugins,
        }
    }
}
