//! Route controller against a live admin API endpoint
//!
//! Runs the reconciler with the real admin client over HTTP. The admin API is
//! a small in-process hyper server that keeps route documents in memory.
//!
//! Run with: cargo test --test gateway_sync_test

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use control::admin::ApisixConnector;
use control::apis::gateway::route::{PathRewrite, Route, RouteSpec, ROUTE_FINALIZER};
use control::apis::gateway::route_controller::{ReconcileError, RouteReconciler};
use control::config::{GatewayConfig, RetryConfig};
use control::store::{RouteEvent, RouteStore, StoreError};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

const ADMIN_KEY: &str = "edd1c9f034335f136f87ad84b625c8f1";

/// Admin API state: route id -> stored document
#[derive(Default)]
struct AdminState {
    routes: BTreeMap<String, Value>,
    unauthorized: usize,
    unavailable: bool,
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<Mutex<AdminState>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let key_ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        == Some(ADMIN_KEY);
    let method = req.method().clone();
    let id = req
        .uri()
        .path()
        .strip_prefix("/apisix/admin/routes/")
        .map(str::to_string);
    let body = req.into_body().collect().await?.to_bytes();

    let (status, text) = {
        let mut state = state.lock().unwrap();
        if !key_ok {
            state.unauthorized += 1;
            (StatusCode::UNAUTHORIZED, "{\"error_msg\":\"failed to check token\"}")
        } else if state.unavailable {
            (StatusCode::SERVICE_UNAVAILABLE, "{\"error_msg\":\"etcd unavailable\"}")
        } else {
            match (method, id) {
                (Method::PUT, Some(id)) => {
                    let doc: Value = serde_json::from_slice(&body).unwrap();
                    let created = state.routes.insert(id, doc).is_none();
                    if created {
                        (StatusCode::CREATED, "{}")
                    } else {
                        (StatusCode::OK, "{}")
                    }
                }
                (Method::DELETE, Some(id)) => match state.routes.remove(&id) {
                    Some(_) => (StatusCode::OK, "{\"deleted\":\"1\"}"),
                    None => (StatusCode::NOT_FOUND, "{\"message\":\"Key not found\"}"),
                },
                _ => (StatusCode::BAD_REQUEST, "{}"),
            }
        }
    };

    let mut resp = Response::new(Full::new(Bytes::from(text)));
    *resp.status_mut() = status;
    Ok(resp)
}

async fn start_admin_api() -> (SocketAddr, Arc<Mutex<AdminState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(Mutex::new(AdminState::default()));

    let server_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = server_state.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, state.clone()));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, state)
}

/// Minimal Route store: finalizers gate removal, no version checks
#[derive(Default)]
struct ClusterStore {
    routes: Mutex<BTreeMap<String, Route>>,
    events: Mutex<Vec<RouteEvent>>,
}

impl ClusterStore {
    fn apply(&self, route: Route) {
        self.routes
            .lock()
            .unwrap()
            .insert(route.name_any(), route);
    }

    fn get_route(&self, name: &str) -> Option<Route> {
        self.routes.lock().unwrap().get(name).cloned()
    }

    fn delete(&self, name: &str) {
        let mut routes = self.routes.lock().unwrap();
        let Some(route) = routes.get_mut(name) else {
            return;
        };
        if route.finalizers().is_empty() {
            routes.remove(name);
            return;
        }
        let ts: Time = serde_json::from_value(json!("2026-10-16T12:00:00Z")).unwrap();
        route.metadata.deletion_timestamp = Some(ts);
    }

    fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.reason.ends_with("Failed"))
            .map(|e| e.reason.clone())
            .collect()
    }
}

#[async_trait]
impl RouteStore for ClusterStore {
    async fn get(&self, _namespace: &str, name: &str) -> Result<Option<Route>, StoreError> {
        Ok(self.get_route(name))
    }

    async fn update_metadata(&self, route: &Route) -> Result<Route, StoreError> {
        let mut routes = self.routes.lock().unwrap();
        let name = route.name_any();
        let mut stored = routes.get(&name).cloned().expect("route should exist");
        stored.metadata.finalizers = Some(route.finalizers().to_vec());
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            routes.remove(&name);
        } else {
            routes.insert(name, stored.clone());
        }
        Ok(stored)
    }

    async fn update_status(&self, route: &Route) -> Result<Route, StoreError> {
        let mut routes = self.routes.lock().unwrap();
        let name = route.name_any();
        let mut stored = routes.get(&name).cloned().expect("route should exist");
        stored.status = route.status.clone();
        routes.insert(name, stored.clone());
        Ok(stored)
    }

    async fn publish_event(&self, _route: &Route, event: RouteEvent) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

struct Cluster {
    store: Arc<ClusterStore>,
    admin: Arc<Mutex<AdminState>>,
    reconciler: RouteReconciler<Arc<ClusterStore>, ApisixConnector>,
    _shutdown: watch::Sender<bool>,
}

impl Cluster {
    async fn start(admin_key: &str) -> Self {
        let (addr, admin) = start_admin_api().await;
        let gateway = GatewayConfig {
            admin_url: format!("http://{}/apisix/admin/", addr),
            admin_key: admin_key.to_string(),
            request_timeout_secs: 5,
        };
        let store = Arc::new(ClusterStore::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = RouteReconciler::new(
            store.clone(),
            ApisixConnector::new(gateway),
            RetryConfig::default(),
            shutdown_rx,
        );

        Self {
            store,
            admin,
            reconciler,
            _shutdown: shutdown_tx,
        }
    }

    async fn reconcile(&self, name: &str) -> Result<Action, ReconcileError> {
        self.reconciler.reconcile_route("demo", name).await
    }

    fn document(&self, route_id: &str) -> Option<Value> {
        self.admin.lock().unwrap().routes.get(route_id).cloned()
    }
}

fn route(name: &str, spec: RouteSpec) -> Route {
    let mut route = Route::new(name, spec);
    route.metadata.namespace = Some("demo".to_string());
    route
}

#[tokio::test]
async fn test_route_lifecycle_over_http() {
    let cluster = Cluster::start(ADMIN_KEY).await;
    cluster.store.apply(route(
        "shop",
        RouteSpec {
            domain: "shop.example.com".to_string(),
            ..Default::default()
        },
    ));

    // Create
    let action = cluster.reconcile("shop").await.expect("apply should succeed");
    assert_eq!(action, Action::await_change());
    assert_eq!(
        cluster.document("demo-shop"),
        Some(json!({
            "uri": "/*",
            "host": "shop.example.com",
            "upstream": {
                "type": "roundrobin",
                "nodes": { "shop.example.com": 1 }
            }
        }))
    );
    let stored = cluster.store.get_route("shop").unwrap();
    assert_eq!(stored.finalizers(), &[ROUTE_FINALIZER.to_string()]);
    assert_eq!(stored.applied_domain(), Some("shop.example.com"));

    // Update to websocket + rewrite
    let mut updated = stored.clone();
    updated.spec.enable_web_socket = true;
    updated.spec.path_rewrite = Some(PathRewrite {
        regex: "^/shop/(.*)".to_string(),
        replacement: "/$1".to_string(),
    });
    cluster.store.apply(updated);
    cluster.reconcile("shop").await.unwrap();

    let doc = cluster.document("demo-shop").unwrap();
    assert_eq!(doc["enable_websocket"], json!(true));
    assert_eq!(
        doc["plugins"]["proxy-rewrite"]["regex_uri"],
        json!(["^/shop/(.*)", "/$1"])
    );

    // Delete
    cluster.store.delete("shop");
    cluster.reconcile("shop").await.unwrap();
    assert!(cluster.document("demo-shop").is_none());
    assert!(cluster.store.get_route("shop").is_none());
    assert!(cluster.store.warnings().is_empty());
}

#[tokio::test]
async fn test_delete_of_route_missing_on_gateway_succeeds() {
    let cluster = Cluster::start(ADMIN_KEY).await;
    let mut r = route(
        "stale",
        RouteSpec {
            domain: "stale.example.com".to_string(),
            ..Default::default()
        },
    );
    r.metadata.finalizers = Some(vec![ROUTE_FINALIZER.to_string()]);
    cluster.store.apply(r);
    cluster.store.delete("stale");

    // Gateway never had the route; 404 counts as deleted
    cluster.reconcile("stale").await.expect("delete should succeed");
    assert!(cluster.store.get_route("stale").is_none());
}

#[tokio::test]
async fn test_rejected_admin_key_is_apply_failure() {
    let cluster = Cluster::start("wrong-key").await;
    cluster.store.apply(route(
        "shop",
        RouteSpec {
            domain: "shop.example.com".to_string(),
            ..Default::default()
        },
    ));

    let err = cluster.reconcile("shop").await.unwrap_err();

    assert!(matches!(err, ReconcileError::GatewayApply { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    assert_eq!(cluster.admin.lock().unwrap().unauthorized, 1);
    let stored = cluster.store.get_route("shop").unwrap();
    assert!(stored.has_finalizer());
    assert!(stored.status.is_none());
    assert_eq!(cluster.store.warnings(), vec!["ApplyFailed".to_string()]);
}

#[tokio::test]
async fn test_unavailable_gateway_holds_deletion() {
    let cluster = Cluster::start(ADMIN_KEY).await;
    cluster.store.apply(route(
        "shop",
        RouteSpec {
            domain: "shop.example.com".to_string(),
            ..Default::default()
        },
    ));
    cluster.reconcile("shop").await.unwrap();

    cluster.admin.lock().unwrap().unavailable = true;
    cluster.store.delete("shop");
    let err = cluster.reconcile("shop").await.unwrap_err();

    assert!(matches!(err, ReconcileError::GatewayDelete { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(900)));
    assert!(cluster.store.get_route("shop").unwrap().has_finalizer());
    assert!(cluster.document("demo-shop").is_some());

    cluster.admin.lock().unwrap().unavailable = false;
    cluster.reconcile("shop").await.unwrap();
    assert!(cluster.store.get_route("shop").is_none());
    assert!(cluster.document("demo-shop").is_none());
}
