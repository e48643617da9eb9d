//! Gateway route support
//!
//! - Route: the custom resource and its lifecycle
//! - RouteReconciler: drives the gateway admin API to match Routes

pub mod route;
pub mod route_controller;
