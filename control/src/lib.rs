//! routesync control plane library
//!
//! Exposes the Route controller, its store and gateway admin seams, and
//! configuration for the binary and tests.

pub mod admin;
pub mod apis;
pub mod config;
pub mod error;
pub mod store;
