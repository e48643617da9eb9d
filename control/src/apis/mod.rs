//! Kubernetes API integrations
//!
//! Route resource, its controller, and the controller metrics.

pub mod gateway;
pub mod metrics;
