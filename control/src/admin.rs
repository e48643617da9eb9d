//! Gateway admin API client
//!
//! PUT/DELETE of route documents keyed by route id against an APISIX-style
//! admin API (`{admin_url}/routes/{id}`). Both calls are idempotent: PUT
//! replaces the stored document, DELETE of a missing route succeeds.

use crate::apis::metrics::record_admin_request;
use crate::config::GatewayConfig;
use async_trait::async_trait;
use common::GatewayRoute;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header carrying the admin credential
pub const ADMIN_KEY_HEADER: &str = "X-API-KEY";

/// Error bodies longer than this are cut before being logged
const MAX_ERROR_BODY: usize = 512;

/// Admin API errors
#[derive(Error, Debug)]
pub enum AdminError {
    #[error("Invalid admin URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to encode route document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to build admin request: {0}")]
    Request(String),

    #[error("Admin API connection failed: {0}")]
    Connection(String),

    #[error("Admin API request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Admin API returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Route operations on the gateway control plane
#[async_trait]
pub trait GatewayAdmin: Send + Sync {
    /// Store `document` under `route_id`, replacing any previous document
    async fn put(&self, route_id: &str, document: &GatewayRoute) -> Result<(), AdminError>;

    /// Remove the document stored under `route_id`
    async fn delete(&self, route_id: &str) -> Result<(), AdminError>;
}

/// Hands out a fresh admin client for each reconciliation
pub trait GatewayConnector: Send + Sync + 'static {
    type Admin: GatewayAdmin;

    fn connect(&self) -> Result<Self::Admin, AdminError>;
}

impl<T: GatewayConnector> GatewayConnector for std::sync::Arc<T> {
    type Admin = T::Admin;

    fn connect(&self) -> Result<Self::Admin, AdminError> {
        (**self).connect()
    }
}

/// Connector for [`ApisixAdminClient`]
#[derive(Debug, Clone)]
pub struct ApisixConnector {
    config: GatewayConfig,
}

impl ApisixConnector {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }
}

impl GatewayConnector for ApisixConnector {
    type Admin = ApisixAdminClient;

    fn connect(&self) -> Result<Self::Admin, AdminError> {
        ApisixAdminClient::new(&self.config)
    }
}

/// HTTP client for the APISIX admin API
pub struct ApisixAdminClient {
    base_url: String,
    admin_key: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl ApisixAdminClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, AdminError> {
        let base_url = config.admin_url.trim_end_matches('/').to_string();

        let uri = base_url.parse::<Uri>().map_err(|e| AdminError::InvalidUrl {
            url: config.admin_url.clone(),
            reason: e.to_string(),
        })?;
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(AdminError::InvalidUrl {
                url: config.admin_url.clone(),
                reason: "expected http://host[:port]/path".to_string(),
            });
        }

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            base_url,
            admin_key: config.admin_key.clone(),
            timeout: config.request_timeout(),
            client,
        })
    }

    fn route_url(&self, route_id: &str) -> String {
        format!("{}/routes/{}", self.base_url, route_id)
    }

    /// Send one request and return the response status with its body
    async fn send(
        &self,
        method: Method,
        route_id: &str,
        body: Bytes,
    ) -> Result<(StatusCode, Bytes), AdminError> {
        let url = self.route_url(route_id);

        let mut builder = Request::builder().method(method.clone()).uri(&url);
        if !body.is_empty() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        if !self.admin_key.is_empty() {
            builder = builder.header(ADMIN_KEY_HEADER, &self.admin_key);
        }
        let req = builder
            .body(Full::new(body))
            .map_err(|e| AdminError::Request(e.to_string()))?;

        debug!(method = %method, url = %url, "Sending admin request");

        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| AdminError::Connection(e.to_string()))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| AdminError::Connection(e.to_string()))?
                .to_bytes();
            Ok::<_, AdminError>((status, body))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_elapsed) => Err(AdminError::Timeout(self.timeout)),
        }
    }
}

fn status_error(status: StatusCode, body: &Bytes) -> AdminError {
    let mut body = String::from_utf8_lossy(body).into_owned();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    AdminError::Status {
        status: status.as_u16(),
        body,
    }
}

#[async_trait]
impl GatewayAdmin for ApisixAdminClient {
    async fn put(&self, route_id: &str, document: &GatewayRoute) -> Result<(), AdminError> {
        let body = Bytes::from(serde_json::to_vec(document)?);

        let result = match self.send(Method::PUT, route_id, body).await {
            Ok((status, _)) if status.is_success() => Ok(()),
            Ok((status, body)) => Err(status_error(status, &body)),
            Err(e) => Err(e),
        };

        record_admin_request("PUT", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn delete(&self, route_id: &str) -> Result<(), AdminError> {
        let result = match self.send(Method::DELETE, route_id, Bytes::new()).await {
            Ok((status, _)) if status.is_success() => Ok(()),
            Ok((StatusCode::NOT_FOUND, _)) => {
                debug!(route_id = %route_id, "Route already absent from gateway");
                Ok(())
            }
            Ok((status, body)) => Err(status_error(status, &body)),
            Err(e) => Err(e),
        };

        record_admin_request("DELETE", if result.is_ok() { "success" } else { "error" });
        result
    }
}
