//! Controller metrics
//!
//! Prometheus counters and histograms for Route reconciliation and gateway
//! admin calls, served as text on `/metrics`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Route reconciliation duration
    static ref ROUTE_RECONCILIATION_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "route_reconciliation_duration_seconds",
            "Route reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["route", "namespace"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Route reconciliations total
    static ref ROUTE_RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "route_reconciliations_total",
            "Total number of route reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["route", "namespace", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Gateway admin API requests total
    static ref GATEWAY_ADMIN_REQUESTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "gateway_admin_requests_total",
            "Total number of gateway admin API requests",
        );
        let counter = IntCounterVec::new(opts, &["method", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record Route reconciliation
pub fn record_route_reconciliation(route: &str, namespace: &str, duration_secs: f64, result: &str) {
    ROUTE_RECONCILIATION_DURATION
        .with_label_values(&[route, namespace])
        .observe(duration_secs);

    ROUTE_RECONCILIATIONS_TOTAL
        .with_label_values(&[route, namespace, result])
        .inc();
}

/// Record gateway admin API request
pub fn record_admin_request(method: &str, result: &str) {
    GATEWAY_ADMIN_REQUESTS_TOTAL
        .with_label_values(&[method, result])
        .inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

fn handle_request(req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let (status, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match gather_controller_metrics() {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => {
                error!("Failed to gather metrics: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e)
            }
        },
        (&Method::GET, "/healthz") => (StatusCode::OK, "ok".to_string()),
        _ => (StatusCode::NOT_FOUND, "not found".to_string()),
    };

    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp
}

/// Serve `/metrics` and `/healthz` until `shutdown` flips to true
pub async fn serve_metrics(
    bind_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Metrics listener bound to {}", listener.local_addr()?);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted metrics connection from {}", peer_addr);
                        tokio::spawn(async move {
                            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                                Ok::<_, hyper::Error>(handle_request(&req))
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error on metrics listener: {}", e);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Metrics listener received shutdown signal");
                    break;
                }
            }
        }
    }

    Ok(())
}
