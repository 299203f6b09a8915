//! Prometheus metrics and the health/metrics HTTP endpoint

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;

lazy_static! {
    /// Total reconcile passes executed
    pub static ref RECONCILIATIONS: Counter = register_counter!(
        "storage_volume_operator_reconciliations_total",
        "Total number of reconcile passes"
    )
    .unwrap();

    /// Reconcile failures by class (retryable, terminal)
    pub static ref RECONCILE_ERRORS: CounterVec = register_counter_vec!(
        "storage_volume_operator_reconcile_errors_total",
        "Total number of reconcile failures by class",
        &["class"]
    )
    .unwrap();

    /// Reconcile pass duration
    pub static ref RECONCILE_DURATION: Histogram = register_histogram!(
        "storage_volume_operator_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    /// Partition tool operations by kind (create, delete)
    pub static ref PARTITION_OPS: CounterVec = register_counter_vec!(
        "storage_volume_operator_partition_operations_total",
        "Total number of successful partition operations",
        &["operation"]
    )
    .unwrap();
}

/// Serve /metrics, /healthz and /readyz.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving metrics connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        RECONCILIATIONS.inc();
        RECONCILE_ERRORS.with_label_values(&["retryable"]).inc();
        PARTITION_OPS.with_label_values(&["create"]).inc();

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "storage_volume_operator_reconciliations_total"));
    }
}
