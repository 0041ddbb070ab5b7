//! # Telemetry module
//!
//! This module expose the operator's own http endpoint, probes for the
//! kubelet and prometheus metrics when the feature is enabled

use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::{debug, info};

#[cfg(feature = "metrics")]
pub mod metrics;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "pgbackrest_operator_http_requests",
            "number of requests answered by the telemetry endpoint",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'pgbackrest_operator_http_requests' to not be already registered")
});

#[cfg(feature = "metrics")]
static HTTP_REQUESTS_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "pgbackrest_operator_http_requests_duration",
            "cumulated time spent answering requests on the telemetry endpoint",
        ),
        &["method", "path", "unit"]
    )
    .expect("metrics 'pgbackrest_operator_http_requests_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("failed to render metrics, {0}")]
    Metrics(metrics::Error),
    #[error("failed to serialize payload, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to serve telemetry endpoint, {0}")]
    Serve(hyper::Error),
}

// -----------------------------------------------------------------------------
// Helper functions

/// listens on the given address until the future is dropped
pub async fn serve(listen: SocketAddr) -> Result<(), Error> {
    let service = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|req| async move {
            Ok::<_, Infallible>(router(req).await)
        }))
    });

    info!(listen = listen.to_string(), "Start to listen for http requests");
    Server::bind(&listen)
        .serve(service)
        .await
        .map_err(Error::Serve)
}

/// dispatches the request, failures are turned into a json payload so the
/// endpoint never drops a connection
#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn router(req: Request<Body>) -> Response<Body> {
    let begin = Instant::now();
    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") | (&Method::GET, "/livez") | (&Method::GET, "/readyz") => {
            Ok(status(StatusCode::NO_CONTENT))
        }
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler().map_err(Error::Metrics),
        _ => Ok(status(StatusCode::NOT_FOUND)),
    };

    let res = match result {
        Ok(res) => res,
        Err(err) => failure(&err),
    };

    let duration = begin.elapsed().as_micros();
    let path = req.uri().path();
    if path == "/metrics" || path.ends_with('z') {
        debug!(
            method = req.method().as_str(),
            path = path,
            status = res.status().as_u16(),
            duration = duration,
            "Answer probe"
        );
    } else {
        info!(
            method = req.method().as_str(),
            path = path,
            status = res.status().as_u16(),
            duration = duration,
            "Answer request"
        );
    }

    #[cfg(feature = "metrics")]
    {
        HTTP_REQUESTS
            .with_label_values(&[req.method().as_str(), path, res.status().as_str()])
            .inc();
        HTTP_REQUESTS_DURATION
            .with_label_values(&[req.method().as_str(), path, "us"])
            .inc_by(duration as f64);
    }

    res
}

fn status(code: StatusCode) -> Response<Body> {
    let mut res = Response::default();
    *res.status_mut() = code;
    res
}

fn failure(err: &Error) -> Response<Body> {
    let mut payload = BTreeMap::new();
    payload.insert("error", err.to_string());

    let mut res = status(StatusCode::INTERNAL_SERVER_ERROR);
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    *res.body_mut() = match serde_json::to_string(&payload).map_err(Error::Serialize) {
        Ok(body) => Body::from(body),
        Err(err) => Body::from(err.to_string()),
    };

    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .expect("request to be valid")
    }

    #[tokio::test]
    async fn probes_answer_no_content() {
        for path in ["/healthz", "/livez", "/readyz"] {
            assert_eq!(StatusCode::NO_CONTENT, router(get(path)).await.status());
        }
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        assert_eq!(StatusCode::NOT_FOUND, router(get("/backups")).await.status());

        let req = Request::builder()
            .method(Method::POST)
            .uri("/healthz")
            .body(Body::empty())
            .expect("request to be valid");
        assert_eq!(StatusCode::NOT_FOUND, router(req).await.status());
    }

    #[tokio::test]
    async fn failures_are_reported_as_json() {
        let err = Error::Serialize(serde_json::from_str::<u8>("x").unwrap_err());
        let res = failure(&err);

        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, res.status());
        assert_eq!(
            Some(&HeaderValue::from_static("application/json")),
            res.headers().get(header::CONTENT_TYPE)
        );

        let body = hyper::body::to_bytes(res.into_body())
            .await
            .expect("body to be readable");
        let payload: BTreeMap<String, String> =
            serde_json::from_slice(&body).expect("body to be json");
        assert!(payload["error"].starts_with("failed to serialize payload"));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn metrics_are_exposed_as_text() {
        router(get("/livez")).await;

        let res = router(get("/metrics")).await;
        assert_eq!(StatusCode::OK, res.status());

        let body = hyper::body::to_bytes(res.into_body())
            .await
            .expect("body to be readable");
        assert!(String::from_utf8_lossy(&body).contains("pgbackrest_operator_http_requests"));
    }
}
