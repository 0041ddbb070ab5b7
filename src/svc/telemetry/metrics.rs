//! # Metrics module
//!
//! This module renders the registered prometheus metrics

use hyper::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Body, Response, StatusCode,
};
use prometheus::{gather, Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to encode metrics, {0}")]
    Encode(prometheus::Error),
    #[error("failed to use content type given by prometheus as header, {0}")]
    ContentType(InvalidHeaderValue),
}

// -----------------------------------------------------------------------------
// Helper functions

/// returns the metrics of the default registry in the text exposition format
pub fn render() -> Result<(String, Vec<u8>), Error> {
    let encoder = TextEncoder::new();
    let mut buf = vec![];

    encoder.encode(&gather(), &mut buf).map_err(Error::Encode)?;
    Ok((encoder.format_type().to_string(), buf))
}

pub fn handler() -> Result<Response<Body>, Error> {
    let (content_type, buf) = render()?;
    let mut res = Response::new(Body::from(buf));

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type).map_err(Error::ContentType)?,
    );

    *res.status_mut() = StatusCode::OK;
    Ok(res)
}
