//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing_subscriber::util::TryInitError),
    #[cfg(feature = "trace")]
    #[error("failed to install jaeger pipeline, {0}")]
    Jaeger(opentelemetry::trace::TraceError),
}

// -----------------------------------------------------------------------------
// Guard structure

/// keeps alive the clients flushing events on drop, it has to live as long
/// as the program
#[derive(Default)]
pub struct Guard {
    #[cfg(feature = "tracker")]
    _sentry: Option<sentry::ClientInitGuard>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        #[cfg(feature = "trace")]
        opentelemetry::global::shutdown_tracer_provider();
    }
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[cfg(feature = "tracker")]
fn tracker(config: &Configuration) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry.dsn.as_ref()?;

    Some(sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(feature = "trace")]
fn tracer(config: &Configuration) -> Result<Option<opentelemetry::sdk::trace::Tracer>, Error> {
    let endpoint = match &config.jaeger.endpoint {
        Some(endpoint) => endpoint,
        None => return Ok(None),
    };

    let mut pipeline = opentelemetry_jaeger::new_collector_pipeline()
        .with_endpoint(endpoint)
        .with_service_name(env!("CARGO_PKG_NAME"));

    if let Some(user) = &config.jaeger.user {
        pipeline = pipeline.with_username(user);
    }

    if let Some(password) = &config.jaeger.password {
        pipeline = pipeline.with_password(password);
    }

    pipeline
        .with_reqwest()
        .install_batch(opentelemetry::runtime::Tokio)
        .map(Some)
        .map_err(Error::Jaeger)
}

/// install the global subscriber, error tracking and distributed tracing are
/// enabled when the configuration tells where to send them
pub fn initialize(config: &Configuration, verbosity: usize) -> Result<Guard, Error> {
    let fmt = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true);

    let registry = tracing_subscriber::registry()
        .with(LevelFilter::from_level(level(verbosity)))
        .with(fmt);

    #[cfg(feature = "tracker")]
    let sentry = tracker(config);
    #[cfg(feature = "tracker")]
    let registry = registry.with(sentry.as_ref().map(|_| sentry_tracing::layer()));

    #[cfg(feature = "trace")]
    let registry = registry.with(
        tracer(config)?.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)),
    );

    #[cfg(not(any(feature = "tracker", feature = "trace")))]
    let _ = config;

    registry.try_init().map_err(Error::GlobalDefaultSubscriber)?;

    Ok(Guard {
        #[cfg(feature = "tracker")]
        _sentry: sentry,
    })
}
