//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const OPERATOR_FIELD_MANAGER: &str = "pgbackrest-operator";
pub const OPERATOR_REQUEUE_SECONDS: u64 = 5;
pub const PGBACKREST_IMAGE: &str = "registry.developers.crunchydata.com/crunchydata/crunchy-pgbackrest:ubi8-2.41-4";
pub const POSTGRES_IMAGE: &str = "registry.developers.crunchydata.com/crunchydata/crunchy-postgres:ubi8-15.2-0";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
    #[serde(rename = "field_manager")]
    pub field_manager: String,
    #[serde(rename = "requeue_seconds")]
    pub requeue_seconds: u64,
}

// -----------------------------------------------------------------------------
// Image structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Image {
    #[serde(rename = "image")]
    pub image: String,
}

// -----------------------------------------------------------------------------
// Sentry structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Sentry {
    #[serde(rename = "dsn", default)]
    pub dsn: Option<String>,
}

// -----------------------------------------------------------------------------
// Jaeger structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Jaeger {
    #[serde(rename = "endpoint", default)]
    pub endpoint: Option<String>,
    #[serde(rename = "user", default)]
    pub user: Option<String>,
    #[serde(rename = "password", default)]
    pub password: Option<String>,
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "pgbackrest")]
    pub pgbackrest: Image,
    #[serde(rename = "postgres")]
    pub postgres: Image,
    #[serde(rename = "sentry", default)]
    pub sentry: Sentry,
    #[serde(rename = "jaeger", default)]
    pub jaeger: Jaeger,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults()?
            .add_source(environment())
            .add_source(File::from(path.to_owned()).required(true))
            .build()
            .map_err(|err| Error::File(path, err))?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

impl Configuration {
    #[cfg_attr(feature = "trace", tracing::instrument)]
    pub fn try_default() -> Result<Self, Error> {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        let paths = [
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("{}/.config/{}/config", home, env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("{}/.local/share/{}/config", home, env!("CARGO_PKG_NAME"))),
            PathBuf::from("config"),
        ];

        let mut builder = defaults()?.add_source(environment());
        for path in paths {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

fn defaults() -> Result<ConfigBuilder<DefaultState>, Error> {
    let mut builder = Config::builder();

    for (key, value) in [
        ("operator.listen", OPERATOR_LISTEN.to_string()),
        ("operator.field_manager", OPERATOR_FIELD_MANAGER.to_string()),
        ("operator.requeue_seconds", OPERATOR_REQUEUE_SECONDS.to_string()),
        ("pgbackrest.image", PGBACKREST_IMAGE.to_string()),
        ("postgres.image", POSTGRES_IMAGE.to_string()),
    ] {
        builder = builder
            .set_default(key, value)
            .map_err(|err| Error::Default(key.into(), err))?;
    }

    Ok(builder)
}

fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_")).separator("__")
}


#[cfg(test)]
pub fn fixture() -> Configuration {
    Configuration {
        operator: Operator {
            listen: ([127, 0, 0, 1], 8000).into(),
            field_manager: OPERATOR_FIELD_MANAGER.to_string(),
            requeue_seconds: OPERATOR_REQUEUE_SECONDS,
        },
        pgbackrest: Image {
            image: PGBACKREST_IMAGE.to_string(),
        },
        postgres: Image {
            image: POSTGRES_IMAGE.to_string(),
        },
        sentry: Sentry::default(),
        jaeger: Jaeger::default(),
    }
}
