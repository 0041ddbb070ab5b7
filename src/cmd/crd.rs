//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface function
//! implementation

use std::sync::Arc;

use async_trait::async_trait;
use clap::Subcommand;
use kube::CustomResourceExt;

use crate::{
    cmd::Executor,
    svc::{cfg::Configuration, crd::postgres_cluster::PostgresCluster},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// CustomResourceDefinition enumeration

#[derive(Subcommand, Clone, Debug)]
pub enum CustomResourceDefinition {
    /// View the postgres cluster custom resource definition
    #[command(name = "view", aliases = ["v"])]
    View,
}

#[async_trait]
impl Executor for CustomResourceDefinition {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::View => view(config).await,
        }
    }
}

// -----------------------------------------------------------------------------
// view function

/// returns the yaml manifest of the custom resource definition
pub fn manifest() -> Result<String, Error> {
    serde_yaml::to_string(&PostgresCluster::crd()).map_err(Error::Serialize)
}

#[cfg_attr(feature = "trace", tracing::instrument(skip(_config)))]
pub async fn view(_config: Arc<Configuration>) -> Result<(), Error> {
    print!("{}", manifest()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_describes_postgres_clusters() {
        let manifest = manifest().expect("crd to be serializable");

        assert!(manifest.contains("postgresclusters.postgres-operator.io"));
        assert!(manifest.contains("kind: PostgresCluster"));
    }
}
