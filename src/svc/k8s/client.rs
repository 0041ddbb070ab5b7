//! # Client module
//!
//! This module provide an helper to create a kubernetes client

use std::{convert::TryFrom, path::PathBuf};

use kube::{
    config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError},
    Config,
};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read kubernetes configuration file '{0:?}', {1}")]
    Kubeconfig(PathBuf, KubeconfigError),
    #[error("failed to infer kubernetes configuration, {0}")]
    Infer(InferConfigError),
    #[error("failed to create kubernetes client, {0}")]
    CreateClient(kube::Error),
}

/// returns a new kubernetes client from the given kubeconfig file if defined,
/// otherwise from the in-cluster service account or the default kubeconfig
#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn try_new(path: Option<PathBuf>) -> Result<kube::Client, Error> {
    let config = match path {
        Some(path) => {
            debug!(path = path.display().to_string(), "Load kubeconfig from file");
            let kubeconfig = Kubeconfig::read_from(&path)
                .map_err(|err| Error::Kubeconfig(path.to_owned(), err))?;

            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|err| Error::Kubeconfig(path, err))?
        }
        None => Config::infer().await.map_err(Error::Infer)?,
    };

    kube::Client::try_from(config).map_err(Error::CreateClient)
}
