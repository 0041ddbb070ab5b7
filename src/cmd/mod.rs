//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{io, path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use crate::svc::{
    cfg::Configuration,
    k8s::{client, Context, Watcher},
    pgbackrest, telemetry,
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
}

// -----------------------------------------------------------------------------
// Command enumeration

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[command(name = "custom-resource-definition", aliases = ["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| Error::Execution("custom-resource-definition".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args structure

#[derive(Parser, Clone, Debug)]
#[command(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// daemon function

#[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
pub async fn daemon(kubeconfig: Option<PathBuf>, config: Arc<Configuration>) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Step 1: create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let client = client::try_new(kubeconfig).await.map_err(Error::Client)?;

    // -------------------------------------------------------------------------
    // Step 2: create the context given to the reconciler
    let ctx = Arc::new(Context::new(client.to_owned(), config.to_owned()));

    // -------------------------------------------------------------------------
    // Step 3: start the reconciler and the telemetry endpoint
    let listen = config.operator.listen;
    let handles = vec![
        tokio::spawn(async move {
            let reconciler = pgbackrest::Reconciler::default();

            info!("Start to listen for events of postgres cluster custom resource");
            reconciler.watch(client, ctx).await;

            error!("Stopped to listen for events of postgres cluster custom resource");
            abort();
        }),
        tokio::spawn(async move {
            if let Err(err) = telemetry::serve(listen).await {
                error!(
                    listen = listen.to_string(),
                    error = err.to_string(),
                    "Could not serve telemetry endpoint"
                );
            }

            abort();
        }),
    ];

    // -------------------------------------------------------------------------
    // Step 4: wait for termination signal
    tokio::signal::ctrl_c().await.map_err(Error::SigTerm)?;
    info!("Received termination signal, stop tasks");

    // -------------------------------------------------------------------------
    // Step 5: cancel tasks
    handles.iter().for_each(|handle| handle.abort());

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(error = err.to_string(), "Could not wait for the task to complete");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_line_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn verbosity_is_counted() {
        let args = Args::try_parse_from(["pgbackrest-operator", "-vvv", "--check"])
            .expect("arguments to be valid");

        assert_eq!(3, args.verbosity);
        assert!(args.check);
        assert!(args.command.is_none());
    }

    #[test]
    fn crd_alias_is_accepted() {
        let args = Args::try_parse_from(["pgbackrest-operator", "crd", "view"])
            .expect("arguments to be valid");

        assert!(matches!(
            args.command,
            Some(Command::CustomResourceDefinition(crd::CustomResourceDefinition::View))
        ));
    }
}
