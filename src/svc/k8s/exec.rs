//! # Exec module
//!
//! This module provide the capability to execute a command in a container of
//! a running pod

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use tokio::io::AsyncReadExt;
use tracing::debug;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to attach to container '{0}' of pod '{1}', {2}")]
    Attach(String, String, kube::Error),
    #[error("failed to read output of the command, {0}")]
    Read(std::io::Error),
    #[error("failed to wait for the command to complete, {0}")]
    Join(String),
    #[error("command exited with a failure, {0}, stderr: {1}")]
    Failed(String, String),
}

// -----------------------------------------------------------------------------
// Output structure

#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

// -----------------------------------------------------------------------------
// PodExec trait

#[async_trait]
pub trait PodExec: Send + Sync {
    /// execute the command in the container and returns its captured output,
    /// a command exiting with a non-zero status is an error
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<Output, Error>;
}

// -----------------------------------------------------------------------------
// KubeExec structure

#[derive(Clone)]
pub struct KubeExec {
    client: kube::Client,
}

impl From<kube::Client> for KubeExec {
    fn from(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExec for KubeExec {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<Output, Error> {
        debug!(
            namespace = namespace,
            pod = pod,
            container = container,
            "Execute command in container"
        );

        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut process = kube::Api::<Pod>::namespaced(self.client.to_owned(), namespace)
            .exec(pod, command, &params)
            .await
            .map_err(|err| Error::Attach(container.into(), pod.into(), err))?;

        let status = process.take_status();
        let mut stdout = process.stdout();
        let mut stderr = process.stderr();

        let read_stdout = async {
            let mut buf = String::new();
            if let Some(reader) = stdout.as_mut() {
                reader.read_to_string(&mut buf).await.map_err(Error::Read)?;
            }
            Ok::<_, Error>(buf)
        };

        let read_stderr = async {
            let mut buf = String::new();
            if let Some(reader) = stderr.as_mut() {
                reader.read_to_string(&mut buf).await.map_err(Error::Read)?;
            }
            Ok::<_, Error>(buf)
        };

        let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        process
            .join()
            .await
            .map_err(|err| Error::Join(err.to_string()))?;

        match status {
            Some(s) if s.status.as_deref() == Some("Success") => Ok(Output { stdout, stderr }),
            Some(s) => Err(Error::Failed(
                s.message.unwrap_or_else(|| "unknown reason".into()),
                stderr,
            )),
            None => Err(Error::Failed("no status reported".into(), stderr)),
        }
    }
}
