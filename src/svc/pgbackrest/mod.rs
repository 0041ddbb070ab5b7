//! # pgBackRest module
//!
//! This module provide the reconciliation of the backup and restore
//! machinery of a postgres cluster. A pass observes the owned resources,
//! converges them toward the specification and writes the status of the
//! cluster once, at the end of the pass.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    batch::v1::{CronJob, Job},
    core::v1::{ConfigMap, PersistentVolumeClaim, Secret},
};
use kube::{
    api::{ObjectMeta, PropagationPolicy},
    runtime::{controller::Action, watcher, Controller},
    Resource, ResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::{info, warn};

use crate::svc::{
    crd::{
        condition,
        postgres_cluster::{PgBackRest, PgBackRestStatus, PostgresCluster, RepoStatus, Status},
    },
    k8s::{
        self,
        api::{self, Api, Object},
        recorder::{self, Level},
        resource, Context, ControllerBuilder,
    },
    pki,
};

pub mod backup;
pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod instance;
pub mod naming;
pub mod repo_host;
pub mod repo_volume;
pub mod restore;
#[cfg(test)]
mod tests;

// -----------------------------------------------------------------------------
// Constants

/// delay before the next pass when a step is waiting on something the
/// watched resources do not tell about
pub const REQUEUE_AFTER: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static JOBS_CREATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "pgbackrest_operator_jobs_created",
            "number of backup and restore jobs created"
        ),
        &["namespace", "kind"]
    )
    .expect("metrics 'pgbackrest_operator_jobs_created' to not be already registered")
});

#[cfg(feature = "metrics")]
static RESOURCES_PRUNED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "pgbackrest_operator_resources_pruned",
            "number of owned resources deleted as they no longer match the specification"
        ),
        &["namespace", "kind"]
    )
    .expect("metrics 'pgbackrest_operator_resources_pruned' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Api(api::Error),
    #[error("failed to generate ssh key material, {0}")]
    Pki(pki::Error),
    #[error("failed to serialize status, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to find repository '{0}' in the specification")]
    UnknownRepo(String),
    #[error("failed to determine the instance to restore, {0}")]
    StartupInstance(String),
    #[error("failed to observe restore environment, found {0} restore jobs instead of at most one")]
    TooManyRestoreJobs(usize),
    #[error("failed to reconcile independent items, {}", join(.0))]
    Aggregate(Vec<Error>),
}

impl From<api::Error> for Error {
    fn from(err: api::Error) -> Self {
        Self::Api(err)
    }
}

impl From<pki::Error> for Error {
    fn from(err: pki::Error) -> Self {
        Self::Pki(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err)
    }
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// returns the only error, an aggregate of errors or nothing
pub fn aggregate(mut errors: Vec<Error>) -> Result<(), Error> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Aggregate(errors)),
    }
}

// -----------------------------------------------------------------------------
// Outcome structure

/// result of a successful pass, it tells when the next one should happen if
/// nothing changes in the meantime
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// keep the earliest requeue of both outcomes
    pub fn merge(self, other: Self) -> Self {
        let requeue_after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Self { requeue_after }
    }
}

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Self {
        match outcome.requeue_after {
            Some(duration) => Action::requeue(duration),
            None => Action::await_change(),
        }
    }
}

// -----------------------------------------------------------------------------
// Reason enumeration

/// reasons of the events recorded on the cluster
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Reason {
    RepoHostCreated,
    StanzasCreated,
    UnableToCreateStanzas,
    InvalidBackupRepo,
    StanzaNotCreated,
    InvalidManualBackup,
    UnableToCreateCronJob,
    InvalidDataSource,
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::RepoHostCreated => write!(f, "RepoHostCreated"),
            Self::StanzasCreated => write!(f, "StanzasCreated"),
            Self::UnableToCreateStanzas => write!(f, "UnableToCreateStanzas"),
            Self::InvalidBackupRepo => write!(f, "InvalidBackupRepo"),
            Self::StanzaNotCreated => write!(f, "StanzaNotCreated"),
            Self::InvalidManualBackup => write!(f, "InvalidManualBackup"),
            Self::UnableToCreateCronJob => write!(f, "UnableToCreatePGBackRestCronJob"),
            Self::InvalidDataSource => write!(f, "InvalidDataSource"),
        }
    }
}

// -----------------------------------------------------------------------------
// Pass structure

/// state of one reconciliation pass of a cluster, the status is a working
/// copy written back when the pass ends
pub struct Pass<'a, A: Api> {
    pub ctx: &'a Context<A>,
    pub cluster: &'a PostgresCluster,
    pub namespace: String,
    pub name: String,
    pub status: Status,
}

impl<'a, A: Api> Pass<'a, A> {
    pub fn new(ctx: &'a Context<A>, cluster: &'a PostgresCluster) -> Self {
        let (namespace, name) = resource::namespaced_name(cluster);

        Self {
            ctx,
            cluster,
            namespace,
            name,
            status: cluster.status.to_owned().unwrap_or_default(),
        }
    }

    pub fn api(&self) -> &A {
        &self.ctx.api
    }

    pub fn generation(&self) -> Option<i64> {
        self.cluster.metadata.generation
    }

    /// returns the metadata of a resource controlled by the cluster
    pub fn metadata(&self, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.to_owned()),
            labels: Some(labels),
            owner_references: Some(vec![resource::owner_reference(self.cluster)]),
            ..Default::default()
        }
    }

    pub fn set_condition(&mut self, type_: &str, status: &str, reason: &str, message: &str) {
        let generation = self.generation();

        condition::set(
            &mut self.status.conditions,
            condition::new(type_, status, reason, message, generation),
        );
    }

    pub fn remove_condition(&mut self, type_: &str) {
        condition::remove(&mut self.status.conditions, type_);
    }

    pub fn condition_is_true(&self, type_: &str) -> bool {
        condition::is_true(&self.status.conditions, type_)
    }

    /// returns the backup status, creating it when missing
    pub fn pgbackrest_status(&mut self) -> &mut PgBackRestStatus {
        self.status
            .pgbackrest
            .get_or_insert_with(PgBackRestStatus::default)
    }

    pub fn repo_status(&self, name: &str) -> Option<&RepoStatus> {
        self.status
            .pgbackrest
            .as_ref()
            .and_then(|status| status.repo(name))
    }

    /// returns if the repository host is ready, which holds when the cluster
    /// does not need one
    pub fn repo_host_ready(&self) -> bool {
        !self.cluster.dedicated_repo_host_enabled()
            || self
                .status
                .pgbackrest
                .as_ref()
                .and_then(|status| status.repo_host.as_ref())
                .map(|host| host.ready)
                .unwrap_or(false)
    }

    pub fn pgbackrest_image(&self) -> String {
        self.cluster
            .pgbackrest()
            .and_then(|pgbackrest| pgbackrest.image.to_owned())
            .unwrap_or_else(|| self.ctx.config.pgbackrest.image.to_owned())
    }

    pub fn postgres_image(&self) -> String {
        self.cluster
            .spec
            .image
            .to_owned()
            .unwrap_or_else(|| self.ctx.config.postgres.image.to_owned())
    }

    /// record an event on the cluster, a failure to do so is only logged
    pub async fn record(&self, level: &Level, reason: &Reason, message: &str) {
        if let Err(err) = recorder::record(self.api(), self.cluster, level, reason, message).await
        {
            warn!(
                namespace = &self.namespace,
                name = &self.name,
                reason = reason.to_string(),
                error = err.to_string(),
                "Failed to record event on custom resource"
            );
        }
    }

    pub async fn delete<K: Object>(&self, name: &str, policy: PropagationPolicy) -> Result<(), Error> {
        info!(
            kind = K::kind(&()).to_string(),
            namespace = &self.namespace,
            name = name,
            cluster = &self.name,
            "Delete resource of the cluster"
        );

        Ok(self.api().delete::<K>(&self.namespace, name, policy).await?)
    }

    pub fn job_created(&self, kind: &str) {
        info!(
            namespace = &self.namespace,
            name = &self.name,
            kind = kind,
            "Create job for the cluster"
        );

        #[cfg(feature = "metrics")]
        JOBS_CREATED.with_label_values(&[&self.namespace, kind]).inc();
    }

    pub fn resource_pruned(&self, kind: &str) {
        #[cfg(feature = "metrics")]
        RESOURCES_PRUNED.with_label_values(&[&self.namespace, kind]).inc();
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }

    // -------------------------------------------------------------------------
    // Pass

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn run(&mut self) -> Result<Outcome, Error> {
        let cluster = self.cluster;
        let instances = instance::observe(self.api(), &self.namespace, &self.name).await?;

        // ---------------------------------------------------------------------
        // Step 1: check that the backup machinery could be reconciled

        if cluster.pgbackrest().is_none() && !self.backup_removal_allowed().await? {
            warn!(
                namespace = &self.namespace,
                name = &self.name,
                annotation = naming::ANNOTATION_AUTHORIZE_REMOVAL,
                "Backups are removed from the specification but the repository host still exists, annotate the cluster to authorize their removal"
            );

            return Ok(Outcome::default());
        }

        // ---------------------------------------------------------------------
        // Step 2: initialize data from a data source or restore in-place, the
        // instances are left alone until it completes

        if let restore::Initialization::InProgress(outcome) =
            self.reconcile_data_source(&instances).await?
        {
            info!(
                namespace = &self.namespace,
                name = &self.name,
                "Data of the cluster is being initialized, wait for it to complete"
            );

            return Ok(outcome);
        }

        // ---------------------------------------------------------------------
        // Step 3: discover owned resources and prune stale ones

        let resources = self.discover().await?;

        // ---------------------------------------------------------------------
        // Step 4: converge the backup machinery

        match cluster.pgbackrest() {
            Some(pgbackrest) => {
                self.reconcile_backups(pgbackrest, &resources, &instances)
                    .await
            }
            None => {
                self.clear_backups();
                Ok(Outcome::default())
            }
        }
    }

    async fn reconcile_backups(
        &mut self,
        pgbackrest: &PgBackRest,
        resources: &discovery::RepoResources,
        instances: &instance::Instances,
    ) -> Result<Outcome, Error> {
        self.pgbackrest_status();

        let host = self.reconcile_repo_host(resources, instances).await?;
        self.reconcile_repo_volumes(pgbackrest, resources).await?;

        let hash = self
            .reconcile_config(pgbackrest, host.as_ref(), resources, instances)
            .await?;
        self.reconcile_rbac().await?;

        let mut outcome = self
            .bootstrap(pgbackrest, resources, instances, &hash)
            .await?;
        outcome = outcome.merge(
            self.reconcile_scheduled_backups(pgbackrest, resources)
                .await,
        );

        self.reconcile_manual_backup(pgbackrest, &resources.manual_jobs, instances)
            .await?;

        Ok(outcome)
    }

    /// forget everything about backups but the restore, which does not need
    /// repositories of the cluster
    fn clear_backups(&mut self) {
        self.status.pgbackrest = self
            .status
            .pgbackrest
            .take()
            .and_then(|status| status.restore)
            .map(|restore| PgBackRestStatus {
                restore: Some(restore),
                ..Default::default()
            });

        for type_ in [
            condition::REPO_HOST_READY,
            condition::REPLICA_REPO_READY,
            condition::REPLICA_CREATE,
            condition::MANUAL_BACKUP_SUCCESSFUL,
        ] {
            self.remove_condition(type_);
        }
    }

    async fn backup_removal_allowed(&self) -> Result<bool, Error> {
        let authorized = self
            .cluster
            .annotations()
            .get(naming::ANNOTATION_AUTHORIZE_REMOVAL)
            .map(|value| value == "true")
            .unwrap_or(false);

        if authorized {
            return Ok(true);
        }

        let host: Option<StatefulSet> = self
            .api()
            .get(&self.namespace, &naming::repo_host(&self.name))
            .await?;

        Ok(host.is_none())
    }
}

/// returns the status with the changes of the pass applied on it, the delta
/// is computed against the status the pass started from so that fields
/// written by others in the meantime survive
fn merge(status: &Option<Status>, delta: &json_patch::Patch) -> Option<Status> {
    let mut value = serde_json::to_value(status).ok()?;
    json_patch::patch(&mut value, delta).ok()?;
    serde_json::from_value(value).ok()
}

// -----------------------------------------------------------------------------
// Helpers functions

/// run a reconciliation pass of the backup and restore machinery of the
/// cluster and write its status
#[cfg_attr(feature = "trace", tracing::instrument(skip(ctx, cluster)))]
pub async fn reconcile<A: Api>(ctx: &Context<A>, cluster: &PostgresCluster) -> Result<Outcome, Error> {
    let mut pass = Pass::new(ctx, cluster);
    let result = pass.run().await;

    let status = Some(pass.status);
    let delta = json_patch::diff(
        &serde_json::to_value(&cluster.status)?,
        &serde_json::to_value(&status)?,
    );

    let written = resource::patch_status(&ctx.api, cluster, move |obj: &mut PostgresCluster| {
        obj.status = merge(&obj.status, &delta).or_else(|| status.to_owned());
    })
    .await
    .map_err(Error::from);

    match (result, written) {
        (Ok(outcome), Ok(_)) => Ok(outcome),
        (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
        (Err(err), Err(status)) => Err(Error::Aggregate(vec![err, status])),
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<PostgresCluster> for Reconciler {
    fn build(&self, client: kube::Client) -> Controller<PostgresCluster> {
        let config = watcher::Config::default();

        Controller::new(kube::Api::all(client.to_owned()), config.to_owned())
            .owns(kube::Api::<StatefulSet>::all(client.to_owned()), config.to_owned())
            .owns(kube::Api::<Job>::all(client.to_owned()), config.to_owned())
            .owns(kube::Api::<CronJob>::all(client.to_owned()), config.to_owned())
            .owns(
                kube::Api::<PersistentVolumeClaim>::all(client.to_owned()),
                config.to_owned(),
            )
            .owns(kube::Api::<ConfigMap>::all(client.to_owned()), config.to_owned())
            .owns(kube::Api::<Secret>::all(client), config)
    }
}

#[async_trait]
impl k8s::Reconciler<PostgresCluster> for Reconciler {
    type Error = Error;

    async fn upsert(ctx: Arc<Context>, origin: Arc<PostgresCluster>) -> Result<Action, Error> {
        Ok(reconcile(&*ctx, &*origin).await?.into())
    }

    async fn delete(_ctx: Arc<Context>, origin: Arc<PostgresCluster>) -> Result<Action, Error> {
        let (namespace, name) = resource::namespaced_name(&*origin);

        info!(
            namespace = &namespace,
            name = &name,
            "Resources of the cluster are owned by it, let the garbage collector remove them"
        );

        Ok(Action::await_change())
    }
}
