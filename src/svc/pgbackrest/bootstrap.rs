//! # Bootstrap module
//!
//! This module provide the bootstrap of the repositories of a cluster. Stanzas
//! are created on the writable instance, then a full backup is taken on the
//! replica creation repository so that replicas could be created from it.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use kube::{api::PropagationPolicy, ResourceExt};
use tracing::{debug, error, info};

use crate::svc::{
    crd::{
        condition,
        postgres_cluster::{PgBackRest, PgBackRestStatus},
    },
    k8s::{api::Api, exec, recorder::Level},
    pgbackrest::{
        backup,
        discovery::RepoResources,
        instance::Instances,
        naming::{self, BackupKind},
        Error, Outcome, Pass, Reason, REQUEUE_AFTER,
    },
};

// -----------------------------------------------------------------------------
// Constants

/// written on the standard error by the stanza creation when the instance
/// does not run the expected configuration yet
pub const CONFIG_HASH_MISMATCH: &str = "pgbackrest configuration hash mismatch";

const STANZA_CREATE_SCRIPT: &str = r#"declare -r hash="$1" file="$2"
if [ "$(cat "${file}" 2>/dev/null)" != "${hash}" ]; then
    echo "pgbackrest configuration hash mismatch" >&2
    exit 1
fi
pgbackrest stanza-create --stanza=db || pgbackrest stanza-upgrade --stanza=db
"#;

// -----------------------------------------------------------------------------
// Bootstrap enumeration

/// step of the repository bootstrap the cluster is at
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Bootstrap {
    /// nothing could be done, there is no writable instance or no repository
    Dormant,
    AwaitingRepoHost,
    CreateStanza { pod: String },
    ReplicaCreateBackup { repo: String },
    Complete,
}

impl Bootstrap {
    pub fn observe(
        pgbackrest: &PgBackRest,
        status: Option<&PgBackRestStatus>,
        instances: &Instances,
        host_ready: bool,
    ) -> Self {
        let writable = match instances.writable() {
            Some(instance) => instance,
            None => return Self::Dormant,
        };

        let replica_create_repo = match pgbackrest.replica_create_repo() {
            Some(repo) => repo,
            None => return Self::Dormant,
        };

        if !host_ready {
            return Self::AwaitingRepoHost;
        }

        let repos = status.map(|s| s.repos.as_slice()).unwrap_or_default();
        if repos.is_empty() {
            return Self::Dormant;
        }

        if repos.iter().any(|repo| !repo.stanza_created) {
            return Self::CreateStanza {
                pod: naming::instance_pod(&writable.name),
            };
        }

        match status.and_then(|s| s.repo(&replica_create_repo.name)) {
            None => Self::Dormant,
            Some(repo) if !repo.replica_create_backup_complete => Self::ReplicaCreateBackup {
                repo: repo.name.to_owned(),
            },
            Some(_) => Self::Complete,
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

pub fn stanza_create_command(hash: &str) -> Vec<String> {
    vec![
        "bash".into(),
        "-ceu".into(),
        "--".into(),
        STANZA_CREATE_SCRIPT.into(),
        "stanza-create".into(),
        hash.into(),
        format!("{}/{}", naming::CONFIG_DIRECTORY, naming::CONFIG_HASH),
    ]
}

impl<'a, A: Api> Pass<'a, A> {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, pgbackrest, resources, instances)))]
    pub async fn bootstrap(
        &mut self,
        pgbackrest: &PgBackRest,
        resources: &RepoResources,
        instances: &Instances,
        hash: &str,
    ) -> Result<Outcome, Error> {
        let mut outcome = Outcome::default();

        // ---------------------------------------------------------------------
        // Step 1: stanzas created with another configuration are stale

        let status = self.pgbackrest_status();
        if status.stanza_config_hash.as_deref() != Some(hash)
            && status.repos.iter().any(|repo| repo.stanza_created)
        {
            info!(
                namespace = &self.namespace,
                name = &self.name,
                hash = hash,
                "Configuration changed since stanzas were created, create them again"
            );

            let status = self.pgbackrest_status();
            for repo in status.repos.iter_mut() {
                repo.stanza_created = false;
            }
        }

        // ---------------------------------------------------------------------
        // Step 2: create stanzas

        let host_ready = self.repo_host_ready();
        let step = Bootstrap::observe(pgbackrest, self.status.pgbackrest.as_ref(), instances, host_ready);
        debug!(
            namespace = &self.namespace,
            name = &self.name,
            step = format!("{:?}", step),
            "Observed repository bootstrap"
        );

        if let Bootstrap::CreateStanza { pod } = &step {
            outcome = self.create_stanza(pod, hash).await;
        }

        // ---------------------------------------------------------------------
        // Step 3: take the backup replicas are created from

        let step = Bootstrap::observe(pgbackrest, self.status.pgbackrest.as_ref(), instances, host_ready);
        if let Bootstrap::ReplicaCreateBackup { repo } = &step {
            self.reconcile_replica_create(pgbackrest, repo, &resources.replica_create_jobs, hash)
                .await?;
        }

        self.set_replica_conditions(pgbackrest);
        Ok(outcome)
    }

    async fn create_stanza(&mut self, pod: &str, hash: &str) -> Outcome {
        let result = self
            .ctx
            .exec
            .exec(
                &self.namespace,
                pod,
                naming::CONTAINER_DATABASE,
                stanza_create_command(hash),
            )
            .await;

        match result {
            Ok(_) => {
                let status = self.pgbackrest_status();
                for repo in status.repos.iter_mut() {
                    repo.stanza_created = true;
                }
                status.stanza_config_hash = Some(hash.to_string());

                info!(
                    namespace = &self.namespace,
                    name = &self.name,
                    pod = pod,
                    "Created pgbackrest stanzas"
                );

                self.record(
                    &Level::Normal,
                    &Reason::StanzasCreated,
                    "pgBackRest stanza creation completed successfully",
                )
                .await;

                Outcome::default()
            }
            Err(exec::Error::Failed(_, stderr)) if stderr.contains(CONFIG_HASH_MISMATCH) => {
                debug!(
                    namespace = &self.namespace,
                    name = &self.name,
                    pod = pod,
                    "Instance does not run the expected configuration yet, retry stanza creation later"
                );

                Outcome::requeue(REQUEUE_AFTER)
            }
            Err(err) => {
                error!(
                    namespace = &self.namespace,
                    name = &self.name,
                    pod = pod,
                    error = err.to_string(),
                    "Failed to create pgbackrest stanzas"
                );

                self.record(&Level::Warning, &Reason::UnableToCreateStanzas, &err.to_string())
                    .await;

                Outcome::requeue(REQUEUE_AFTER)
            }
        }
    }

    /// ensure the backup of the replica creation repository, a job taken
    /// for another repository or configuration is thrown away
    async fn reconcile_replica_create(
        &mut self,
        pgbackrest: &PgBackRest,
        repo_name: &str,
        jobs: &[Job],
        hash: &str,
    ) -> Result<(), Error> {
        let repo = pgbackrest
            .repo(repo_name)
            .ok_or_else(|| Error::UnknownRepo(repo_name.to_string()))?;

        let existing = jobs.first();
        if let Some(job) = existing {
            let stale_repo = job.labels().get(naming::LABEL_REPO).map(String::as_str) != Some(repo_name);
            let stale_config =
                job.annotations().get(naming::ANNOTATION_CONFIG_HASH).map(String::as_str) != Some(hash);

            if backup::is_failed(job) || stale_repo || stale_config {
                info!(
                    namespace = &self.namespace,
                    name = &self.name,
                    job = job.name_any(),
                    stale_repo = stale_repo,
                    stale_config = stale_config,
                    "Delete replica creation backup job"
                );

                return self
                    .delete::<Job>(&job.name_any(), PropagationPolicy::Background)
                    .await;
            }

            if backup::is_complete(job) {
                if let Some(status) = self.pgbackrest_status().repo_mut(repo_name) {
                    status.replica_create_backup_complete = true;
                }

                return Ok(());
            }
        }

        let name = existing
            .map(ResourceExt::name_any)
            .unwrap_or_else(|| naming::backup_job(&self.name, repo_name, BackupKind::ReplicaCreate, hash));
        let labels = naming::backup_job_labels(&self.name, repo_name, BackupKind::ReplicaCreate);

        let mut metadata = self.metadata(&name, labels.to_owned());
        metadata.annotations = Some(BTreeMap::from([(
            naming::ANNOTATION_CONFIG_HASH.to_string(),
            hash.to_string(),
        )]));

        self.api()
            .apply(&Job {
                metadata,
                spec: Some(self.backup_job_spec(pgbackrest, repo, &labels, &[])),
                ..Default::default()
            })
            .await?;

        if existing.is_none() {
            self.job_created(&BackupKind::ReplicaCreate.to_string());
        }

        Ok(())
    }

    fn set_replica_conditions(&mut self, pgbackrest: &PgBackRest) {
        let status = pgbackrest
            .replica_create_repo()
            .and_then(|repo| self.repo_status(&repo.name))
            .map(|status| (status.stanza_created, status.replica_create_backup_complete));

        match status {
            None => {
                self.set_condition(
                    condition::REPLICA_REPO_READY,
                    condition::STATUS_UNKNOWN,
                    "RepoStatusMissing",
                    "pgBackRest replica create repo status is missing",
                );
                self.set_condition(
                    condition::REPLICA_CREATE,
                    condition::STATUS_UNKNOWN,
                    "RepoStatusMissing",
                    "pgBackRest replica create repo status is missing",
                );
            }
            Some((stanza_created, backup_complete)) => {
                if stanza_created {
                    self.set_condition(
                        condition::REPLICA_REPO_READY,
                        condition::STATUS_TRUE,
                        "StanzaCreated",
                        "pgBackRest replica create repo is ready for backups",
                    );
                } else {
                    self.set_condition(
                        condition::REPLICA_REPO_READY,
                        condition::STATUS_FALSE,
                        "StanzaNotCreated",
                        "pgBackRest replica create repo is not ready for backups",
                    );
                }

                if backup_complete {
                    self.set_condition(
                        condition::REPLICA_CREATE,
                        condition::STATUS_TRUE,
                        "RepoBackupComplete",
                        "pgBackRest replica create repo has a full backup",
                    );
                } else {
                    self.set_condition(
                        condition::REPLICA_CREATE,
                        condition::STATUS_FALSE,
                        "RepoBackupNotComplete",
                        "pgBackRest replica create repo does not have a full backup",
                    );
                }
            }
        }
    }
}
