//! # Discovery module
//!
//! This module provide the inventory of the resources owned by a cluster for
//! its backup machinery. Resources that the specification no longer asks for
//! are deleted while they are discovered.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        batch::v1::{CronJob, Job},
        core::v1::{ConfigMap, PersistentVolumeClaim, Secret, ServiceAccount},
        rbac::v1::{Role, RoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{api::PropagationPolicy, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::svc::{
    crd::postgres_cluster::{PostgresCluster, ScheduledBackupStatus},
    k8s::{
        api::{Api, Object},
        resource,
    },
    pgbackrest::{
        backup,
        naming::{self, BackupKind, ScheduleKind},
        Error, Pass,
    },
};

// -----------------------------------------------------------------------------
// RepoResources structure

/// owned resources of the backup machinery that survived the pruning
#[derive(Clone, Debug, Default)]
pub struct RepoResources {
    pub hosts: Vec<StatefulSet>,
    pub volumes: Vec<PersistentVolumeClaim>,
    pub config_maps: Vec<ConfigMap>,
    pub secrets: Vec<Secret>,
    pub cronjobs: Vec<CronJob>,
    pub replica_create_jobs: Vec<Job>,
    pub manual_jobs: Vec<Job>,
    pub scheduled_jobs: Vec<Job>,
}

impl RepoResources {
    /// returns the name of the volume already backing the repository
    pub fn volume(&self, repo: &str) -> Option<String> {
        self.volumes
            .iter()
            .find(|pvc| pvc.labels().get(naming::LABEL_REPO).map(String::as_str) == Some(repo))
            .map(|pvc| pvc.name_any())
    }

    pub fn secret(&self, name: &str) -> Option<&Secret> {
        self.secrets.iter().find(|secret| secret.name_any() == name)
    }

    /// returns the non-terminating cronjob scheduling the backup
    pub fn cronjob(&self, repo: &str, kind: ScheduleKind) -> Option<&CronJob> {
        let kind = kind.to_string();

        self.cronjobs.iter().find(|cronjob| {
            let labels = cronjob.labels();

            !resource::deleted(*cronjob)
                && labels.get(naming::LABEL_REPO).map(String::as_str) == Some(repo)
                && labels.get(naming::LABEL_CRONJOB) == Some(&kind)
        })
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if a resource of the backup machinery with the given labels is
/// still asked for by the cluster
pub fn keep(cluster: &PostgresCluster, labels: &BTreeMap<String, String>) -> bool {
    let has = |label: &str| labels.contains_key(label);

    // a restore does not need backups of the cluster itself
    if has(naming::LABEL_RESTORE) {
        return !cluster.is_bootstrapped();
    }

    let pgbackrest = match cluster.pgbackrest() {
        Some(pgbackrest) => pgbackrest,
        None => return false,
    };

    let repo = labels
        .get(naming::LABEL_REPO)
        .and_then(|name| pgbackrest.repo(name));

    if has(naming::LABEL_CONFIG) {
        true
    } else if has(naming::LABEL_DEDICATED) {
        cluster.dedicated_repo_host_enabled()
    } else if has(naming::LABEL_REPO_VOLUME) {
        repo.map(|repo| repo.volume.is_some()).unwrap_or(false)
    } else if has(naming::LABEL_BACKUP) {
        repo.is_some()
    } else if let Some(kind) = labels.get(naming::LABEL_CRONJOB) {
        repo.map(|repo| {
            ScheduleKind::ALL
                .iter()
                .any(|k| &k.to_string() == kind && backup::schedule(repo, *k).is_some())
        })
        .unwrap_or(false)
    } else {
        true
    }
}

pub fn timestamp(time: &Time) -> String {
    time.0.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// returns the status of the jobs spawned by the backup schedules
pub fn scheduled_backups(jobs: &[Job]) -> Vec<ScheduledBackupStatus> {
    jobs.iter()
        .map(|job| {
            let labels = job.labels();
            let status = job.status.to_owned().unwrap_or_default();

            ScheduledBackupStatus {
                cron_job_name: job
                    .owner_references()
                    .first()
                    .map(|owner| owner.name.to_owned())
                    .unwrap_or_default(),
                repo: labels.get(naming::LABEL_REPO).cloned().unwrap_or_default(),
                type_: labels.get(naming::LABEL_CRONJOB).cloned().unwrap_or_default(),
                start_time: status.start_time.as_ref().map(timestamp),
                completion_time: status.completion_time.as_ref().map(timestamp),
                active: status.active.unwrap_or(0),
                succeeded: status.succeeded.unwrap_or(0),
                failed: status.failed.unwrap_or(0),
            }
        })
        .collect()
}

impl<'a, A: Api> Pass<'a, A> {
    /// list the owned resources of the kind and delete those that are no
    /// longer asked for, the owners are the cluster and resources it controls
    async fn observe<K: Object>(&self, owners: &[String]) -> Result<Vec<K>, Error> {
        let kind = K::kind(&()).to_string();
        let items: Vec<K> = self
            .api()
            .list(&self.namespace, &naming::pgbackrest_selector(&self.name))
            .await?;

        let mut kept = vec![];
        for item in items {
            if !owners.iter().any(|uid| resource::controlled_by(&item, uid)) {
                continue;
            }

            if keep(self.cluster, item.labels()) {
                kept.push(item);
                continue;
            }

            let name = item.name_any();
            debug!(
                kind = &kind,
                namespace = &self.namespace,
                name = &name,
                cluster = &self.name,
                "Resource is no longer asked for by the cluster, delete it"
            );

            // pruning is best-effort, the next pass tries again
            match self.delete::<K>(&name, PropagationPolicy::Background).await {
                Ok(()) => self.resource_pruned(&kind),
                Err(err) => {
                    warn!(
                        kind = &kind,
                        namespace = &self.namespace,
                        name = &name,
                        error = err.to_string(),
                        "Failed to delete resource that is no longer asked for"
                    );
                }
            }
        }

        Ok(kept)
    }

    /// returns the owned resources of the backup machinery and refresh the
    /// status of scheduled backups
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub async fn discover(&mut self) -> Result<RepoResources, Error> {
        let uid = self.cluster.meta().uid.to_owned().unwrap_or_default();
        let owners = vec![uid];

        let hosts = self.observe::<StatefulSet>(&owners).await?;
        let volumes = self.observe::<PersistentVolumeClaim>(&owners).await?;
        let config_maps = self.observe::<ConfigMap>(&owners).await?;
        let secrets = self.observe::<Secret>(&owners).await?;
        self.observe::<ServiceAccount>(&owners).await?;
        self.observe::<Role>(&owners).await?;
        self.observe::<RoleBinding>(&owners).await?;
        let cronjobs = self.observe::<CronJob>(&owners).await?;

        // jobs spawned by a schedule are controlled by its cronjob
        let mut owners = owners;
        owners.extend(cronjobs.iter().filter_map(|cronjob| cronjob.uid()));
        let jobs = self.observe::<Job>(&owners).await?;

        let mut resources = RepoResources {
            hosts,
            volumes,
            config_maps,
            secrets,
            cronjobs,
            ..Default::default()
        };

        let replica_create = BackupKind::ReplicaCreate.to_string();
        let manual = BackupKind::Manual.to_string();
        for job in jobs {
            let labels = job.labels();
            if labels.get(naming::LABEL_BACKUP) == Some(&replica_create) {
                resources.replica_create_jobs.push(job);
            } else if labels.get(naming::LABEL_BACKUP) == Some(&manual) {
                resources.manual_jobs.push(job);
            } else if labels.contains_key(naming::LABEL_CRONJOB) {
                resources.scheduled_jobs.push(job);
            }
        }

        if self.cluster.pgbackrest().is_some() {
            self.pgbackrest_status().scheduled_backups =
                scheduled_backups(&resources.scheduled_jobs);
        }

        Ok(resources)
    }
}
