//! # Backup module
//!
//! This module provide the backup jobs of a cluster, those requested
//! manually through an annotation and those scheduled by cronjobs

use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec},
    core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec},
};
use kube::{
    api::{ObjectMeta, PropagationPolicy},
    ResourceExt,
};
use tracing::{error, info};

use crate::svc::{
    crd::{
        condition,
        postgres_cluster::{JobStatus, PgBackRest, Repo},
    },
    k8s::{api::Api, recorder::Level},
    pgbackrest::{
        discovery::{timestamp, RepoResources},
        instance::Instances,
        naming::{self, BackupKind, ScheduleKind},
        repo_host::config_volume,
        Error, Outcome, Pass, Reason, REQUEUE_AFTER,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const PGBACKREST_BINARY: &str = "/opt/crunchy/bin/pgbackrest";

// -----------------------------------------------------------------------------
// Helpers functions

fn has_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == condition::STATUS_TRUE)
        })
        .unwrap_or(false)
}

pub fn is_complete(job: &Job) -> bool {
    has_condition(job, "Complete")
}

pub fn is_failed(job: &Job) -> bool {
    has_condition(job, "Failed")
}

/// copy the progress of the job into the status
pub fn mirror(job: &Job, status: &mut JobStatus) {
    let observed = job.status.to_owned().unwrap_or_default();

    status.start_time = observed.start_time.as_ref().map(timestamp);
    status.completion_time = observed.completion_time.as_ref().map(timestamp);
    status.active = observed.active.unwrap_or(0);
    status.succeeded = observed.succeeded.unwrap_or(0);
    status.failed = observed.failed.unwrap_or(0);
    status.finished = is_complete(job) || is_failed(job);
}

pub fn schedule(repo: &Repo, kind: ScheduleKind) -> Option<&str> {
    let schedules = repo.schedules.as_ref()?;

    match kind {
        ScheduleKind::Full => schedules.full.as_deref(),
        ScheduleKind::Differential => schedules.differential.as_deref(),
        ScheduleKind::Incremental => schedules.incremental.as_deref(),
    }
}

/// returns if the option is set in the given list, in either the
/// '--name=value' or the '--name value' form
pub fn has_option(options: &[String], name: &str) -> bool {
    options.iter().any(|option| {
        option
            .split_whitespace()
            .any(|word| word == name || word.starts_with(&format!("{}=", name)))
    })
}

fn annotation<'b>(job: &'b Job, key: &str) -> Option<&'b String> {
    job.annotations().get(key)
}

impl<'a, A: Api> Pass<'a, A> {
    /// returns the specification of a job running a pgbackrest backup from
    /// within the pod holding the repository or the primary
    pub fn backup_job_spec(
        &self,
        pgbackrest: &PgBackRest,
        repo: &Repo,
        labels: &BTreeMap<String, String>,
        options: &[String],
    ) -> JobSpec {
        let dedicated = self.cluster.dedicated_repo_host_enabled();
        let (container, selector) = if dedicated {
            (
                naming::CONTAINER_PGBACKREST,
                naming::repo_host_selector(&self.name),
            )
        } else {
            (
                naming::CONTAINER_DATABASE,
                naming::cluster_selector(&self.name).equals(naming::LABEL_ROLE, naming::ROLE_PRIMARY),
            )
        };

        let mut command_options = vec![
            format!("--stanza={}", naming::STANZA),
            format!("--repo={}", repo.index()),
        ];
        command_options.extend(options.iter().cloned());

        let env = [
            ("COMMAND", "backup".to_string()),
            ("COMMAND_OPTS", command_options.join(" ")),
            ("COMPARE_HASH", "true".to_string()),
            ("CONTAINER", container.to_string()),
            ("NAMESPACE", self.namespace.to_owned()),
            ("SELECTOR", selector.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect();

        let jobs = pgbackrest.jobs.to_owned().unwrap_or_default();

        JobSpec {
            ttl_seconds_after_finished: jobs.ttl_seconds_after_finished,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.to_owned()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: naming::CONTAINER_PGBACKREST.into(),
                        image: Some(self.pgbackrest_image()),
                        command: Some(vec![PGBACKREST_BINARY.into()]),
                        env: Some(env),
                        resources: jobs.resources,
                        ..Default::default()
                    }],
                    volumes: Some(vec![config_volume(
                        &self.name,
                        &[naming::CONFIG_INSTANCE, naming::CONFIG_HASH],
                        &pgbackrest.configuration,
                    )]),
                    priority_class_name: jobs.priority_class_name,
                    restart_policy: Some("Never".into()),
                    enable_service_links: Some(false),
                    service_account_name: Some(naming::rbac(&self.name)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    // -------------------------------------------------------------------------
    // Manual backup

    /// run the backup requested by the annotation of the cluster, once per
    /// distinct identifier
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, pgbackrest, jobs, instances)))]
    pub async fn reconcile_manual_backup(
        &mut self,
        pgbackrest: &PgBackRest,
        jobs: &[Job],
        instances: &Instances,
    ) -> Result<(), Error> {
        let requested = self
            .cluster
            .annotations()
            .get(naming::ANNOTATION_BACKUP)
            .cloned()
            .unwrap_or_default();

        if self.cluster.is_standby() {
            return Ok(());
        }

        // ---------------------------------------------------------------------
        // Step 1: follow or clean up observed jobs

        let mut current = None;
        let mut removed = false;
        for job in jobs {
            let id = annotation(job, naming::ANNOTATION_BACKUP).cloned().unwrap_or_default();

            let mirrored = self
                .pgbackrest_status()
                .manual_backup
                .as_mut()
                .filter(|status| status.id == id)
                .map(|status| {
                    mirror(job, status);
                    status.to_owned()
                });

            if let Some(status) = &mirrored {
                if is_complete(job) {
                    self.set_condition(
                        condition::MANUAL_BACKUP_SUCCESSFUL,
                        condition::STATUS_TRUE,
                        "ManualBackupComplete",
                        "Manual backup completed successfully",
                    );
                } else if is_failed(job) {
                    self.set_condition(
                        condition::MANUAL_BACKUP_SUCCESSFUL,
                        condition::STATUS_FALSE,
                        "ManualBackupFailed",
                        "Manual backup did not complete successfully",
                    );
                }

                info!(
                    namespace = &self.namespace,
                    name = &self.name,
                    id = &status.id,
                    finished = status.finished,
                    "Observed manual backup"
                );
            }

            if !requested.is_empty() && id != requested {
                info!(
                    namespace = &self.namespace,
                    name = &self.name,
                    id = &id,
                    requested = &requested,
                    "Manual backup has been superseded, delete its job"
                );

                self.delete::<Job>(&job.name_any(), PropagationPolicy::Background)
                    .await?;
            } else if is_complete(job) || is_failed(job) {
                self.delete::<Job>(&job.name_any(), PropagationPolicy::Background)
                    .await?;
                removed = true;
            } else {
                current = Some(job);
            }
        }

        // ---------------------------------------------------------------------
        // Step 2: check that a backup could run

        if removed || requested.is_empty() || instances.writable().is_none() {
            return Ok(());
        }

        let manual = match &pgbackrest.manual {
            Some(manual) => manual,
            None => return Ok(()),
        };

        let status = self.pgbackrest_status();
        if status.manual_backup.as_ref().map(|s| s.id != requested).unwrap_or(true) {
            status.manual_backup = Some(JobStatus {
                id: requested.to_owned(),
                ..Default::default()
            });
            self.remove_condition(condition::MANUAL_BACKUP_SUCCESSFUL);
        }

        let finished = self
            .status
            .pgbackrest
            .as_ref()
            .and_then(|status| status.manual_backup.as_ref())
            .map(|status| status.finished)
            .unwrap_or(false);

        if finished || !self.repo_host_ready() || !self.condition_is_true(condition::REPLICA_CREATE) {
            return Ok(());
        }

        match self.repo_status(&manual.repo_name) {
            None => {
                self.record(
                    &Level::Warning,
                    &Reason::InvalidBackupRepo,
                    &format!(
                        "Unable to find status for \"{}\" as configured for a manual backup. Please ensure this repository is declared in the backups of the cluster.",
                        manual.repo_name
                    ),
                )
                .await;
                return Ok(());
            }
            Some(status) if !status.stanza_created => {
                self.record(
                    &Level::Warning,
                    &Reason::StanzaNotCreated,
                    &format!(
                        "Stanza not created for \"{}\" as specified for a manual backup",
                        manual.repo_name
                    ),
                )
                .await;
                return Ok(());
            }
            Some(_) => {}
        }

        if has_option(&manual.options, "--repo") {
            self.record(
                &Level::Warning,
                &Reason::InvalidManualBackup,
                "Option '--repo' is not allowed: please use the 'repoName' field instead.",
            )
            .await;
            return Ok(());
        }

        let repo = pgbackrest
            .repo(&manual.repo_name)
            .ok_or_else(|| Error::UnknownRepo(manual.repo_name.to_owned()))?;

        // ---------------------------------------------------------------------
        // Step 3: apply the job of the requested backup

        let name = current
            .map(ResourceExt::name_any)
            .unwrap_or_else(|| naming::backup_job(&self.name, &repo.name, BackupKind::Manual, &requested));
        let labels = naming::backup_job_labels(&self.name, &repo.name, BackupKind::Manual);

        let mut metadata = self.metadata(&name, labels.to_owned());
        metadata.annotations = Some(BTreeMap::from([(
            naming::ANNOTATION_BACKUP.to_string(),
            requested.to_owned(),
        )]));

        self.api()
            .apply(&Job {
                metadata,
                spec: Some(self.backup_job_spec(pgbackrest, repo, &labels, &manual.options)),
                ..Default::default()
            })
            .await?;

        if current.is_none() {
            self.job_created(&BackupKind::Manual.to_string());
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Scheduled backups

    /// reconcile a cronjob for every schedule of every repository, a failure
    /// on one does not prevent the others
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, pgbackrest, resources)))]
    pub async fn reconcile_scheduled_backups(
        &mut self,
        pgbackrest: &PgBackRest,
        resources: &RepoResources,
    ) -> Outcome {
        let mut outcome = Outcome::default();

        for repo in &pgbackrest.repos {
            for kind in ScheduleKind::ALL {
                let schedule = match schedule(repo, kind) {
                    Some(schedule) => schedule,
                    None => continue,
                };

                let existing = resources.cronjob(&repo.name, kind);
                if let Err(err) = self
                    .reconcile_cronjob(pgbackrest, repo, kind, schedule, existing)
                    .await
                {
                    error!(
                        namespace = &self.namespace,
                        name = &self.name,
                        repo = &repo.name,
                        kind = kind.to_string(),
                        error = err.to_string(),
                        "Failed to reconcile backup schedule"
                    );

                    self.record(
                        &Level::Warning,
                        &Reason::UnableToCreateCronJob,
                        &format!("unable to create {} backup schedule for \"{}\", {}", kind, repo.name, err),
                    )
                    .await;

                    outcome = outcome.merge(Outcome::requeue(REQUEUE_AFTER));
                }
            }
        }

        outcome
    }

    async fn reconcile_cronjob(
        &mut self,
        pgbackrest: &PgBackRest,
        repo: &Repo,
        kind: ScheduleKind,
        schedule: &str,
        existing: Option<&CronJob>,
    ) -> Result<(), Error> {
        // an existing cronjob is always kept up to date so that it follows
        // shutdown and standby, only its creation waits for the cluster
        if existing.is_none() {
            if !self.status.is_bootstrapped() || !self.condition_is_true(condition::REPLICA_CREATE) {
                return Ok(());
            }

            match self.repo_status(&repo.name) {
                None => {
                    self.record(
                        &Level::Warning,
                        &Reason::InvalidBackupRepo,
                        &format!(
                            "Unable to find status for \"{}\" as configured for a scheduled backup. Please ensure this repository is declared in the backups of the cluster.",
                            repo.name
                        ),
                    )
                    .await;
                    return Ok(());
                }
                Some(status) if !status.stanza_created => {
                    self.record(
                        &Level::Warning,
                        &Reason::StanzaNotCreated,
                        &format!(
                            "Stanza not created for \"{}\" as specified for a scheduled backup",
                            repo.name
                        ),
                    )
                    .await;
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let name = existing
            .map(ResourceExt::name_any)
            .unwrap_or_else(|| naming::cronjob(&self.name, &repo.name, kind));
        let labels = naming::cronjob_labels(&self.name, &repo.name, kind);
        let options = vec![format!("--type={}", kind)];

        let cronjob = CronJob {
            metadata: self.metadata(&name, labels.to_owned()),
            spec: Some(CronJobSpec {
                schedule: schedule.to_string(),
                suspend: Some(self.cluster.is_shutdown() || self.cluster.is_standby()),
                concurrency_policy: Some("Forbid".into()),
                job_template: JobTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.to_owned()),
                        ..Default::default()
                    }),
                    spec: Some(self.backup_job_spec(pgbackrest, repo, &labels, &options)),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        self.api().apply(&cronjob).await?;
        Ok(())
    }
}
