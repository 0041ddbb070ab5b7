//! # Restore module
//!
//! This module provide the initialization of the data directory of a cluster
//! from a pgbackrest repository, either when the cluster is created from
//! another cluster or a cloud repository, or when it is restored in-place.
//!
//! An in-place restore first tears down what would conflict with it: the
//! previous restore job, the database runners, then the membership
//! endpoints. Each pass removes the first of them still present.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::StatefulSet,
    batch::v1::{Job, JobSpec},
    core::v1::{
        ConfigMap, ConfigMapProjection, Container, Endpoints, EnvVar, KeyToPath,
        PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
        PodTemplateSpec, ProjectedVolumeSource, ResourceRequirements, Secret, SecretProjection,
        Volume, VolumeMount, VolumeProjection,
    },
};
use k8s_openapi::ByteString;
use kube::{
    api::{ObjectMeta, PropagationPolicy},
    ResourceExt,
};
use tracing::info;

use crate::svc::{
    crd::{
        condition,
        postgres_cluster::{
            ClusterDataSource, CloudDataSource, JobStatus, PgBackRestStatus, PostgresCluster,
        },
    },
    k8s::{
        api::{self, Api},
        recorder::Level,
        resource,
    },
    pgbackrest::{
        backup, config,
        instance::Instances,
        naming,
        repo_host::SSH_DIRECTORY,
        Error, Outcome, Pass, Reason, REQUEUE_AFTER,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const CONTAINER_RESTORE: &str = "pgbackrest-restore";

pub const REASON_READY_FOR_RESTORE: &str = "ReadyForRestore";

/// options the restore command sets by itself, they could not be given
pub const FORBIDDEN_OPTIONS: [&str; 5] = [
    "--repo",
    "--stanza",
    "--pg1-path",
    "--target-action",
    "--link-map",
];

const RESTORE_SCRIPT: &str = r#"declare -r pgdata="$1" opts="$2"
install --directory --mode=0700 "${pgdata}"
eval "pgbackrest restore ${opts}"
rm -f "${pgdata}/patroni.dynamic.json"
"#;

// -----------------------------------------------------------------------------
// RestoreEnv structure

/// what an in-place restore has to remove before it could start
#[derive(Clone, Debug, Default)]
pub struct RestoreEnv {
    pub endpoints: Vec<Endpoints>,
    pub job: Option<Job>,
}

// -----------------------------------------------------------------------------
// Initialization enumeration

/// where the initialization of the data directory stands
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Initialization {
    /// there is no data source or its data is in place
    Complete,
    /// the data directory is being prepared or populated, nothing else may
    /// act on the instances until it completes
    InProgress(Outcome),
}

// -----------------------------------------------------------------------------
// Preparation enumeration

#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Preparation {
    RemoveRestoreJob(String),
    RemoveRunners(Vec<String>),
    RemoveEndpoints(Vec<String>),
    Ready,
}

impl Preparation {
    pub fn observe(env: &RestoreEnv, instances: &Instances) -> Self {
        if let Some(job) = &env.job {
            return Self::RemoveRestoreJob(job.name_any());
        }

        if instances.is_running(naming::CONTAINER_DATABASE) {
            return Self::RemoveRunners(instances.runners().map(ResourceExt::name_any).collect());
        }

        if !env.endpoints.is_empty() {
            return Self::RemoveEndpoints(env.endpoints.iter().map(ResourceExt::name_any).collect());
        }

        Self::Ready
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::RemoveRestoreJob(_) => "removing restore job",
            Self::RemoveRunners(_) => "removing runners",
            Self::RemoveEndpoints(_) => "removing DCS",
            Self::Ready => "ready",
        }
    }
}

// -----------------------------------------------------------------------------
// Source enumeration

enum Source<'s> {
    Cluster(&'s ClusterDataSource),
    Cloud(&'s CloudDataSource),
}

impl<'s> Source<'s> {
    /// returns the hash of what the restore depends on, a change restarts it
    fn hash(&self) -> String {
        let mut parts = match self {
            Self::Cluster(source) => vec![source.cluster_name.as_str(), source.repo_name.as_str()],
            Self::Cloud(source) => vec![source.repo.name.as_str(), source.stanza.as_str()],
        };

        let options = match self {
            Self::Cluster(source) => &source.options,
            Self::Cloud(source) => &source.options,
        };
        parts.extend(options.iter().map(String::as_str));

        config::hash(&parts.join("\n"))
    }
}

// -----------------------------------------------------------------------------
// Plan structure

/// everything the restore job needs once the source has been resolved
#[derive(Clone, Debug, Default)]
struct Plan {
    config: String,
    projections: Vec<VolumeProjection>,
    ssh: Option<BTreeMap<String, ByteString>>,
    stanza: String,
    repo_index: String,
    options: Vec<String>,
    scheduling: PodSpec,
    resources: Option<ResourceRequirements>,
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the message explaining why the options could not be used
pub fn validate_options(options: &[String]) -> Result<(), String> {
    for option in FORBIDDEN_OPTIONS {
        if backup::has_option(options, option) {
            return Err(match option {
                "--repo" => "Option '--repo' is not allowed: please use the 'repoName' field instead.".to_string(),
                _ => format!("Option '{}' is not allowed: it is set by the restore itself", option),
            });
        }
    }

    Ok(())
}

/// returns the options of the restore command
pub fn restore_options(options: &[String], stanza: &str, pgdata: &str, repo_index: &str) -> Vec<String> {
    let mut opts = options.to_vec();

    opts.push(format!("--stanza={}", stanza));
    opts.push(format!("--pg1-path={}", pgdata));
    opts.push(format!("--repo={}", repo_index));

    if !backup::has_option(options, "--delta") {
        opts.push("--delta".into());
    }

    if backup::has_option(options, "--target") {
        opts.push("--target-action=promote".into());
    }

    opts
}

impl<'a, A: Api> Pass<'a, A> {
    // -------------------------------------------------------------------------
    // Observation

    /// returns what could conflict with a restore and mirror the restore job
    /// into the status
    async fn observe_restore_env(&mut self) -> Result<RestoreEnv, Error> {
        let mut env = RestoreEnv::default();

        for name in naming::membership_endpoints(&self.name) {
            if let Some(endpoints) = self.api().get::<Endpoints>(&self.namespace, &name).await? {
                env.endpoints.push(endpoints);
            }
        }

        let mut jobs: Vec<Job> = self
            .api()
            .list(&self.namespace, &naming::restore_selector(&self.name))
            .await?;

        if jobs.len() > 1 {
            return Err(Error::TooManyRestoreJobs(jobs.len()));
        }

        let job = match jobs.pop() {
            Some(job) => job,
            None => return Ok(env),
        };

        if let Some(status) = self
            .status
            .pgbackrest
            .as_mut()
            .and_then(|status| status.restore.as_mut())
        {
            backup::mirror(&job, status);
        }

        if backup::is_complete(&job) {
            self.set_condition(
                condition::POSTGRES_DATA_INITIALIZED,
                condition::STATUS_TRUE,
                "PGBackRestRestoreComplete",
                "pgBackRest restore completed successfully",
            );
            self.remove_condition(condition::RESTORE_PROGRESSING);

            // copied configuration is no longer needed
            let selector = naming::restore_selector(&self.name);
            let config_maps: Vec<ConfigMap> = self.api().list(&self.namespace, &selector).await?;
            for config_map in config_maps {
                self.delete::<ConfigMap>(&config_map.name_any(), PropagationPolicy::Background)
                    .await?;
            }

            let secrets: Vec<Secret> = self.api().list(&self.namespace, &selector).await?;
            for secret in secrets {
                self.delete::<Secret>(&secret.name_any(), PropagationPolicy::Background)
                    .await?;
            }
        } else if backup::is_failed(&job) {
            self.set_condition(
                condition::POSTGRES_DATA_INITIALIZED,
                condition::STATUS_FALSE,
                "PGBackRestRestoreFailed",
                "pgBackRest restore failed",
            );
        }

        env.job = Some(job);
        Ok(env)
    }

    // -------------------------------------------------------------------------
    // Data source

    /// initialize the data directory from the data source or restore the
    /// cluster in-place
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, instances)))]
    pub async fn reconcile_data_source(&mut self, instances: &Instances) -> Result<Initialization, Error> {
        let cluster = self.cluster;
        let env = self.observe_restore_env().await?;

        // ---------------------------------------------------------------------
        // Step 1: find what the data comes from

        let requested = cluster
            .annotations()
            .get(naming::ANNOTATION_RESTORE)
            .cloned()
            .unwrap_or_default();

        let in_place = cluster
            .pgbackrest()
            .and_then(|pgbackrest| pgbackrest.restore.as_ref())
            .filter(|restore| restore.enabled && !requested.is_empty());

        let bootstrap_id = format!("~bootstrap-{}", self.name);
        let data_source = cluster.spec.data_source.as_ref();
        let (id, source) = match (in_place, data_source) {
            (Some(restore), _) => (requested, Source::Cluster(&restore.source)),
            (None, Some(ds)) => match (&ds.postgres_cluster, &ds.pgbackrest) {
                (Some(source), _) => (bootstrap_id, Source::Cluster(source)),
                (None, Some(source)) => (bootstrap_id, Source::Cloud(source)),
                (None, None) => return Ok(Initialization::Complete),
            },
            (None, None) => return Ok(Initialization::Complete),
        };

        if in_place.is_none() && self.status.is_bootstrapped() {
            if !self.condition_is_true(condition::POSTGRES_DATA_INITIALIZED) {
                self.set_condition(
                    condition::POSTGRES_DATA_INITIALIZED,
                    condition::STATUS_TRUE,
                    "ClusterAlreadyBootstrapped",
                    "The cluster is already bootstrapped",
                );
            }

            return Ok(Initialization::Complete);
        }

        // ---------------------------------------------------------------------
        // Step 2: prepare the cluster while the restore is not ready to start

        let hash = source.hash();
        let progressing = condition::find(&self.status.conditions, condition::RESTORE_PROGRESSING)
            .filter(|c| c.status == condition::STATUS_TRUE)
            .map(|c| c.reason.to_owned());
        let restoring = progressing.is_some();
        let ready = progressing.as_deref() == Some(REASON_READY_FOR_RESTORE);

        let config_changed = env
            .job
            .as_ref()
            .map(|job| job.annotations().get(naming::ANNOTATION_CONFIG_HASH) != Some(&hash))
            .unwrap_or(false);
        let id_changed = self
            .status
            .pgbackrest
            .as_ref()
            .and_then(|status| status.restore.as_ref())
            .map(|restore| restore.id != id)
            .unwrap_or(true);

        if (restoring && (!ready || config_changed)) || id_changed {
            self.prepare_for_restore(&env, instances, &id).await?;
            return Ok(Initialization::InProgress(Outcome::requeue(REQUEUE_AFTER)));
        }

        if self.condition_is_true(condition::POSTGRES_DATA_INITIALIZED) {
            return Ok(Initialization::Complete);
        }

        // ---------------------------------------------------------------------
        // Step 3: resolve the source and run the restore

        let plan = match &source {
            Source::Cluster(source) => self.plan_from_cluster(source).await?,
            Source::Cloud(source) => self.plan_from_cloud(source).await,
        };

        if let Some(plan) = plan {
            self.restore(plan, &hash, env.job.as_ref()).await?;
        }

        Ok(Initialization::InProgress(Outcome::default()))
    }

    /// move the cluster one step closer to a state where the restore could
    /// start, the status is reset to the new restore
    async fn prepare_for_restore(
        &mut self,
        env: &RestoreEnv,
        instances: &Instances,
        id: &str,
    ) -> Result<(), Error> {
        let previous = self
            .status
            .pgbackrest
            .as_ref()
            .and_then(|status| status.restore.as_ref())
            .map(|restore| restore.id.to_owned());

        self.status.pgbackrest = Some(PgBackRestStatus {
            restore: Some(JobStatus {
                id: id.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });

        // the instance is chosen once per restore, runners disappear while
        // the cluster is prepared
        if previous.as_deref() != Some(id) || self.status.startup_instance.is_none() {
            let (instance, set) = self.startup_instance(instances)?;

            self.status.startup_instance = Some(instance);
            self.status.startup_instance_set = Some(set);
        }

        let preparation = Preparation::observe(env, instances);
        info!(
            namespace = &self.namespace,
            name = &self.name,
            id = id,
            step = preparation.describe(),
            "Prepare cluster for restore"
        );

        let resource = match &preparation {
            Preparation::RemoveRestoreJob(name) => {
                self.delete::<Job>(name, PropagationPolicy::Background).await?;
                preparation.describe()
            }
            Preparation::RemoveRunners(names) => {
                for name in names {
                    self.delete::<StatefulSet>(name, PropagationPolicy::Foreground)
                        .await?;
                }
                preparation.describe()
            }
            Preparation::RemoveEndpoints(names) => {
                for name in names {
                    self.delete::<Endpoints>(name, PropagationPolicy::Background)
                        .await?;
                }
                preparation.describe()
            }
            Preparation::Ready => {
                self.remove_condition(condition::POSTGRES_DATA_INITIALIZED);
                self.set_condition(
                    condition::RESTORE_PROGRESSING,
                    condition::STATUS_TRUE,
                    REASON_READY_FOR_RESTORE,
                    "Restoring cluster in-place",
                );

                // the restored database is a new one for those who follow it
                if let Some(patroni) = self.status.patroni.as_mut() {
                    patroni.system_identifier = None;
                }
                if let Some(pgbouncer) = self
                    .status
                    .proxy
                    .as_mut()
                    .and_then(|proxy| proxy.pgbouncer.as_mut())
                {
                    pgbouncer.postgresql_revision = None;
                }
                if let Some(monitoring) = self.status.monitoring.as_mut() {
                    monitoring.exporter_configuration = None;
                }

                return Ok(());
            }
        };

        self.set_condition(
            condition::RESTORE_PROGRESSING,
            condition::STATUS_TRUE,
            "RestoreInPlaceRequested",
            &format!("Preparing cluster to restore in-place: {}", resource),
        );

        Ok(())
    }

    /// returns the instance and instance set the restore writes to: the
    /// primary, then any instance with a runner, then the first instance the
    /// first set would get
    fn startup_instance(&self, instances: &Instances) -> Result<(String, String), Error> {
        let first_set = self.cluster.spec.instances.first().map(|set| set.name.to_owned());

        let observed = instances
            .primary()
            .or_else(|| instances.instances.iter().find(|i| i.runner.is_some()));

        if let Some(instance) = observed {
            let set = instance.set.to_owned().or(first_set).ok_or_else(|| {
                Error::StartupInstance(format!("instance '{}' has no instance set", instance.name))
            })?;

            return Ok((instance.name.to_owned(), set));
        }

        match first_set {
            Some(set) => Ok((naming::default_instance(&self.name, &set), set)),
            None => Err(Error::StartupInstance(
                "the cluster does not declare any instance set".into(),
            )),
        }
    }

    // -------------------------------------------------------------------------
    // Sources

    async fn plan_from_cluster(&mut self, source: &ClusterDataSource) -> Result<Option<Plan>, Error> {
        let name = if source.cluster_name.is_empty() {
            self.name.to_owned()
        } else {
            source.cluster_name.to_owned()
        };
        let namespace = source
            .cluster_namespace
            .to_owned()
            .unwrap_or_else(|| self.namespace.to_owned());
        let same = name == self.name && namespace == self.namespace;

        let cluster = if same {
            self.cluster.to_owned()
        } else {
            match self.api().get::<PostgresCluster>(&namespace, &name).await? {
                Some(cluster) => cluster,
                None => {
                    self.invalid_data_source(&format!("PostgresCluster \"{}\" does not exist", name))
                        .await;
                    return Ok(None);
                }
            }
        };

        let pgbackrest = cluster.pgbackrest().cloned().unwrap_or_default();
        let repo = match pgbackrest.repo(&source.repo_name) {
            Some(repo) => repo.to_owned(),
            None => {
                self.invalid_data_source(&format!(
                    "PostgresCluster \"{}\" does not have a repo named \"{}\" defined",
                    name, source.repo_name
                ))
                .await;
                return Ok(None);
            }
        };

        if let Err(message) = validate_options(&source.options) {
            self.invalid_data_source(&message).await;
            return Ok(None);
        }

        // ---------------------------------------------------------------------
        // configuration of the source cluster

        let config_name = naming::config(&name);
        let config = self
            .api()
            .get::<ConfigMap>(&namespace, &config_name)
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(naming::CONFIG_INSTANCE))
            .ok_or_else(|| {
                api::Error::NotFound(namespace.to_owned(), config_name, "ConfigMap".into())
            })?;

        let projections = if same {
            pgbackrest.configuration.to_owned()
        } else {
            self.copy_configuration(&cluster).await?
        };

        let ssh = if repo.volume.is_some() {
            let secret_name = naming::ssh_secret(&name);
            let mut data = self
                .api()
                .get::<Secret>(&namespace, &secret_name)
                .await?
                .and_then(|secret| secret.data)
                .ok_or_else(|| {
                    api::Error::NotFound(namespace.to_owned(), secret_name, "Secret".into())
                })?;

            data.insert(
                naming::SSH_CONFIG.to_string(),
                ByteString(config::ssh_config().into_bytes()),
            );
            Some(data)
        } else {
            None
        };

        Ok(Some(Plan {
            config,
            projections,
            ssh,
            stanza: naming::STANZA.to_string(),
            repo_index: repo.index().to_string(),
            options: source.options.to_owned(),
            scheduling: PodSpec {
                affinity: source.affinity.to_owned(),
                tolerations: Some(source.tolerations.to_owned()).filter(|t| !t.is_empty()),
                priority_class_name: source.priority_class_name.to_owned(),
                ..Default::default()
            },
            resources: source.resources.to_owned(),
        }))
    }

    async fn plan_from_cloud(&self, source: &CloudDataSource) -> Option<Plan> {
        if let Err(message) = validate_options(&source.options) {
            self.invalid_data_source(&message).await;
            return None;
        }

        let global = config::global(&[source.repo.to_owned()], &source.global, None);
        let config = config::ini(&[
            ("global", &global),
            (source.stanza.as_str(), &config::local_stanza(self.cluster)),
        ]);

        Some(Plan {
            config,
            projections: source.configuration.to_owned(),
            ssh: None,
            stanza: source.stanza.to_owned(),
            repo_index: source.repo.index().to_string(),
            options: source.options.to_owned(),
            scheduling: PodSpec {
                affinity: source.affinity.to_owned(),
                tolerations: Some(source.tolerations.to_owned()).filter(|t| !t.is_empty()),
                priority_class_name: source.priority_class_name.to_owned(),
                ..Default::default()
            },
            resources: source.resources.to_owned(),
        })
    }

    async fn invalid_data_source(&self, message: &str) {
        self.record(&Level::Warning, &Reason::InvalidDataSource, message)
            .await;
    }

    /// copy the configuration projected by the source cluster into the
    /// namespace of the cluster, absent optional items are skipped
    pub async fn copy_configuration(&self, source: &PostgresCluster) -> Result<Vec<VolumeProjection>, Error> {
        let (namespace, name) = resource::namespaced_name(source);
        let configuration = source
            .pgbackrest()
            .map(|pgbackrest| pgbackrest.configuration.to_owned())
            .unwrap_or_default();

        let mut projections = vec![];
        for (index, projection) in configuration.into_iter().enumerate() {
            let copy = naming::restore_copy(&name, index);

            if let Some(secret) = projection.secret {
                let origin = secret.name.to_owned().unwrap_or_default();

                match self.api().get::<Secret>(&namespace, &origin).await? {
                    Some(found) => {
                        self.api()
                            .apply(&Secret {
                                metadata: self.metadata(&copy, naming::restore_labels(&self.name)),
                                data: found.data,
                                type_: found.type_,
                                ..Default::default()
                            })
                            .await?;

                        projections.push(VolumeProjection {
                            secret: Some(SecretProjection {
                                name: Some(copy.to_owned()),
                                ..secret
                            }),
                            ..Default::default()
                        });
                    }
                    None if secret.optional.unwrap_or(false) => {}
                    None => {
                        return Err(api::Error::NotFound(namespace, origin, "Secret".into()).into())
                    }
                }
            }

            if let Some(config_map) = projection.config_map {
                let origin = config_map.name.to_owned().unwrap_or_default();

                match self.api().get::<ConfigMap>(&namespace, &origin).await? {
                    Some(found) => {
                        self.api()
                            .apply(&ConfigMap {
                                metadata: self.metadata(&copy, naming::restore_labels(&self.name)),
                                data: found.data,
                                binary_data: found.binary_data,
                                ..Default::default()
                            })
                            .await?;

                        projections.push(VolumeProjection {
                            config_map: Some(ConfigMapProjection {
                                name: Some(copy.to_owned()),
                                ..config_map
                            }),
                            ..Default::default()
                        });
                    }
                    None if config_map.optional.unwrap_or(false) => {}
                    None => {
                        return Err(
                            api::Error::NotFound(namespace, origin, "ConfigMap".into()).into()
                        )
                    }
                }
            }
        }

        Ok(projections)
    }

    // -------------------------------------------------------------------------
    // Restore job

    async fn restore(&mut self, plan: Plan, hash: &str, existing: Option<&Job>) -> Result<(), Error> {
        let instance = self.status.startup_instance.to_owned().ok_or_else(|| {
            Error::StartupInstance("no startup instance has been chosen".into())
        })?;
        let set_name = self.status.startup_instance_set.to_owned().unwrap_or_default();
        let set = self
            .cluster
            .spec
            .instances
            .iter()
            .find(|set| set.name == set_name)
            .ok_or_else(|| {
                Error::StartupInstance(format!("instance set '{}' is not declared", set_name))
            })?;

        let labels = naming::restore_labels(&self.name);
        let config_name = naming::restore_config(&self.name);

        // ---------------------------------------------------------------------
        // Step 1: configuration the restore reads

        self.api()
            .apply(&ConfigMap {
                metadata: self.metadata(&config_name, labels.to_owned()),
                data: Some(BTreeMap::from([(
                    naming::CONFIG_INSTANCE.to_string(),
                    plan.config.to_owned(),
                )])),
                ..Default::default()
            })
            .await?;

        if let Some(ssh) = &plan.ssh {
            self.api()
                .apply(&Secret {
                    metadata: self.metadata(&config_name, labels.to_owned()),
                    data: Some(ssh.to_owned()),
                    ..Default::default()
                })
                .await?;
        }

        // ---------------------------------------------------------------------
        // Step 2: volume of the data directory

        let volume = naming::instance_data_volume(&instance);
        self.api()
            .apply(&PersistentVolumeClaim {
                metadata: self.metadata(
                    &volume,
                    naming::instance_data_labels(&self.name, &set.name, &instance),
                ),
                spec: Some(set.data_volume_claim_spec.to_owned()),
                ..Default::default()
            })
            .await?;

        // ---------------------------------------------------------------------
        // Step 3: restore job

        let pgdata = config::pgdata(self.cluster.spec.postgres_version);
        let options = restore_options(&plan.options, &plan.stanza, &pgdata, &plan.repo_index);

        let mut job_labels = labels.to_owned();
        job_labels.insert(naming::LABEL_STARTUP_INSTANCE.into(), instance.to_owned());

        let mut metadata = self.metadata(&naming::restore_job(&self.name), job_labels.to_owned());
        metadata.annotations = Some(BTreeMap::from([(
            naming::ANNOTATION_CONFIG_HASH.to_string(),
            hash.to_string(),
        )]));

        let mut sources = vec![VolumeProjection {
            config_map: Some(ConfigMapProjection {
                name: Some(config_name.to_owned()),
                items: Some(vec![KeyToPath {
                    key: naming::CONFIG_INSTANCE.into(),
                    path: naming::CONFIG_INSTANCE.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }];
        sources.extend(plan.projections.iter().cloned());

        let mut volumes = vec![
            Volume {
                name: "postgres-data".into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: volume,
                    read_only: None,
                }),
                ..Default::default()
            },
            Volume {
                name: "pgbackrest-config".into(),
                projected: Some(ProjectedVolumeSource {
                    sources: Some(sources),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        let mut mounts = vec![
            VolumeMount {
                name: "postgres-data".into(),
                mount_path: "/pgdata".into(),
                ..Default::default()
            },
            VolumeMount {
                name: "pgbackrest-config".into(),
                mount_path: naming::CONFIG_DIRECTORY.into(),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        if plan.ssh.is_some() {
            volumes.push(Volume {
                name: "ssh".into(),
                projected: Some(ProjectedVolumeSource {
                    sources: Some(vec![VolumeProjection {
                        secret: Some(SecretProjection {
                            name: Some(config_name.to_owned()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    default_mode: Some(0o040),
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "ssh".into(),
                mount_path: SSH_DIRECTORY.into(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let job = Job {
            metadata,
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(job_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: CONTAINER_RESTORE.into(),
                            image: Some(self.postgres_image()),
                            command: Some(vec![
                                "bash".into(),
                                "-ceu".into(),
                                "--".into(),
                                RESTORE_SCRIPT.into(),
                                CONTAINER_RESTORE.into(),
                                pgdata,
                                options.join(" "),
                            ]),
                            env: Some(vec![EnvVar {
                                name: "PGHOST".into(),
                                value: Some("/tmp".into()),
                                ..Default::default()
                            }]),
                            resources: plan.resources,
                            volume_mounts: Some(mounts),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        restart_policy: Some("Never".into()),
                        automount_service_account_token: Some(false),
                        enable_service_links: Some(false),
                        security_context: Some(PodSecurityContext {
                            fs_group: Some(26),
                            run_as_non_root: Some(true),
                            ..Default::default()
                        }),
                        ..plan.scheduling
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        self.api().apply(&job).await?;

        if existing.is_none() {
            self.job_created("restore");
        }

        Ok(())
    }
}
