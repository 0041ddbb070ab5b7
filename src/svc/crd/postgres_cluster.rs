//! # PostgresCluster custom resource
//!
//! This module provide the postgres cluster custom resource and its
//! definition, restricted to what the backup and restore machinery reads and
//! writes

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Affinity, PersistentVolumeClaimSpec, ResourceRequirements, Toleration, VolumeProjection,
    },
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_PORT: i32 = 5432;

// -----------------------------------------------------------------------------
// InstanceSet structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct InstanceSet {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "replicas", default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(rename = "dataVolumeClaimSpec")]
    pub data_volume_claim_spec: PersistentVolumeClaimSpec,
}

// -----------------------------------------------------------------------------
// Repository structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct RepoVolume {
    #[serde(rename = "volumeClaimSpec")]
    pub volume_claim_spec: PersistentVolumeClaimSpec,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct S3 {
    #[serde(rename = "bucket")]
    pub bucket: String,
    #[serde(rename = "endpoint")]
    pub endpoint: String,
    #[serde(rename = "region")]
    pub region: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Gcs {
    #[serde(rename = "bucket")]
    pub bucket: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Azure {
    #[serde(rename = "container")]
    pub container: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Schedules {
    #[serde(rename = "full", default, skip_serializing_if = "Option::is_none")]
    pub full: Option<String>,
    #[serde(rename = "differential", default, skip_serializing_if = "Option::is_none")]
    pub differential: Option<String>,
    #[serde(rename = "incremental", default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Repo {
    /// name of the repository, in the form 'repoN'
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "volume", default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<RepoVolume>,
    #[serde(rename = "s3", default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3>,
    #[serde(rename = "gcs", default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<Gcs>,
    #[serde(rename = "azure", default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<Azure>,
    #[serde(rename = "schedules", default, skip_serializing_if = "Option::is_none")]
    pub schedules: Option<Schedules>,
}

impl Repo {
    /// returns the index of the repository as understood by pgbackrest
    pub fn index(&self) -> &str {
        self.name.trim_start_matches("repo")
    }

    pub fn is_cloud(&self) -> bool {
        self.volume.is_none() && (self.s3.is_some() || self.gcs.is_some() || self.azure.is_some())
    }
}

// -----------------------------------------------------------------------------
// Backup structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct RepoHost {
    #[serde(rename = "affinity", default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(rename = "tolerations", default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(rename = "priorityClassName", default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(rename = "resources", default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ManualBackup {
    #[serde(rename = "repoName")]
    pub repo_name: String,
    #[serde(rename = "options", default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct BackupJobs {
    #[serde(rename = "resources", default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "priorityClassName", default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(
        rename = "ttlSecondsAfterFinished",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl_seconds_after_finished: Option<i32>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Restore {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub source: ClusterDataSource,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PgBackRest {
    #[serde(rename = "image", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "configuration", default, skip_serializing_if = "Vec::is_empty")]
    pub configuration: Vec<VolumeProjection>,
    #[serde(rename = "global", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global: BTreeMap<String, String>,
    #[serde(rename = "repoHost", default, skip_serializing_if = "Option::is_none")]
    pub repo_host: Option<RepoHost>,
    #[serde(rename = "repos", default)]
    pub repos: Vec<Repo>,
    #[serde(rename = "manual", default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<ManualBackup>,
    #[serde(rename = "restore", default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<Restore>,
    #[serde(rename = "jobs", default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<BackupJobs>,
}

impl PgBackRest {
    pub fn repo(&self, name: &str) -> Option<&Repo> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    /// the first declared repository is the one holding the backup used to
    /// create replicas
    pub fn replica_create_repo(&self) -> Option<&Repo> {
        self.repos.first()
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Backups {
    #[serde(rename = "pgbackrest")]
    pub pgbackrest: PgBackRest,
}

// -----------------------------------------------------------------------------
// DataSource structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct ClusterDataSource {
    #[serde(rename = "clusterName", default)]
    pub cluster_name: String,
    #[serde(rename = "clusterNamespace", default, skip_serializing_if = "Option::is_none")]
    pub cluster_namespace: Option<String>,
    #[serde(rename = "repoName", default)]
    pub repo_name: String,
    #[serde(rename = "options", default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(rename = "resources", default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "affinity", default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(rename = "tolerations", default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(rename = "priorityClassName", default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct CloudDataSource {
    #[serde(rename = "configuration", default, skip_serializing_if = "Vec::is_empty")]
    pub configuration: Vec<VolumeProjection>,
    #[serde(rename = "stanza", default = "default_stanza")]
    pub stanza: String,
    #[serde(rename = "repo")]
    pub repo: Repo,
    #[serde(rename = "global", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global: BTreeMap<String, String>,
    #[serde(rename = "options", default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(rename = "resources", default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "affinity", default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(rename = "tolerations", default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(rename = "priorityClassName", default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

fn default_stanza() -> String {
    "db".to_string()
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct DataSource {
    #[serde(rename = "postgresCluster", default, skip_serializing_if = "Option::is_none")]
    pub postgres_cluster: Option<ClusterDataSource>,
    #[serde(rename = "pgbackrest", default, skip_serializing_if = "Option::is_none")]
    pub pgbackrest: Option<CloudDataSource>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Standby {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "repoName", default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "postgres-operator.io")]
#[kube(version = "v1beta1")]
#[kube(kind = "PostgresCluster")]
#[kube(singular = "postgrescluster")]
#[kube(plural = "postgresclusters")]
#[kube(shortname = "pgc")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "postgresVersion")]
    pub postgres_version: i32,
    #[serde(rename = "port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(rename = "image", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "instances", default)]
    pub instances: Vec<InstanceSet>,
    #[serde(rename = "backups", default, skip_serializing_if = "Option::is_none")]
    pub backups: Option<Backups>,
    #[serde(rename = "dataSource", default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<DataSource>,
    #[serde(rename = "shutdown", default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<bool>,
    #[serde(rename = "standby", default, skip_serializing_if = "Option::is_none")]
    pub standby: Option<Standby>,
}

// -----------------------------------------------------------------------------
// Status structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RepoHostStatus {
    #[serde(rename = "ready", default)]
    pub ready: bool,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RepoStatus {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "bound", default)]
    pub bound: bool,
    #[serde(rename = "volume", default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(rename = "stanzaCreated", default)]
    pub stanza_created: bool,
    #[serde(rename = "replicaCreateBackupComplete", default)]
    pub replica_create_backup_complete: bool,
    #[serde(rename = "repoOptionsHash", default, skip_serializing_if = "Option::is_none")]
    pub repo_options_hash: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct JobStatus {
    #[serde(rename = "id", default)]
    pub id: String,
    #[serde(rename = "finished", default)]
    pub finished: bool,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(rename = "completionTime", default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(rename = "active", default)]
    pub active: i32,
    #[serde(rename = "succeeded", default)]
    pub succeeded: i32,
    #[serde(rename = "failed", default)]
    pub failed: i32,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ScheduledBackupStatus {
    #[serde(rename = "cronJobName", default)]
    pub cron_job_name: String,
    #[serde(rename = "repo", default)]
    pub repo: String,
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(rename = "completionTime", default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(rename = "active", default)]
    pub active: i32,
    #[serde(rename = "succeeded", default)]
    pub succeeded: i32,
    #[serde(rename = "failed", default)]
    pub failed: i32,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct PgBackRestStatus {
    #[serde(rename = "repoHost", default, skip_serializing_if = "Option::is_none")]
    pub repo_host: Option<RepoHostStatus>,
    #[serde(rename = "repos", default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoStatus>,
    #[serde(rename = "manualBackup", default, skip_serializing_if = "Option::is_none")]
    pub manual_backup: Option<JobStatus>,
    #[serde(rename = "scheduledBackups", default, skip_serializing_if = "Vec::is_empty")]
    pub scheduled_backups: Vec<ScheduledBackupStatus>,
    #[serde(rename = "restore", default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<JobStatus>,
    /// configuration hash the stanzas have been created with
    #[serde(rename = "stanzaConfigHash", default, skip_serializing_if = "Option::is_none")]
    pub stanza_config_hash: Option<String>,
}

impl PgBackRestStatus {
    pub fn repo(&self, name: &str) -> Option<&RepoStatus> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    pub fn repo_mut(&mut self, name: &str) -> Option<&mut RepoStatus> {
        self.repos.iter_mut().find(|repo| repo.name == name)
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct PatroniStatus {
    #[serde(rename = "systemIdentifier", default, skip_serializing_if = "Option::is_none")]
    pub system_identifier: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct PgBouncerStatus {
    #[serde(rename = "postgreSQLRevision", default, skip_serializing_if = "Option::is_none")]
    pub postgresql_revision: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ProxyStatus {
    #[serde(rename = "pgBouncer", default, skip_serializing_if = "Option::is_none")]
    pub pgbouncer: Option<PgBouncerStatus>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct MonitoringStatus {
    #[serde(
        rename = "exporterConfiguration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exporter_configuration: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(rename = "observedGeneration", default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(rename = "pgbackrest", default, skip_serializing_if = "Option::is_none")]
    pub pgbackrest: Option<PgBackRestStatus>,
    #[serde(rename = "startupInstance", default, skip_serializing_if = "Option::is_none")]
    pub startup_instance: Option<String>,
    #[serde(rename = "startupInstanceSet", default, skip_serializing_if = "Option::is_none")]
    pub startup_instance_set: Option<String>,
    #[serde(rename = "patroni", default, skip_serializing_if = "Option::is_none")]
    pub patroni: Option<PatroniStatus>,
    #[serde(rename = "proxy", default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyStatus>,
    #[serde(rename = "monitoring", default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringStatus>,
}

// -----------------------------------------------------------------------------
// PostgresCluster implementation

impl PostgresCluster {
    pub fn port(&self) -> i32 {
        self.spec.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn pgbackrest(&self) -> Option<&PgBackRest> {
        self.spec.backups.as_ref().map(|backups| &backups.pgbackrest)
    }

    pub fn is_shutdown(&self) -> bool {
        self.spec.shutdown.unwrap_or(false)
    }

    pub fn is_standby(&self) -> bool {
        self.spec
            .standby
            .as_ref()
            .map(|standby| standby.enabled)
            .unwrap_or(false)
    }

    /// returns if a dedicated repository host is needed, which is the case
    /// as soon as one repository is backed by a volume
    pub fn dedicated_repo_host_enabled(&self) -> bool {
        self.pgbackrest()
            .map(|pgbackrest| pgbackrest.repos.iter().any(|repo| repo.volume.is_some()))
            .unwrap_or(false)
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.status
            .as_ref()
            .map(Status::is_bootstrapped)
            .unwrap_or(false)
    }
}

impl Status {
    /// returns if the database has been initialized at least once
    pub fn is_bootstrapped(&self) -> bool {
        self.patroni
            .as_ref()
            .and_then(|patroni| patroni.system_identifier.as_ref())
            .map(|id| !id.is_empty())
            .unwrap_or(false)
    }
}
