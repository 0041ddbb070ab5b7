//! # Naming module
//!
//! This module provide the deterministic names, labels and selectors of the
//! resources managed for a postgres cluster

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use sha2::{Digest, Sha256};

use crate::svc::k8s::selector::Selector;

// -----------------------------------------------------------------------------
// Labels

pub const LABEL_CLUSTER: &str = "postgres-operator.io/cluster";
pub const LABEL_INSTANCE_SET: &str = "postgres-operator.io/instance-set";
pub const LABEL_INSTANCE: &str = "postgres-operator.io/instance";
pub const LABEL_ROLE: &str = "postgres-operator.io/role";
pub const LABEL_DATA: &str = "postgres-operator.io/data";
pub const LABEL_STARTUP_INSTANCE: &str = "postgres-operator.io/startup-instance";

pub const LABEL_PGBACKREST: &str = "postgres-operator.io/pgbackrest";
pub const LABEL_REPO: &str = "postgres-operator.io/pgbackrest-repo";
pub const LABEL_REPO_VOLUME: &str = "postgres-operator.io/pgbackrest-volume";
pub const LABEL_BACKUP: &str = "postgres-operator.io/pgbackrest-backup";
pub const LABEL_CRONJOB: &str = "postgres-operator.io/pgbackrest-cronjob";
pub const LABEL_DEDICATED: &str = "postgres-operator.io/pgbackrest-dedicated";
pub const LABEL_CONFIG: &str = "postgres-operator.io/pgbackrest-config";
pub const LABEL_RESTORE: &str = "postgres-operator.io/pgbackrest-restore";

pub const ROLE_PRIMARY: &str = "master";
pub const DATA_POSTGRES: &str = "postgres";
pub const DATA_PGBACKREST: &str = "pgbackrest";

// -----------------------------------------------------------------------------
// Annotations

pub const ANNOTATION_BACKUP: &str = "postgres-operator.io/pgbackrest-backup";
pub const ANNOTATION_RESTORE: &str = "postgres-operator.io/pgbackrest-restore";
pub const ANNOTATION_CONFIG_HASH: &str = "postgres-operator.io/pgbackrest-config-hash";
pub const ANNOTATION_AUTHORIZE_REMOVAL: &str = "postgres-operator.io/authorize-backup-removal";

// -----------------------------------------------------------------------------
// Containers and files

pub const CONTAINER_DATABASE: &str = "database";
pub const CONTAINER_PGBACKREST: &str = "pgbackrest";
pub const CONFIG_INSTANCE: &str = "pgbackrest_instance.conf";
pub const CONFIG_REPO_HOST: &str = "pgbackrest_repo.conf";
pub const CONFIG_HASH: &str = "config-hash";
pub const CONFIG_DIRECTORY: &str = "/etc/pgbackrest/conf.d";
pub const SSH_CONFIG: &str = "ssh_config";
pub const SSHD_CONFIG: &str = "sshd_config";
pub const SSH_PRIVATE_KEY: &str = "id_ecdsa";
pub const SSH_PUBLIC_KEY: &str = "id_ecdsa.pub";
pub const SSH_KNOWN_HOSTS: &str = "ssh_known_hosts";
pub const STANZA: &str = "db";

// -----------------------------------------------------------------------------
// BackupKind enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum BackupKind {
    ReplicaCreate,
    Manual,
}

impl Display for BackupKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::ReplicaCreate => write!(f, "replica-create"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

// -----------------------------------------------------------------------------
// ScheduleKind enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum ScheduleKind {
    Full,
    Differential,
    Incremental,
}

impl Display for ScheduleKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Differential => write!(f, "diff"),
            Self::Incremental => write!(f, "incr"),
        }
    }
}

impl ScheduleKind {
    pub const ALL: [ScheduleKind; 3] = [Self::Full, Self::Differential, Self::Incremental];
}

// -----------------------------------------------------------------------------
// Names

/// returns the leading characters of the hexadecimal sha256 digest of the
/// given parts
/// number of hexadecimal characters of the digest in backup job names
pub const JOB_DIGEST_LENGTH: usize = 10;

pub fn digest(parts: &[&str], len: usize) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }

    let mut hash = hex::encode(hasher.finalize());
    hash.truncate(len);
    hash
}

pub fn repo_host(cluster: &str) -> String {
    format!("{}-repo-host", cluster)
}

pub fn repo_volume(cluster: &str, repo: &str) -> String {
    format!("{}-{}", cluster, repo)
}

pub fn config(cluster: &str) -> String {
    format!("{}-pgbackrest-config", cluster)
}

pub fn ssh_config(cluster: &str) -> String {
    format!("{}-ssh-config", cluster)
}

pub fn ssh_secret(cluster: &str) -> String {
    format!("{}-ssh", cluster)
}

pub fn rbac(cluster: &str) -> String {
    format!("{}-pgbackrest", cluster)
}

/// returns the name of the backup job for the repository, a distinct
/// identifier yields a distinct name
pub fn backup_job(cluster: &str, repo: &str, kind: BackupKind, id: &str) -> String {
    format!(
        "{}-backup-{}",
        cluster,
        digest(&[repo, &kind.to_string(), id], JOB_DIGEST_LENGTH)
    )
}

pub fn cronjob(cluster: &str, repo: &str, kind: ScheduleKind) -> String {
    format!("{}-{}-{}", cluster, repo, kind)
}

pub fn restore_job(cluster: &str) -> String {
    format!("{}-pgbackrest-restore", cluster)
}

pub fn restore_config(cluster: &str) -> String {
    format!("{}-pgbackrest-restore-config", cluster)
}

pub fn restore_copy(source: &str, index: usize) -> String {
    format!("{}-restorecopy-{}", source, index)
}

pub fn pods_service(cluster: &str) -> String {
    format!("{}-pods", cluster)
}

/// returns the names of the endpoints used by patroni to store the cluster
/// membership, the leader, the configuration and the failover trigger
pub fn membership_endpoints(cluster: &str) -> [String; 3] {
    [
        format!("{}-ha", cluster),
        format!("{}-ha-config", cluster),
        format!("{}-ha-failover", cluster),
    ]
}

pub fn instance_data_volume(instance: &str) -> String {
    format!("{}-pgdata", instance)
}

pub fn instance_pod(instance: &str) -> String {
    format!("{}-0", instance)
}

/// returns the name the first instance of the set gets when the cluster has
/// never run
pub fn default_instance(cluster: &str, set: &str) -> String {
    format!("{}-{}-{}", cluster, set, digest(&[cluster, set], 4))
}

/// returns the fully qualified dns name of the first pod of the statefulset
pub fn pod_fqdn(statefulset: &str, cluster: &str, namespace: &str) -> String {
    format!(
        "{}.{}.{}.svc.cluster.local",
        instance_pod(statefulset),
        pods_service(cluster),
        namespace
    )
}

// -----------------------------------------------------------------------------
// Label sets

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    labels(&[(LABEL_CLUSTER, cluster)])
}

pub fn pgbackrest_labels(cluster: &str) -> BTreeMap<String, String> {
    labels(&[(LABEL_CLUSTER, cluster), (LABEL_PGBACKREST, "")])
}

pub fn repo_host_labels(cluster: &str) -> BTreeMap<String, String> {
    labels(&[
        (LABEL_CLUSTER, cluster),
        (LABEL_PGBACKREST, ""),
        (LABEL_DEDICATED, ""),
    ])
}

pub fn repo_volume_labels(cluster: &str, repo: &str) -> BTreeMap<String, String> {
    labels(&[
        (LABEL_CLUSTER, cluster),
        (LABEL_PGBACKREST, ""),
        (LABEL_REPO, repo),
        (LABEL_REPO_VOLUME, ""),
    ])
}

pub fn config_labels(cluster: &str) -> BTreeMap<String, String> {
    labels(&[
        (LABEL_CLUSTER, cluster),
        (LABEL_PGBACKREST, ""),
        (LABEL_CONFIG, ""),
    ])
}

pub fn backup_job_labels(cluster: &str, repo: &str, kind: BackupKind) -> BTreeMap<String, String> {
    labels(&[
        (LABEL_CLUSTER, cluster),
        (LABEL_PGBACKREST, ""),
        (LABEL_REPO, repo),
        (LABEL_BACKUP, &kind.to_string()),
    ])
}

pub fn cronjob_labels(cluster: &str, repo: &str, kind: ScheduleKind) -> BTreeMap<String, String> {
    labels(&[
        (LABEL_CLUSTER, cluster),
        (LABEL_PGBACKREST, ""),
        (LABEL_REPO, repo),
        (LABEL_CRONJOB, &kind.to_string()),
    ])
}

/// labels of the volume holding the data directory of an instance
pub fn instance_data_labels(cluster: &str, set: &str, instance: &str) -> BTreeMap<String, String> {
    labels(&[
        (LABEL_CLUSTER, cluster),
        (LABEL_INSTANCE_SET, set),
        (LABEL_INSTANCE, instance),
        (LABEL_DATA, DATA_POSTGRES),
    ])
}

pub fn restore_labels(cluster: &str) -> BTreeMap<String, String> {
    labels(&[
        (LABEL_CLUSTER, cluster),
        (LABEL_PGBACKREST, ""),
        (LABEL_RESTORE, ""),
    ])
}

// -----------------------------------------------------------------------------
// Selectors

/// selects every resource related to the backup machinery of the cluster
pub fn pgbackrest_selector(cluster: &str) -> Selector {
    Selector::default()
        .equals(LABEL_CLUSTER, cluster)
        .exists(LABEL_PGBACKREST)
}

pub fn repo_host_selector(cluster: &str) -> Selector {
    pgbackrest_selector(cluster).exists(LABEL_DEDICATED)
}

pub fn restore_selector(cluster: &str) -> Selector {
    Selector::default()
        .equals(LABEL_CLUSTER, cluster)
        .exists(LABEL_RESTORE)
}

pub fn instance_selector(cluster: &str) -> Selector {
    Selector::default()
        .equals(LABEL_CLUSTER, cluster)
        .exists(LABEL_INSTANCE)
}

pub fn cluster_selector(cluster: &str) -> Selector {
    Selector::default().equals(LABEL_CLUSTER, cluster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_job_names_are_stable_and_distinct() {
        let a = backup_job("hippo", "repo1", BackupKind::Manual, "a");

        assert_eq!(a, backup_job("hippo", "repo1", BackupKind::Manual, "a"));
        assert_ne!(a, backup_job("hippo", "repo1", BackupKind::Manual, "b"));
        assert_ne!(a, backup_job("hippo", "repo1", BackupKind::ReplicaCreate, "a"));
        assert!(a.starts_with("hippo-backup-"));
        assert_eq!("hippo-backup-".len() + JOB_DIGEST_LENGTH, a.len());
    }

    #[test]
    fn render_names() {
        assert_eq!("hippo-repo1-incr", cronjob("hippo", "repo1", ScheduleKind::Incremental));
        assert_eq!(
            "hippo-repo-host-0.hippo-pods.db.svc.cluster.local",
            pod_fqdn(&repo_host("hippo"), "hippo", "db")
        );
        assert_eq!("source-restorecopy-1", restore_copy("source", 1));
    }
}
