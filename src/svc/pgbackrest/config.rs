//! # Configuration module
//!
//! This module provide the pgbackrest configuration files of a cluster, the
//! ssh material used between instances and the repository host, and the
//! rbac objects used by backup jobs

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        core::v1::{ConfigMap, Secret, ServiceAccount},
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    ByteString,
};
use kube::{Resource, ResourceExt};
use tracing::debug;

use crate::svc::{
    crd::postgres_cluster::{PgBackRest, PostgresCluster, Repo},
    k8s::api::Api,
    pgbackrest::{
        discovery::RepoResources,
        instance::Instances,
        naming,
        repo_host::{REPO_DIRECTORY, SSH_DIRECTORY, SSH_PORT},
        Error, Pass,
    },
    pki::SshKeyPair,
};

// -----------------------------------------------------------------------------
// Constants

pub const HASH_LENGTH: usize = 16;
pub const SOCKET_DIRECTORY: &str = "/tmp/postgres";
pub const LOG_DIRECTORY: &str = "/tmp";

// -----------------------------------------------------------------------------
// Helpers functions

pub fn pgdata(postgres_version: i32) -> String {
    format!("/pgdata/pg{}", postgres_version)
}

/// returns the ini document made of the given sections, keys are sorted
pub fn ini(sections: &[(&str, &BTreeMap<String, String>)]) -> String {
    sections
        .iter()
        .map(|(name, keys)| {
            let mut section = format!("[{}]\n", name);
            for (key, value) in keys.iter() {
                section.push_str(&format!("{} = {}\n", key, value));
            }
            section
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// returns the options describing the storage of the repository
pub fn repo_options(repo: &Repo) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    let prefix = &repo.name;

    options.insert(format!("{}-path", prefix), format!("{}/{}", REPO_DIRECTORY, repo.name));
    if let Some(s3) = &repo.s3 {
        options.insert(format!("{}-type", prefix), "s3".into());
        options.insert(format!("{}-s3-bucket", prefix), s3.bucket.to_owned());
        options.insert(format!("{}-s3-endpoint", prefix), s3.endpoint.to_owned());
        options.insert(format!("{}-s3-region", prefix), s3.region.to_owned());
    } else if let Some(gcs) = &repo.gcs {
        options.insert(format!("{}-type", prefix), "gcs".into());
        options.insert(format!("{}-gcs-bucket", prefix), gcs.bucket.to_owned());
    } else if let Some(azure) = &repo.azure {
        options.insert(format!("{}-type", prefix), "azure".into());
        options.insert(format!("{}-azure-container", prefix), azure.container.to_owned());
    }

    options
}

/// returns the hash of the options of every cloud repository by name
pub fn repo_options_hashes(pgbackrest: &PgBackRest) -> BTreeMap<String, String> {
    pgbackrest
        .repos
        .iter()
        .filter(|repo| repo.is_cloud())
        .map(|repo| {
            let lines: Vec<String> = repo_options(repo)
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            let parts: Vec<&str> = lines.iter().map(String::as_str).collect();

            (repo.name.to_owned(), naming::digest(&parts, HASH_LENGTH))
        })
        .collect()
}

/// returns the global section shared by every configuration file, user
/// provided keys take precedence
pub fn global(
    repos: &[Repo],
    overrides: &BTreeMap<String, String>,
    repo_host: Option<&str>,
) -> BTreeMap<String, String> {
    let mut global = BTreeMap::new();
    global.insert("log-path".to_string(), LOG_DIRECTORY.to_string());

    for repo in repos {
        global.extend(repo_options(repo));

        if let (Some(host), Some(_)) = (repo_host, &repo.volume) {
            global.insert(format!("{}-host", repo.name), host.to_owned());
            global.insert(format!("{}-host-user", repo.name), "postgres".to_string());
        }
    }

    global.extend(overrides.iter().map(|(k, v)| (k.to_owned(), v.to_owned())));
    global
}

/// returns the configuration read by pgbackrest on database instances
pub fn instance_config(
    cluster: &PostgresCluster,
    repos: &[Repo],
    overrides: &BTreeMap<String, String>,
    repo_host: Option<&str>,
) -> String {
    let global = global(repos, overrides, repo_host);

    ini(&[("global", &global), (naming::STANZA, &local_stanza(cluster))])
}

/// returns the stanza section of an instance reading its own data directory
pub fn local_stanza(cluster: &PostgresCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("pg1-path".to_string(), pgdata(cluster.spec.postgres_version)),
        ("pg1-port".to_string(), cluster.port().to_string()),
        ("pg1-socket-path".to_string(), SOCKET_DIRECTORY.to_string()),
    ])
}

/// returns the configuration read by pgbackrest on the repository host,
/// which reaches every instance over ssh
pub fn repo_host_config(
    cluster: &PostgresCluster,
    namespace: &str,
    repos: &[Repo],
    overrides: &BTreeMap<String, String>,
    instances: &[String],
) -> String {
    let global = global(repos, overrides, None);
    let cluster_name = cluster.name_any();

    let mut stanza = BTreeMap::new();
    for (index, instance) in instances.iter().enumerate() {
        let n = index + 1;

        stanza.insert(
            format!("pg{}-host", n),
            naming::pod_fqdn(instance, &cluster_name, namespace),
        );
        stanza.insert(format!("pg{}-path", n), pgdata(cluster.spec.postgres_version));
        stanza.insert(format!("pg{}-port", n), cluster.port().to_string());
        stanza.insert(format!("pg{}-socket-path", n), SOCKET_DIRECTORY.to_string());
    }

    ini(&[("global", &global), (naming::STANZA, &stanza)])
}

pub fn hash(content: &str) -> String {
    naming::digest(&[content], HASH_LENGTH)
}

pub fn ssh_config() -> String {
    format!(
        "Host *\nStrictHostKeyChecking yes\nIdentityFile {dir}/{key}\nPort {port}\nUser postgres\n",
        dir = SSH_DIRECTORY,
        key = naming::SSH_PRIVATE_KEY,
        port = SSH_PORT
    )
}

pub fn sshd_config() -> String {
    format!(
        "AuthorizedKeysFile {dir}/{public}\nHostKey {dir}/{private}\nPasswordAuthentication no\nPermitRootLogin no\nPidFile /tmp/sshd.pid\nPort {port}\nPubkeyAuthentication yes\nStrictModes no\n",
        dir = SSH_DIRECTORY,
        public = naming::SSH_PUBLIC_KEY,
        private = naming::SSH_PRIVATE_KEY,
        port = SSH_PORT
    )
}

/// returns the key pair stored in the secret, if both halves are present
pub fn stored_key_pair(secret: &Secret) -> Option<SshKeyPair> {
    let data = secret.data.as_ref()?;
    let read = |key: &str| {
        data.get(key)
            .and_then(|value| String::from_utf8(value.0.to_owned()).ok())
    };

    Some(SshKeyPair {
        private_key: read(naming::SSH_PRIVATE_KEY)?,
        public_key: read(naming::SSH_PUBLIC_KEY)?,
    })
}

impl<'a, A: Api> Pass<'a, A> {
    /// apply the configuration of pgbackrest and returns its hash
    #[cfg_attr(
        feature = "trace",
        tracing::instrument(skip(self, pgbackrest, host, resources, instances))
    )]
    pub async fn reconcile_config(
        &mut self,
        pgbackrest: &PgBackRest,
        host: Option<&StatefulSet>,
        resources: &RepoResources,
        instances: &Instances,
    ) -> Result<String, Error> {
        let fqdn = host.map(|h| naming::pod_fqdn(&h.name_any(), &self.name, &self.namespace));
        let instance = instance_config(self.cluster, &pgbackrest.repos, &pgbackrest.global, fqdn.as_deref());
        let hash = hash(&instance);

        let mut data = BTreeMap::from([
            (naming::CONFIG_INSTANCE.to_string(), instance),
            (naming::CONFIG_HASH.to_string(), hash.to_owned()),
        ]);

        if host.is_some() {
            data.insert(
                naming::CONFIG_REPO_HOST.to_string(),
                repo_host_config(
                    self.cluster,
                    &self.namespace,
                    &pgbackrest.repos,
                    &pgbackrest.global,
                    &instances.names(),
                ),
            );
        }

        self.api()
            .apply(&ConfigMap {
                metadata: self.metadata(&naming::config(&self.name), naming::config_labels(&self.name)),
                data: Some(data),
                ..Default::default()
            })
            .await?;

        if host.is_some() {
            self.reconcile_ssh(resources).await?;
        }

        debug!(
            namespace = &self.namespace,
            name = &self.name,
            hash = &hash,
            "Reconciled pgbackrest configuration"
        );

        Ok(hash)
    }

    /// apply the ssh configuration and key pair, an existing key pair is
    /// kept as is
    async fn reconcile_ssh(&self, resources: &RepoResources) -> Result<(), Error> {
        let labels = naming::repo_host_labels(&self.name);

        self.api()
            .apply(&ConfigMap {
                metadata: self.metadata(&naming::ssh_config(&self.name), labels.to_owned()),
                data: Some(BTreeMap::from([
                    (naming::SSH_CONFIG.to_string(), ssh_config()),
                    (naming::SSHD_CONFIG.to_string(), sshd_config()),
                ])),
                ..Default::default()
            })
            .await?;

        let name = naming::ssh_secret(&self.name);
        let pair = match resources.secret(&name).and_then(stored_key_pair) {
            Some(pair) => pair,
            None => self.ctx.pki.ssh_key_pair()?,
        };

        let known_hosts = format!("*.{} {}", naming::pods_service(&self.name), pair.public_key);
        let data = BTreeMap::from([
            (naming::SSH_PRIVATE_KEY.to_string(), ByteString(pair.private_key.into_bytes())),
            (naming::SSH_PUBLIC_KEY.to_string(), ByteString(pair.public_key.into_bytes())),
            (naming::SSH_KNOWN_HOSTS.to_string(), ByteString(known_hosts.into_bytes())),
        ]);

        self.api()
            .apply(&Secret {
                metadata: self.metadata(&name, labels),
                data: Some(data),
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// apply the identity used by backup jobs to reach the pod where the
    /// backup runs
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub async fn reconcile_rbac(&self) -> Result<(), Error> {
        let name = naming::rbac(&self.name);
        let labels = naming::pgbackrest_labels(&self.name);

        self.api()
            .apply(&ServiceAccount {
                metadata: self.metadata(&name, labels.to_owned()),
                automount_service_account_token: Some(true),
                ..Default::default()
            })
            .await?;

        self.api()
            .apply(&Role {
                metadata: self.metadata(&name, labels.to_owned()),
                rules: Some(vec![
                    PolicyRule {
                        api_groups: Some(vec!["".into()]),
                        resources: Some(vec!["pods".into()]),
                        verbs: vec!["get".into(), "list".into()],
                        ..Default::default()
                    },
                    PolicyRule {
                        api_groups: Some(vec!["".into()]),
                        resources: Some(vec!["pods/exec".into()]),
                        verbs: vec!["create".into()],
                        ..Default::default()
                    },
                ]),
            })
            .await?;

        self.api()
            .apply(&RoleBinding {
                metadata: self.metadata(&name, labels),
                role_ref: RoleRef {
                    api_group: Role::group(&()).to_string(),
                    kind: Role::kind(&()).to_string(),
                    name: name.to_owned(),
                },
                subjects: Some(vec![Subject {
                    kind: ServiceAccount::kind(&()).to_string(),
                    name: name.to_owned(),
                    namespace: Some(self.namespace.to_owned()),
                    ..Default::default()
                }]),
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::svc::crd::postgres_cluster::{RepoVolume, Spec, S3};

    use super::*;

    fn repos() -> Vec<Repo> {
        vec![
            Repo {
                name: "repo1".into(),
                volume: Some(RepoVolume::default()),
                ..Default::default()
            },
            Repo {
                name: "repo2".into(),
                s3: Some(S3 {
                    bucket: "bucket".into(),
                    endpoint: "s3.example.com".into(),
                    region: "eu-west-1".into(),
                }),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn instance_config_points_volume_repos_at_the_host() {
        let cluster = PostgresCluster::new(
            "hippo",
            Spec {
                postgres_version: 15,
                ..Default::default()
            },
        );

        let overrides = BTreeMap::from([("repo2-retention-full".to_string(), "2".to_string())]);
        let config = instance_config(&cluster, &repos(), &overrides, Some("hippo-repo-host-0"));

        assert!(config.starts_with("[global]\n"));
        assert!(config.contains("repo1-host = hippo-repo-host-0\n"));
        assert!(config.contains("repo1-path = /pgbackrest/repo1\n"));
        assert!(!config.contains("repo2-host"));
        assert!(config.contains("repo2-type = s3\n"));
        assert!(config.contains("repo2-retention-full = 2\n"));
        assert!(config.contains("[db]\npg1-path = /pgdata/pg15\npg1-port = 5432\n"));
    }

    #[test]
    fn repo_host_config_lists_every_instance() {
        let cluster = PostgresCluster::new(
            "hippo",
            Spec {
                postgres_version: 14,
                ..Default::default()
            },
        );

        let config = repo_host_config(
            &cluster,
            "db",
            &repos(),
            &BTreeMap::new(),
            &["hippo-00-abcd".to_string(), "hippo-00-efgh".to_string()],
        );

        assert!(config.contains("pg1-host = hippo-00-abcd-0.hippo-pods.db.svc.cluster.local\n"));
        assert!(config.contains("pg2-host = hippo-00-efgh-0.hippo-pods.db.svc.cluster.local\n"));
        assert!(!config.contains("repo1-host"));
    }

    #[test]
    fn cloud_repo_hash_follows_its_options() {
        let mut pgbackrest = PgBackRest {
            repos: repos(),
            ..Default::default()
        };

        let before = repo_options_hashes(&pgbackrest);
        assert_eq!(vec!["repo2"], before.keys().map(String::as_str).collect::<Vec<_>>());

        if let Some(s3) = pgbackrest.repos[1].s3.as_mut() {
            s3.bucket = "other".into();
        }
        assert_ne!(before, repo_options_hashes(&pgbackrest));
    }
}
