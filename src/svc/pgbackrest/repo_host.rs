//! # Repository host module
//!
//! This module provide the dedicated repository host of a cluster, the
//! workload holding repository volumes and answering pgbackrest over ssh

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
        core::v1::{
            ConfigMapProjection, Container, ContainerPort, KeyToPath, PersistentVolumeClaimVolumeSource,
            PodSecurityContext, PodSpec, PodTemplateSpec, ProjectedVolumeSource, SecretProjection,
            Volume, VolumeMount, VolumeProjection,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{
    api::{ObjectMeta, PropagationPolicy},
    ResourceExt,
};
use tracing::{info, warn};

use crate::svc::{
    crd::{condition, postgres_cluster::RepoHostStatus},
    k8s::{api::Api, recorder::Level},
    pgbackrest::{
        discovery::RepoResources,
        instance::Instances,
        naming, Error, Pass, Reason,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const SSH_PORT: i32 = 2022;
pub const REPO_DIRECTORY: &str = "/pgbackrest";
pub const SSH_DIRECTORY: &str = "/etc/ssh";

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the oldest of the observed hosts, by creation time then name
pub fn oldest(hosts: &[StatefulSet]) -> Option<&StatefulSet> {
    hosts.iter().min_by(|a, b| {
        let a = (a.metadata.creation_timestamp.as_ref().map(|t| t.0), a.name_any());
        let b = (b.metadata.creation_timestamp.as_ref().map(|t| t.0), b.name_any());

        a.cmp(&b)
    })
}

/// returns if every desired replica of the host is ready
pub fn is_ready(host: &StatefulSet) -> bool {
    let desired = host
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let ready = host
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);

    ready == desired
}

/// returns the volume projecting the configuration of pgbackrest, the key
/// is the file written in the configuration directory
pub fn config_volume(cluster: &str, keys: &[&str], extra: &[VolumeProjection]) -> Volume {
    let items = keys
        .iter()
        .map(|key| KeyToPath {
            key: key.to_string(),
            path: key.to_string(),
            ..Default::default()
        })
        .collect();

    let mut sources = vec![VolumeProjection {
        config_map: Some(ConfigMapProjection {
            name: Some(naming::config(cluster)),
            items: Some(items),
            ..Default::default()
        }),
        ..Default::default()
    }];
    sources.extend(extra.iter().cloned());

    Volume {
        name: "pgbackrest-config".into(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(sources),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn ssh_volume(cluster: &str) -> Volume {
    Volume {
        name: "ssh".into(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![
                VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: Some(naming::ssh_config(cluster)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    secret: Some(SecretProjection {
                        name: Some(naming::ssh_secret(cluster)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            default_mode: Some(0o040),
        }),
        ..Default::default()
    }
}

impl<'a, A: Api> Pass<'a, A> {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, resources, instances)))]
    pub async fn reconcile_repo_host(
        &mut self,
        resources: &RepoResources,
        instances: &Instances,
    ) -> Result<Option<StatefulSet>, Error> {
        if !self.cluster.dedicated_repo_host_enabled() {
            self.pgbackrest_status().repo_host = None;
            self.remove_condition(condition::REPO_HOST_READY);
            return Ok(None);
        }

        // ---------------------------------------------------------------------
        // Step 1: apply the host, reusing the oldest observed one

        let existing = oldest(&resources.hosts);
        let name = existing
            .map(ResourceExt::name_any)
            .unwrap_or_else(|| naming::repo_host(&self.name));

        let result = self.api().apply(&self.repo_host(&name, resources, instances)).await;

        // ---------------------------------------------------------------------
        // Step 2: report readiness, even when the apply failed

        let host = match result {
            Ok(host) => host,
            Err(err) => {
                self.set_repo_host_condition();
                return Err(err.into());
            }
        };

        self.pgbackrest_status().repo_host = Some(RepoHostStatus {
            ready: is_ready(&host),
        });
        self.set_repo_host_condition();

        if existing.is_none() {
            info!(
                namespace = &self.namespace,
                name = &name,
                cluster = &self.name,
                "Created dedicated repository host"
            );

            self.record(
                &Level::Normal,
                &Reason::RepoHostCreated,
                &format!("created pgBackRest repository host StatefulSet/{}", name),
            )
            .await;
        }

        // ---------------------------------------------------------------------
        // Step 3: remove duplicated hosts

        for duplicate in resources.hosts.iter().filter(|h| h.name_any() != name) {
            if let Err(err) = self
                .delete::<StatefulSet>(&duplicate.name_any(), PropagationPolicy::Background)
                .await
            {
                warn!(
                    namespace = &self.namespace,
                    name = duplicate.name_any(),
                    error = err.to_string(),
                    "Failed to delete duplicated repository host"
                );
            }
        }

        Ok(Some(host))
    }

    fn set_repo_host_condition(&mut self) {
        let ready = self
            .status
            .pgbackrest
            .as_ref()
            .and_then(|status| status.repo_host.as_ref())
            .map(|host| host.ready);

        match ready {
            None => self.set_condition(
                condition::REPO_HOST_READY,
                condition::STATUS_UNKNOWN,
                "RepoHostStatusMissing",
                "pgBackRest dedicated repository host status is missing",
            ),
            Some(true) => self.set_condition(
                condition::REPO_HOST_READY,
                condition::STATUS_TRUE,
                "RepoHostReady",
                "pgBackRest dedicated repository host is ready",
            ),
            Some(false) => self.set_condition(
                condition::REPO_HOST_READY,
                condition::STATUS_FALSE,
                "RepoHostNotReady",
                "pgBackRest dedicated repository host is not ready",
            ),
        }
    }

    fn repo_host(&self, name: &str, resources: &RepoResources, instances: &Instances) -> StatefulSet {
        let spec = self.cluster.pgbackrest().and_then(|p| p.repo_host.to_owned()).unwrap_or_default();
        let selector = naming::repo_host_labels(&self.name);
        let mut labels = selector.to_owned();
        labels.insert(naming::LABEL_DATA.into(), naming::DATA_PGBACKREST.into());

        // the host is stopped along the cluster, once its instances are gone
        let replicas = if self.cluster.is_shutdown() && !instances.has_pods() {
            0
        } else {
            1
        };

        let mut volumes = vec![
            config_volume(&self.name, &[naming::CONFIG_REPO_HOST, naming::CONFIG_HASH], &[]),
            ssh_volume(&self.name),
        ];
        let mut mounts = vec![
            VolumeMount {
                name: "pgbackrest-config".into(),
                mount_path: naming::CONFIG_DIRECTORY.into(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "ssh".into(),
                mount_path: SSH_DIRECTORY.into(),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        let repos = self.cluster.pgbackrest().map(|p| p.repos.as_slice()).unwrap_or_default();
        for repo in repos.iter().filter(|repo| repo.volume.is_some()) {
            let claim = resources
                .volume(&repo.name)
                .unwrap_or_else(|| naming::repo_volume(&self.name, &repo.name));

            volumes.push(Volume {
                name: repo.name.to_owned(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim,
                    read_only: None,
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: repo.name.to_owned(),
                mount_path: format!("{}/{}", REPO_DIRECTORY, repo.name),
                ..Default::default()
            });
        }

        StatefulSet {
            metadata: self.metadata(name, labels.to_owned()),
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                service_name: naming::pods_service(&self.name),
                pod_management_policy: Some("Parallel".into()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".into()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        affinity: spec.affinity,
                        tolerations: Some(spec.tolerations).filter(|t| !t.is_empty()),
                        priority_class_name: spec.priority_class_name,
                        restart_policy: Some("Always".into()),
                        share_process_namespace: Some(true),
                        automount_service_account_token: Some(false),
                        enable_service_links: Some(false),
                        security_context: Some(PodSecurityContext {
                            fs_group: Some(26),
                            run_as_non_root: Some(true),
                            ..Default::default()
                        }),
                        containers: vec![Container {
                            name: naming::CONTAINER_PGBACKREST.into(),
                            image: Some(self.pgbackrest_image()),
                            command: Some(vec![
                                "/usr/sbin/sshd".into(),
                                "-D".into(),
                                "-e".into(),
                            ]),
                            ports: Some(vec![ContainerPort {
                                name: Some("ssh".into()),
                                container_port: SSH_PORT,
                                protocol: Some("TCP".into()),
                                ..Default::default()
                            }]),
                            resources: spec.resources,
                            volume_mounts: Some(mounts),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
