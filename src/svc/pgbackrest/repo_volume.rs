//! # Repository volume module
//!
//! This module provide the persistent volume claims backing volume
//! repositories and the merge of their state into the repository status

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::error;

use crate::svc::{
    crd::postgres_cluster::{PgBackRest, RepoStatus},
    k8s::api::Api,
    pgbackrest::{aggregate, config, discovery::RepoResources, naming, Error, Pass},
};

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the repository status list merged with the observed volumes and
/// the cloud repository hashes, sorted by repository name. Progress flags
/// are reset when the storage behind a repository changes.
pub fn merge_repo_status(
    current: &[RepoStatus],
    volumes: &[PersistentVolumeClaim],
    cloud_hashes: &BTreeMap<String, String>,
    replica_create_repo: &str,
) -> Vec<RepoStatus> {
    let mut merged = vec![];

    for pvc in volumes {
        let repo = match pvc.labels().get(naming::LABEL_REPO) {
            Some(repo) => repo.to_owned(),
            None => continue,
        };

        let volume = pvc.spec.as_ref().and_then(|spec| spec.volume_name.to_owned());
        let bound = pvc
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Bound");

        let mut status = current
            .iter()
            .find(|s| s.name == repo && s.repo_options_hash.is_none())
            .cloned()
            .unwrap_or_else(|| RepoStatus {
                name: repo.to_owned(),
                ..Default::default()
            });

        if repo != replica_create_repo {
            status.replica_create_backup_complete = false;
        }

        if status.volume.is_some() && status.volume != volume {
            status.stanza_created = false;
            status.replica_create_backup_complete = false;
        }

        status.bound = bound;
        status.volume = volume;
        merged.push(status);
    }

    for (repo, hash) in cloud_hashes {
        let mut status = current
            .iter()
            .find(|s| &s.name == repo)
            .cloned()
            .unwrap_or_else(|| RepoStatus {
                name: repo.to_owned(),
                ..Default::default()
            });

        if repo != replica_create_repo {
            status.replica_create_backup_complete = false;
        }

        if status.repo_options_hash.as_ref() != Some(hash) {
            status.repo_options_hash = Some(hash.to_owned());
            status.stanza_created = false;
            status.replica_create_backup_complete = false;
        }

        status.volume = None;
        status.bound = false;
        merged.push(status);
    }

    merged.sort_by(|a, b| a.name.cmp(&b.name));
    merged
}

impl<'a, A: Api> Pass<'a, A> {
    /// apply a claim for every volume repository, an error on one does not
    /// prevent the others
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, pgbackrest, resources)))]
    pub async fn reconcile_repo_volumes(
        &mut self,
        pgbackrest: &PgBackRest,
        resources: &RepoResources,
    ) -> Result<(), Error> {
        let mut volumes = vec![];
        let mut errors = vec![];

        for repo in &pgbackrest.repos {
            let spec = match &repo.volume {
                Some(volume) => volume.volume_claim_spec.to_owned(),
                None => continue,
            };

            let name = resources
                .volume(&repo.name)
                .unwrap_or_else(|| naming::repo_volume(&self.name, &repo.name));

            let pvc = PersistentVolumeClaim {
                metadata: self.metadata(&name, naming::repo_volume_labels(&self.name, &repo.name)),
                spec: Some(spec),
                ..Default::default()
            };

            match self.api().apply(&pvc).await {
                Ok(pvc) => volumes.push(pvc),
                Err(err) => {
                    error!(
                        namespace = &self.namespace,
                        name = &name,
                        repo = &repo.name,
                        error = err.to_string(),
                        "Failed to apply repository volume"
                    );

                    errors.push(err.into());
                }
            }
        }

        let replica_create_repo = pgbackrest
            .replica_create_repo()
            .map(|repo| repo.name.to_owned())
            .unwrap_or_default();
        let hashes = config::repo_options_hashes(pgbackrest);

        let status = self.pgbackrest_status();
        status.repos = merge_repo_status(&status.repos, &volumes, &hashes, &replica_create_repo);

        aggregate(errors)
    }
}
