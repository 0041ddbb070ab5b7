//! # Instance module
//!
//! This module provide the observation of the database instances of a
//! cluster, their runners and pods

use std::collections::BTreeMap;

use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod};
use kube::ResourceExt;

use crate::svc::{
    k8s::api::{self, Api},
    pgbackrest::naming,
};

// -----------------------------------------------------------------------------
// Instance structure

#[derive(Clone, Debug, Default)]
pub struct Instance {
    pub name: String,
    pub set: Option<String>,
    pub runner: Option<StatefulSet>,
    pub pods: Vec<Pod>,
}

impl Instance {
    /// returns if the instance is the patroni leader, which requires to
    /// observe exactly one pod
    pub fn is_primary(&self) -> bool {
        match self.pods.as_slice() {
            [pod] => pod.labels().get(naming::LABEL_ROLE).map(String::as_str)
                == Some(naming::ROLE_PRIMARY),
            _ => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        match self.pods.as_slice() {
            [pod] => pod
                .status
                .as_ref()
                .and_then(|status| status.conditions.as_ref())
                .map(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    /// returns if the container runs in one of the pods of the instance
    pub fn is_running(&self, container: &str) -> bool {
        self.pods.iter().any(|pod| {
            pod.status
                .as_ref()
                .and_then(|status| status.container_statuses.as_ref())
                .map(|statuses| {
                    statuses.iter().any(|status| {
                        status.name == container
                            && status
                                .state
                                .as_ref()
                                .and_then(|state| state.running.as_ref())
                                .is_some()
                    })
                })
                .unwrap_or(false)
        })
    }

    /// returns if the instance accepts writes, this is where pgbackrest
    /// commands reaching the database are run
    pub fn is_writable(&self) -> bool {
        self.is_primary() && self.is_ready()
    }
}

// -----------------------------------------------------------------------------
// Instances structure

#[derive(Clone, Debug, Default)]
pub struct Instances {
    /// instances sorted by name
    pub instances: Vec<Instance>,
}

impl Instances {
    pub fn writable(&self) -> Option<&Instance> {
        self.instances.iter().find(|i| i.is_writable())
    }

    pub fn primary(&self) -> Option<&Instance> {
        self.instances.iter().find(|i| i.is_primary())
    }

    pub fn runners(&self) -> impl Iterator<Item = &StatefulSet> {
        self.instances.iter().filter_map(|i| i.runner.as_ref())
    }

    pub fn is_running(&self, container: &str) -> bool {
        self.instances.iter().any(|i| i.is_running(container))
    }

    pub fn has_pods(&self) -> bool {
        self.instances.iter().any(|i| !i.pods.is_empty())
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.name.to_owned()).collect()
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the instances of the cluster grouped from runners and pods
#[cfg_attr(feature = "trace", tracing::instrument(skip(api)))]
pub async fn observe<A: Api>(api: &A, namespace: &str, cluster: &str) -> Result<Instances, api::Error> {
    let selector = naming::instance_selector(cluster);
    let runners: Vec<StatefulSet> = api.list(namespace, &selector).await?;
    let pods: Vec<Pod> = api.list(namespace, &selector).await?;

    let mut instances: BTreeMap<String, Instance> = BTreeMap::new();
    for runner in runners {
        let name = match runner.labels().get(naming::LABEL_INSTANCE) {
            Some(name) => name.to_owned(),
            None => continue,
        };

        let instance = instances.entry(name.to_owned()).or_insert_with(|| Instance {
            name,
            ..Default::default()
        });

        instance.set = runner.labels().get(naming::LABEL_INSTANCE_SET).cloned();
        instance.runner = Some(runner);
    }

    for pod in pods {
        let name = match pod.labels().get(naming::LABEL_INSTANCE) {
            Some(name) => name.to_owned(),
            None => continue,
        };

        let instance = instances.entry(name.to_owned()).or_insert_with(|| Instance {
            name,
            ..Default::default()
        });

        if instance.set.is_none() {
            instance.set = pod.labels().get(naming::LABEL_INSTANCE_SET).cloned();
        }
        instance.pods.push(pod);
    }

    Ok(Instances {
        instances: instances.into_values().collect(),
    })
}
