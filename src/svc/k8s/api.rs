//! # Api module
//!
//! This module provide the seam between the reconciliation engine and the
//! kubernetes api, a trait describing the few verbs the engine needs and its
//! implementation on top of the [`kube::Client`]

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::svc::k8s::selector::Selector;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("failed to find resource '{0}/{1}' of kind '{2}'")]
    NotFound(String, String, String),
    #[error("failed to write resource '{0}/{1}', it has been modified in the meantime")]
    Conflict(String, String),
    #[error("failed to serialize resource, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to apply resource, metadata field '{0}' is missing")]
    MissingMetadata(&'static str),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err)
    }
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_, _, _) => true,
            Self::Kube(kube::Error::Api(res)) => res.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_, _) => true,
            Self::Kube(kube::Error::Api(res)) => res.code == 409,
            _ => false,
        }
    }
}

// -----------------------------------------------------------------------------
// Object trait

/// group traits needed to manipulate a namespaced kubernetes object through
/// the [`Api`] trait
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

/// Blanklet implementation of [`Object`]
impl<T> Object for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

// -----------------------------------------------------------------------------
// Api trait

#[async_trait]
pub trait Api: Send + Sync {
    /// returns the object if it exists
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>;

    /// returns objects of the namespace matching the selector
    async fn list<K: Object>(&self, namespace: &str, selector: &Selector)
        -> Result<Vec<K>, Error>;

    /// create or update the object using server side apply, the api is the
    /// only writer of the fields it sends
    async fn apply<K: Object>(&self, obj: &K) -> Result<K, Error>;

    /// delete the object, deleting an absent object is not an error
    async fn delete<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        policy: PropagationPolicy,
    ) -> Result<(), Error>;

    /// apply the json patch on the status sub-resource of the object
    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<K, Error>;
}

// -----------------------------------------------------------------------------
// KubeApi structure

/// implementation of the [`Api`] trait using the kubernetes client
#[derive(Clone)]
pub struct KubeApi {
    client: kube::Client,
    field_manager: String,
}

impl KubeApi {
    pub fn new(client: kube::Client, field_manager: String) -> Self {
        Self {
            client,
            field_manager,
        }
    }

    pub fn client(&self) -> kube::Client {
        self.client.to_owned()
    }

    fn resolve<K: Object>(namespace: &str, name: &str, err: kube::Error) -> Error {
        match &err {
            kube::Error::Api(res) if res.code == 404 => {
                Error::NotFound(namespace.into(), name.into(), K::kind(&()).to_string())
            }
            kube::Error::Api(res) if res.code == 409 => {
                Error::Conflict(namespace.into(), name.into())
            }
            // a failed 'test' operation of a json patch is reported as an
            // invalid request
            kube::Error::Api(res) if res.code == 422 && res.message.contains("test") => {
                Error::Conflict(namespace.into(), name.into())
            }
            _ => Error::Kube(err),
        }
    }
}

#[async_trait]
impl Api for KubeApi {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        kube::Api::<K>::namespaced(self.client(), namespace)
            .get_opt(name)
            .await
            .map_err(|err| Self::resolve::<K>(namespace, name, err))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn list<K: Object>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<K>, Error> {
        let params = ListParams::default().labels(&selector.to_string());

        Ok(kube::Api::<K>::namespaced(self.client(), namespace)
            .list(&params)
            .await
            .map_err(Error::Kube)?
            .items)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, obj)))]
    async fn apply<K: Object>(&self, obj: &K) -> Result<K, Error> {
        let namespace = obj.namespace().ok_or(Error::MissingMetadata("namespace"))?;
        let name = obj.meta().name.to_owned().ok_or(Error::MissingMetadata("name"))?;

        debug!(
            kind = K::kind(&()).to_string(),
            namespace = &namespace,
            name = &name,
            "Apply resource"
        );

        kube::Api::<K>::namespaced(self.client(), &namespace)
            .patch(
                &name,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(obj),
            )
            .await
            .map_err(|err| Self::resolve::<K>(&namespace, &name, err))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        policy: PropagationPolicy,
    ) -> Result<(), Error> {
        let params = DeleteParams {
            propagation_policy: Some(policy),
            ..Default::default()
        };

        debug!(
            kind = K::kind(&()).to_string(),
            namespace = namespace,
            name = name,
            "Delete resource"
        );

        match kube::Api::<K>::namespaced(self.client(), namespace)
            .delete(name, &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(res)) if res.code == 404 => Ok(()),
            Err(err) => Err(Self::resolve::<K>(namespace, name, err)),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<K, Error> {
        debug!(
            kind = K::kind(&()).to_string(),
            namespace = namespace,
            name = name,
            patch = serde_json::to_string(patch)?,
            "Execute patch request on resource's status"
        );

        kube::Api::<K>::namespaced(self.client(), namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Json::<K>(patch.to_owned()),
            )
            .await
            .map_err(|err| Self::resolve::<K>(namespace, name, err))
    }
}
