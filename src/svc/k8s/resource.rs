//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use k8s_openapi::{
    api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use json_patch::{PatchOperation, TestOperation};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::svc::k8s::api::{self, Api, Object};

// -----------------------------------------------------------------------------
// Constants

/// number of times a status write is attempted again after a conflict
pub const STATUS_CONFLICT_RETRIES: usize = 3;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource.
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// returns differnce between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// returns a controller owner reference pointing to the given resource
pub fn owner_reference<T>(obj: &T) -> OwnerReference
where
    T: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: T::api_version(&()).to_string(),
        block_owner_deletion: Some(true),
        controller: Some(true),
        kind: T::kind(&()).to_string(),
        name: obj.meta().name.to_owned().unwrap_or_default(),
        uid: obj.meta().uid.to_owned().unwrap_or_default(),
    }
}

/// returns if the resource is controlled by the owner with the given uid
pub fn controlled_by<T>(obj: &T, uid: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.uid == uid && r.controller.unwrap_or(false))
        })
        .unwrap_or(false)
}

/// returns a reference to the given object, mostly used by events
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some(T::api_version(&()).to_string()),
        kind: Some(T::kind(&()).to_string()),
        name: obj.meta().name.to_owned(),
        namespace: obj.meta().namespace.to_owned(),
        resource_version: obj.meta().resource_version.to_owned(),
        uid: obj.meta().uid.to_owned(),
        field_path: None,
    }
}

/// make a json patch request on the status of the given resource. The patch
/// is the difference between the resource and the resource altered by the
/// given function, guarded by the resource version. On conflict, the
/// resource is read again and the function applied on the fresh copy.
pub async fn patch_status<A, K, F>(api: &A, origin: &K, mutate: F) -> Result<K, api::Error>
where
    A: Api,
    K: Object,
    F: Fn(&mut K) + Send + Sync,
{
    let (namespace, name) = namespaced_name(origin);
    let mut current = origin.to_owned();
    let mut attempt = 0;

    loop {
        let mut modified = current.to_owned();
        mutate(&mut modified);

        let mut patch = diff(&current, &modified)?;
        if patch.0.is_empty() {
            debug!(
                namespace = &namespace,
                name = &name,
                "Skip patch request on resource's status, no operation to apply"
            );
            return Ok(current);
        }

        if let Some(version) = &current.meta().resource_version {
            patch.0.insert(
                0,
                PatchOperation::Test(TestOperation {
                    path: "/metadata/resourceVersion".to_string(),
                    value: Value::String(version.to_owned()),
                }),
            );
        }

        match api.patch_status::<K>(&namespace, &name, &patch).await {
            Err(err) if err.is_conflict() && attempt < STATUS_CONFLICT_RETRIES => {
                attempt += 1;
                debug!(
                    namespace = &namespace,
                    name = &name,
                    attempt = attempt,
                    "Resource has been modified in the meantime, read it again"
                );

                current = api.get::<K>(&namespace, &name).await?.ok_or_else(|| {
                    api::Error::NotFound(namespace.to_owned(), name.to_owned(), K::kind(&()).to_string())
                })?;
            }
            result => return result,
        }
    }
}
