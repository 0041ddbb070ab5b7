//! # Event recorder module
//!
//! This module records kubernetes events about the reconciled resources, in
//! the manner of the EventRecorder of client-go
//!
//! See following links for more details:
//! - <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go>

use std::fmt::{self, Display, Formatter};

use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use kube::Resource;
use tracing::debug;

use crate::svc::k8s::{
    api::{self, Api},
    resource,
};

pub mod event;

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// record an event for the given object
#[cfg_attr(feature = "trace", tracing::instrument(skip(api, obj)))]
pub async fn record<A, T, R>(
    api: &A,
    obj: &T,
    level: &Level,
    reason: &R,
    message: &str,
) -> Result<Event, api::Error>
where
    A: Api,
    T: Resource<DynamicType = ()> + Sync,
    R: Display + fmt::Debug + Sync,
{
    let (namespace, name) = resource::namespaced_name(obj);

    debug!(
        namespace = &namespace,
        name = &name,
        level = level.to_string(),
        reason = reason.to_string(),
        "Record event on resource, {}",
        message
    );

    api.apply(&event::new(obj, level, reason, message, Utc::now()))
        .await
}
