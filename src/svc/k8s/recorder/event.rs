//! # Event module
//!
//! This module builds core/v1 events about a resource

use std::fmt::Display;

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::{Event, EventSource},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::{api::ObjectMeta, Resource};

use crate::svc::k8s::{recorder::Level, resource};

// -----------------------------------------------------------------------------
// constants

pub const REPORTING_COMPONENT: &str = "pgbackrest-operator";
pub const ACTION: &str = "Reconcile";

// -----------------------------------------------------------------------------
// Helper functions

/// returns the name of the event, unique per object, reason and second
pub fn name<R: Display>(object: &str, reason: &R, at: &DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        object,
        reason.to_string().to_lowercase(),
        at.timestamp()
    )
}

/// create a new event about the object at the given instant
pub fn new<T, R>(obj: &T, level: &Level, reason: &R, message: &str, at: DateTime<Utc>) -> Event
where
    T: Resource<DynamicType = ()>,
    R: Display,
{
    let (namespace, object) = resource::namespaced_name(obj);
    let source = source();

    Event {
        metadata: ObjectMeta {
            name: Some(name(&object, reason, &at)),
            namespace: Some(namespace),
            ..Default::default()
        },
        type_: Some(level.to_string()),
        reason: Some(reason.to_string()),
        action: Some(ACTION.to_string()),
        message: Some(message.to_string()),
        involved_object: resource::object_reference(obj),
        count: Some(1),
        event_time: Some(MicroTime(at)),
        first_timestamp: Some(Time(at)),
        last_timestamp: Some(Time(at)),
        reporting_component: Some(REPORTING_COMPONENT.to_string()),
        reporting_instance: source.host.to_owned(),
        source: Some(source),
        ..Default::default()
    }
}

/// returns the source of the events, the host is the pod of the operator
pub fn source() -> EventSource {
    EventSource {
        component: Some(REPORTING_COMPONENT.to_string()),
        host: hostname::get()
            .ok()
            .map(|host| host.to_string_lossy().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::ConfigMap;

    use super::*;

    #[test]
    fn events_are_named_after_the_object_and_reason() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let obj = ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some("hippo".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        let event = new(&obj, &Level::Warning, &"InvalidDataSource", "oops", at);

        assert_eq!(
            Some("hippo-invaliddatasource-1700000000"),
            event.metadata.name.as_deref()
        );
        assert_eq!(Some("default"), event.metadata.namespace.as_deref());
        assert_eq!(Some("Warning"), event.type_.as_deref());
        assert_eq!(Some("InvalidDataSource"), event.reason.as_deref());
        assert_eq!(Some("hippo"), event.involved_object.name.as_deref());
    }
}
