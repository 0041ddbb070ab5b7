//! # Condition module
//!
//! This module provide helpers to read and write typed conditions of the
//! custom resource status

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

// -----------------------------------------------------------------------------
// Constants

pub const REPO_HOST_READY: &str = "PGBackRestRepoHostReady";
pub const REPLICA_REPO_READY: &str = "PGBackRestReplicaRepoReady";
pub const REPLICA_CREATE: &str = "PGBackRestReplicaCreate";
pub const MANUAL_BACKUP_SUCCESSFUL: &str = "PGBackRestManualBackupSuccessful";
pub const POSTGRES_DATA_INITIALIZED: &str = "PostgresDataInitialized";
pub const RESTORE_PROGRESSING: &str = "PGBackRestRestoreProgressing";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

// -----------------------------------------------------------------------------
// Helpers functions

pub fn new(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: generation,
        last_transition_time: Time(Utc::now()),
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_)
        .map(|condition| condition.status == STATUS_TRUE)
        .unwrap_or(false)
}

/// insert or replace the condition of the same type, the transition time is
/// kept as long as the status does not change
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.to_owned();
            }

            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn remove(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|condition| condition.type_ != type_);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keeps_transition_time_while_status_holds() {
        let mut conditions = vec![];

        set(
            &mut conditions,
            new(REPO_HOST_READY, STATUS_FALSE, "RepoHostNotReady", "not ready", Some(1)),
        );
        let first = conditions[0].last_transition_time.to_owned();

        set(
            &mut conditions,
            new(REPO_HOST_READY, STATUS_FALSE, "RepoHostNotReady", "still not", Some(2)),
        );
        assert_eq!(1, conditions.len());
        assert_eq!(first, conditions[0].last_transition_time);
        assert_eq!("still not", conditions[0].message);
        assert_eq!(Some(2), conditions[0].observed_generation);

        set(
            &mut conditions,
            new(REPO_HOST_READY, STATUS_TRUE, "RepoHostReady", "ready", Some(2)),
        );
        assert!(is_true(&conditions, REPO_HOST_READY));

        remove(&mut conditions, REPO_HOST_READY);
        assert!(find(&conditions, REPO_HOST_READY).is_none());
    }
}
