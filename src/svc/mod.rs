//! # Services module
//!
//! This module provide services to interact with kubernetes, the pgbackrest
//! reconciliation and helpers to do so.
pub mod cfg;
pub mod crd;
pub mod k8s;
pub mod pgbackrest;
pub mod pki;
pub mod telemetry;
