//! # Custom resource definition module
//!
//! This module provide the custom resource handled by the operator, its
//! definition and status helpers
pub mod condition;
pub mod postgres_cluster;
