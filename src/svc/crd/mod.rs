//! # Custom resources module
//!
//! This module provide the custom resources managed by the operators and
//! their reconcilers

pub mod composite_ingress_host;
pub mod derived_secret;
pub mod grafana;
pub mod partial_ingress;
pub mod user;

// -----------------------------------------------------------------------------
// Constants

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const SYNC_STATUS_SYNCED: &str = "Synced";
pub const SYNC_STATUS_FAILED: &str = "Failed";
