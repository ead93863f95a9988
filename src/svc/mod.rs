//! # Service module
//!
//! This module exposes the configuration, the dispatch loop, the gateways and
//! the custom resources with their reconcilers

pub mod cfg;
pub mod crd;
pub mod dispatch;
pub mod grafana;
pub mod k8s;
pub mod kdf;
