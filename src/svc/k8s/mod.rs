//! # Kubernetes module
//!
//! This module provide the kubernetes client and resource helpers shared by
//! every reconciler

pub mod client;
pub mod resource;

// -----------------------------------------------------------------------------
// helpers

/// returns the current instant formatted as rfc-3339 utc, second precision
pub fn timestamp() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
