//! # Grafana module
//!
//! This module provide the gateway to the grafana provisioning api, modeled
//! as one capability per endpoint family so that tests can substitute an
//! in-memory implementation

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod client;

// -----------------------------------------------------------------------------
// Constants

pub const ALERT_RULES_PATH: &str = "/api/v1/provisioning/alert-rules";
pub const POLICIES_PATH: &str = "/api/v1/provisioning/policies";
pub const MUTE_TIMINGS_PATH: &str = "/api/v1/provisioning/mute-timings";
pub const TEMPLATES_PATH: &str = "/api/v1/provisioning/templates";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on grafana api, {0}")]
    Request(reqwest::Error),
    #[error("grafana api answered with status {0} on '{1}', {2}")]
    Status(u16, String, String),
    #[error("failed to deserialize grafana api answer, {0}")]
    Deserialize(reqwest::Error),
}

// -----------------------------------------------------------------------------
// SecretRef structure

/// reference to the cluster secret holding the grafana url, organisation and
/// api token
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretRef {
    #[serde(rename = "name")]
    pub name: String,
    /// defaults to the namespace of the custom resource
    #[serde(rename = "namespace", skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// key of the api token within the secret, defaults to `token`
    #[serde(rename = "key", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

// -----------------------------------------------------------------------------
// GrafanaRef structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct GrafanaRef {
    #[serde(rename = "secretRef")]
    pub secret_ref: SecretRef,
}

// -----------------------------------------------------------------------------
// Api trait

/// the grafana provisioning surface consumed by the reconcilers. Every `get`
/// translates a http 404 answer to `None` and every `delete` treats it as
/// already-gone.
#[async_trait]
pub trait Api: Send + Sync {
    async fn get_alert_rule(&self, uid: &str) -> Result<Option<Value>, Error>;
    async fn create_alert_rule(&self, payload: &Value) -> Result<Value, Error>;
    async fn update_alert_rule(&self, uid: &str, payload: &Value) -> Result<Value, Error>;
    async fn delete_alert_rule(&self, uid: &str) -> Result<(), Error>;

    async fn get_notification_policy(&self) -> Result<Value, Error>;
    async fn put_notification_policy(&self, payload: &Value) -> Result<Value, Error>;

    async fn get_mute_timing(&self, name: &str) -> Result<Option<Value>, Error>;
    async fn create_mute_timing(&self, payload: &Value) -> Result<Value, Error>;
    async fn update_mute_timing(&self, name: &str, payload: &Value) -> Result<Value, Error>;
    async fn delete_mute_timing(&self, name: &str) -> Result<(), Error>;

    async fn get_template(&self, name: &str) -> Result<Option<Value>, Error>;
    async fn put_template(&self, name: &str, payload: &Value) -> Result<Value, Error>;
    async fn delete_template(&self, name: &str) -> Result<(), Error>;
}
