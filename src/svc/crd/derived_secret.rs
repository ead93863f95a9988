//! # DerivedSecret custom resource
//!
//! This module provide the derived secret custom resource and its reconciler,
//! which materializes deterministic per-field secrets into a native cluster
//! secret

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{api::ObjectMeta, Api, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::svc::{
    crd::{MANAGED_BY_LABEL, SYNC_STATUS_FAILED, SYNC_STATUS_SYNCED},
    dispatch::{Bundle, Handler},
    k8s::{self, resource},
    kdf,
};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR: &str = "derived-secret-operator";
pub const DERIVED_FROM_LABEL: &str = "zengarden.space/derived-from";

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "zengarden.space")]
#[kube(version = "v1")]
#[kube(kind = "DerivedSecret")]
#[kube(singular = "derivedsecret")]
#[kube(plural = "derivedsecrets")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"secret", "type":"string", "description":"Generated secret", "jsonPath":".status.secretName"}"#
)]
pub struct Spec {
    /// mapping from field name to requested character length
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "secretName", skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(rename = "syncStatus", skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<String>,
    #[serde(rename = "lastSynced", skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to derive secret value, {0}")]
    Derive(kdf::Error),
    #[error("failed to deserialize custom resource, {0}")]
    Deserialize(serde_json::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<kdf::Error> for ReconcilerError {
    fn from(err: kdf::Error) -> Self {
        Self::Derive(err)
    }
}

// -----------------------------------------------------------------------------
// helpers

/// derive one value per well-formed spec field. Non-integer lengths are
/// skipped with a warning rather than failing the whole resource.
pub fn derive_fields(
    master: &str,
    params: &kdf::Params,
    identifier: &str,
    spec: &Spec,
) -> Result<BTreeMap<String, ByteString>, kdf::Error> {
    let mut derived = BTreeMap::new();

    for (field, value) in &spec.fields {
        let length = match value.as_u64() {
            Some(length) if length > 0 => length as usize,
            _ => {
                warn!(
                    field = field,
                    "Skipping field, length must be a positive integer",
                );
                continue;
            }
        };

        let secret = kdf::derive(master, params, identifier, field, length)?;
        derived.insert(field.to_owned(), ByteString(secret.into_bytes()));
    }

    Ok(derived)
}

/// overlay the derived values on the existing data, keys unknown to the spec
/// being preserved verbatim
pub fn merged_data(
    existing: Option<&BTreeMap<String, ByteString>>,
    derived: BTreeMap<String, ByteString>,
) -> BTreeMap<String, ByteString> {
    let mut data = existing.cloned().unwrap_or_default();
    data.extend(derived);
    data
}

/// the opaque secret owned by the given derived secret
pub fn desired_secret(obj: &DerivedSecret, data: BTreeMap<String, ByteString>) -> Secret {
    let (namespace, name) = resource::namespaced_name(obj);

    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), OPERATOR.to_string()),
        (DERIVED_FROM_LABEL.to_string(), name.to_owned()),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(vec![resource::owner_reference(obj)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

pub struct Reconciler {
    kube: kube::Client,
    master: String,
    params: kdf::Params,
}

impl Reconciler {
    pub fn new(kube: kube::Client, master: String, params: kdf::Params) -> Self {
        Self {
            kube,
            master,
            params,
        }
    }

    async fn reconcile(&self, obj: &DerivedSecret) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj);

        if resource::deleted(obj) {
            // the owned secret cascades through the garbage collector
            info!(
                namespace = &namespace,
                name = &name,
                "Custom resource is being deleted, nothing to reconcile",
            );
            return Ok(());
        }

        info!(
            namespace = &namespace,
            name = &name,
            "Reconcile derived secret",
        );

        let identifier = format!("{}/{}", namespace, name);
        let derived = derive_fields(&self.master, &self.params, &identifier, &obj.spec)?;

        if derived.is_empty() {
            warn!(
                namespace = &namespace,
                name = &name,
                "No secrets derived, skipping secret creation",
            );
            return Ok(());
        }

        let current: Option<Secret> =
            resource::get(self.kube.to_owned(), &namespace, &name).await?;
        let data = merged_data(current.as_ref().and_then(|secret| secret.data.as_ref()), derived);

        resource::upsert(self.kube.to_owned(), &desired_secret(obj, data)).await?;

        let api: Api<DerivedSecret> = Api::namespaced(self.kube.to_owned(), &namespace);
        let status = serde_json::json!({
            "secretName": name,
            "syncStatus": SYNC_STATUS_SYNCED,
            "lastSynced": k8s::timestamp(),
            "message": "",
        });

        if let Err(err) = resource::patch_status(&api, &name, status).await {
            warn!(
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to update status of custom resource",
            );
        }

        Ok(())
    }

    /// record the failure on the resource status, never masking the original
    /// error
    async fn mark_failed(&self, obj: &DerivedSecret, err: &ReconcilerError) {
        let (namespace, name) = resource::namespaced_name(obj);
        let api: Api<DerivedSecret> = Api::namespaced(self.kube.to_owned(), &namespace);
        let status = serde_json::json!({
            "syncStatus": SYNC_STATUS_FAILED,
            "lastSynced": k8s::timestamp(),
            "message": err.to_string(),
        });

        if let Err(err) = resource::patch_status(&api, &name, status).await {
            warn!(
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to update status of custom resource",
            );
        }
    }
}

#[async_trait]
impl Handler for Reconciler {
    type Error = ReconcilerError;

    async fn handle(&mut self, bundle: &Bundle) -> Result<(), ReconcilerError> {
        let events = bundle.events();

        if events.is_empty() {
            warn!("No objects in binding context");
            return Ok(());
        }

        for event in events {
            let kind = event
                .object
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or_default();

            if kind != "DerivedSecret" {
                warn!(kind = kind, "Unknown kind, skipping");
                continue;
            }

            let obj: DerivedSecret = serde_json::from_value(event.object.to_owned())
                .map_err(ReconcilerError::Deserialize)?;

            if let Err(err) = self.reconcile(&obj).await {
                self.mark_failed(&obj, &err).await;
                return Err(err);
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: kdf::Params = kdf::Params {
        time_cost: 1,
        memory_cost: 64,
        parallelism: 1,
    };

    fn derived_secret(fields: Value) -> DerivedSecret {
        let mut obj = DerivedSecret::new(
            "app",
            serde_json::from_value(fields).unwrap(),
        );
        obj.metadata.namespace = Some("ns".to_string());
        obj.metadata.uid = Some("0000-1111".to_string());
        obj
    }

    #[test]
    fn spec_fields_flatten_from_the_wire() {
        let obj: DerivedSecret = serde_json::from_value(serde_json::json!({
            "apiVersion": "zengarden.space/v1",
            "kind": "DerivedSecret",
            "metadata": {"name": "app", "namespace": "ns", "uid": "u"},
            "spec": {"token": 24, "password": 32},
        }))
        .unwrap();

        assert_eq!(obj.spec.fields.len(), 2);
        assert_eq!(obj.spec.fields["token"], Value::from(24));
    }

    #[test]
    fn derive_fields_skips_malformed_lengths() {
        let obj = derived_secret(serde_json::json!({
            "token": 24,
            "bogus": "not-a-length",
            "negative": -3,
        }));

        let derived = derive_fields("hunter2", &PARAMS, "ns/app", &obj.spec).unwrap();

        assert_eq!(derived.len(), 1);
        assert_eq!(derived["token"].0.len(), 24);
    }

    #[test]
    fn derive_fields_is_deterministic() {
        let obj = derived_secret(serde_json::json!({"token": 24}));

        let one = derive_fields("hunter2", &PARAMS, "ns/app", &obj.spec).unwrap();
        let two = derive_fields("hunter2", &PARAMS, "ns/app", &obj.spec).unwrap();

        assert_eq!(one, two);
    }

    #[test]
    fn merged_data_preserves_unmanaged_keys() {
        let existing = BTreeMap::from([
            ("extra".to_string(), ByteString(b"keep".to_vec())),
            ("token".to_string(), ByteString(b"stale".to_vec())),
        ]);
        let derived = BTreeMap::from([("token".to_string(), ByteString(b"fresh".to_vec()))]);

        let data = merged_data(Some(&existing), derived);

        assert_eq!(data["extra"], ByteString(b"keep".to_vec()));
        assert_eq!(data["token"], ByteString(b"fresh".to_vec()));
    }

    #[test]
    fn desired_secret_carries_ownership_contract() {
        let obj = derived_secret(serde_json::json!({"token": 24}));
        let secret = desired_secret(&obj, BTreeMap::new());

        assert_eq!(secret.type_.as_deref(), Some("Opaque"));

        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], OPERATOR);
        assert_eq!(labels[DERIVED_FROM_LABEL], "app");

        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "DerivedSecret");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].block_owner_deletion, Some(true));
    }
}
