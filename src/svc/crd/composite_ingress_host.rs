//! # CompositeIngressHost custom resource
//!
//! This module provide the composite ingress host custom resource: it marks
//! the ingresses of its namespace matching `baseHost` as templates for the
//! replication of partial ingress hostnames

use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::svc::k8s::{self, resource};

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "networking.zengarden.space")]
#[kube(version = "v1")]
#[kube(kind = "CompositeIngressHost")]
#[kube(singular = "compositeingresshost")]
#[kube(plural = "compositeingresshosts")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct Spec {
    /// host of the template ingresses in this namespace
    #[serde(rename = "baseHost")]
    pub base_host: String,
    /// shell glob selecting the partial ingress hostnames to replicate
    #[serde(rename = "hostPattern")]
    pub host_pattern: String,
    #[serde(rename = "ingressClassName")]
    pub ingress_class_name: String,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "discoveredIngresses", skip_serializing_if = "Option::is_none")]
    pub discovered_ingresses: Option<i64>,
    #[serde(rename = "lastScanned", skip_serializing_if = "Option::is_none")]
    pub last_scanned: Option<String>,
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

// -----------------------------------------------------------------------------
// helpers

/// returns whether the ingress is a template for the given base host and
/// ingress class
pub fn is_base_ingress(ingress: &Ingress, base_host: &str, class: &str) -> bool {
    let Some(spec) = &ingress.spec else {
        return false;
    };

    if spec.ingress_class_name.as_deref() != Some(class) {
        return false;
    }

    spec.rules
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|rule| rule.host.as_deref() == Some(base_host))
}

/// the template ingresses of the given namespace
pub async fn base_ingresses(
    client: kube::Client,
    namespace: &str,
    base_host: &str,
    class: &str,
) -> Result<Vec<Ingress>, kube::Error> {
    let ingresses = resource::list_namespaced::<Ingress>(client, namespace, &Default::default())
        .await?
        .into_iter()
        .filter(|ingress| is_base_ingress(ingress, base_host, class))
        .collect();

    Ok(ingresses)
}

// -----------------------------------------------------------------------------
// reconcile

/// scan the namespace of the composite host for template ingresses and record
/// the tally on its status
pub async fn reconcile(
    client: kube::Client,
    obj: &CompositeIngressHost,
) -> Result<(), ReconcilerError> {
    let (namespace, name) = resource::namespaced_name(obj);

    if resource::deleted(obj) {
        // replicas are owned by the composite host, the garbage collector
        // removes them on its own
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
        base_host = &obj.spec.base_host,
        "Reconcile composite ingress host",
    );

    let discovered = base_ingresses(
        client.to_owned(),
        &namespace,
        &obj.spec.base_host,
        &obj.spec.ingress_class_name,
    )
    .await?
    .len();

    let api: Api<CompositeIngressHost> = Api::namespaced(client, &namespace);
    let status = serde_json::json!({
        "discoveredIngresses": discovered,
        "lastScanned": k8s::timestamp(),
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

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use k8s_openapi::api::networking::v1::{IngressRule, IngressSpec};

    use super::*;

    fn ingress(host: Option<&str>, class: Option<&str>) -> Ingress {
        Ingress {
            spec: Some(IngressSpec {
                ingress_class_name: class.map(str::to_string),
                rules: host.map(|host| {
                    vec![IngressRule {
                        host: Some(host.to_string()),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn base_ingress_requires_host_and_class() {
        assert!(is_base_ingress(
            &ingress(Some("b.example"), Some("nginx")),
            "b.example",
            "nginx"
        ));
        assert!(!is_base_ingress(
            &ingress(Some("b.example"), Some("traefik")),
            "b.example",
            "nginx"
        ));
        assert!(!is_base_ingress(
            &ingress(Some("other.example"), Some("nginx")),
            "b.example",
            "nginx"
        ));
        assert!(!is_base_ingress(&ingress(None, Some("nginx")), "b.example", "nginx"));
    }
}
