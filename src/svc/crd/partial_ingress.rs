//! # PartialIngress custom resource
//!
//! This module provide the partial ingress custom resource and its
//! reconciler: a local projection of the spec into a native ingress, plus the
//! replication of matching base ingresses under the partial hostname with the
//! overridden paths subtracted

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressRule, IngressSpec, IngressTLS,
};
use kube::{
    api::{ListParams, ObjectMeta},
    Api, CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::svc::{
    crd::{
        composite_ingress_host::{self, CompositeIngressHost},
        MANAGED_BY_LABEL, SYNC_STATUS_FAILED, SYNC_STATUS_SYNCED,
    },
    dispatch::{Bundle, Handler},
    k8s::{self, resource},
};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR: &str = "partial-ingress-operator";
pub const SOURCE_LABEL: &str = "partial-ingress.zengarden.space/source";
pub const REPLICATED_LABEL: &str = "partial-ingress.zengarden.space/replicated";
pub const HOSTNAME_LABEL: &str = "partial-ingress.zengarden.space/hostname";
pub const REPLICATED_FOR_ANNOTATION: &str = "partial-ingress.zengarden.space/replicated-for";
pub const SOURCE_PARTIAL_ANNOTATION: &str =
    "partial-ingress.zengarden.space/source-partial-ingress";

// -----------------------------------------------------------------------------
// Spec structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct PathEntry {
    #[serde(rename = "path", skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "pathType", skip_serializing_if = "Option::is_none")]
    pub path_type: Option<String>,
    #[serde(rename = "backend", skip_serializing_if = "Option::is_none")]
    pub backend: Option<Value>,
}

impl PathEntry {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("/")
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct HttpRule {
    #[serde(rename = "paths", default)]
    pub paths: Vec<PathEntry>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Rule {
    #[serde(rename = "host", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "http", skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpRule>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Tls {
    #[serde(rename = "hosts", skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
    #[serde(rename = "secretName", skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// mirrors a native ingress spec, plus the annotations to stamp on the
/// generated ingress
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "networking.zengarden.space")]
#[kube(version = "v1")]
#[kube(kind = "PartialIngress")]
#[kube(singular = "partialingress")]
#[kube(plural = "partialingresses")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"host", "type":"string", "description":"First rule host", "jsonPath":".spec.rules[0].host"}"#
)]
pub struct Spec {
    #[serde(rename = "ingressClassName", skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    #[serde(rename = "rules", default)]
    pub rules: Vec<Rule>,
    #[serde(rename = "tls", skip_serializing_if = "Option::is_none")]
    pub tls: Option<Vec<Tls>>,
    #[serde(rename = "annotations", skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "defaultBackend", skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<Value>,
}

impl Spec {
    /// host of the first rule, the only one a partial ingress consumes
    pub fn first_host(&self) -> Option<&str> {
        self.rules
            .first()
            .and_then(|rule| rule.host.as_deref())
            .filter(|host| !host.is_empty())
    }

    pub fn class(&self) -> &str {
        self.ingress_class_name.as_deref().unwrap_or("")
    }
}

// -----------------------------------------------------------------------------
// Status structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ReplicatedIngress {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "namespace")]
    pub namespace: String,
    #[serde(rename = "sourceIngress")]
    pub source_ingress: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "generatedIngress", skip_serializing_if = "Option::is_none")]
    pub generated_ingress: Option<String>,
    #[serde(
        rename = "replicatedIngresses",
        skip_serializing_if = "Option::is_none"
    )]
    pub replicated_ingresses: Option<Vec<ReplicatedIngress>>,
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
    #[error("failed to deserialize custom resource, {0}")]
    Deserialize(serde_json::Error),
    #[error("failed to project spec into a native ingress, {0}")]
    Project(serde_json::Error),
    #[error("failed to serialize status, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to reconcile composite ingress host, {0}")]
    Composite(composite_ingress_host::ReconcilerError),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<composite_ingress_host::ReconcilerError> for ReconcilerError {
    fn from(err: composite_ingress_host::ReconcilerError) -> Self {
        Self::Composite(err)
    }
}

// -----------------------------------------------------------------------------
// helpers

/// first 8 hex characters of the sha-256 digest of `<hostname>:<class>`,
/// used to name every resource replicated for that pair
pub fn hash8(hostname: &str, class: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", hostname, class).as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();

    hex[..8].to_string()
}

/// shell-glob match of the hostname against the composite host pattern, an
/// invalid pattern matching nothing
pub fn matches_pattern(hostname: &str, pattern: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(pattern) => pattern.matches(hostname),
        Err(err) => {
            warn!(
                pattern = pattern,
                error = err.to_string(),
                "Invalid host pattern on composite ingress host",
            );
            false
        }
    }
}

/// union of the first-rule paths of every live partial ingress claiming the
/// given hostname and class
pub fn override_paths(
    partials: &[PartialIngress],
    hostname: &str,
    class: &str,
) -> HashSet<String> {
    let mut paths = HashSet::new();

    for partial in partials {
        if resource::deleted(partial) || partial.spec.class() != class {
            continue;
        }

        let Some(rule) = partial.spec.rules.first() else {
            continue;
        };

        if rule.host.as_deref() != Some(hostname) {
            continue;
        }

        if let Some(http) = &rule.http {
            for entry in &http.paths {
                paths.insert(entry.path().to_string());
            }
        }
    }

    paths
}

/// every path of the template ingress, across all of its rules
pub fn template_paths(ingress: &Ingress) -> Vec<HTTPIngressPath> {
    let mut paths = Vec::new();

    if let Some(spec) = &ingress.spec {
        for rule in spec.rules.as_deref().unwrap_or_default() {
            if let Some(http) = &rule.http {
                paths.extend(http.paths.iter().cloned());
            }
        }
    }

    paths
}

/// the template paths no partial ingress overrides for the hostname
pub fn carry_paths(paths: &[HTTPIngressPath], overrides: &HashSet<String>) -> Vec<HTTPIngressPath> {
    paths
        .iter()
        .filter(|path| !overrides.contains(path.path.as_deref().unwrap_or("/")))
        .cloned()
        .collect()
}

/// convert the partial ingress spec into a native ingress spec; the
/// annotations key is not part of the native spec and is ignored by the
/// conversion
pub fn to_ingress_spec(spec: &Spec) -> Result<IngressSpec, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(spec)?)
}

/// the same-namespace ingress projected from the partial ingress spec
pub fn local_projection(obj: &PartialIngress) -> Result<Ingress, serde_json::Error> {
    let (namespace, name) = resource::namespaced_name(obj);

    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), OPERATOR.to_string()),
        (SOURCE_LABEL.to_string(), name.to_owned()),
    ]);

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: obj.spec.annotations.to_owned(),
            owner_references: Some(vec![resource::owner_reference(obj)]),
            ..Default::default()
        },
        spec: Some(to_ingress_spec(&obj.spec)?),
        ..Default::default()
    })
}

/// the ingress replicating a template under the partial hostname, owned by
/// the composite ingress host so that its deletion cascades
pub fn build_replica(
    template: &Ingress,
    cih: &CompositeIngressHost,
    partial: &PartialIngress,
    hostname: &str,
    carry: Vec<HTTPIngressPath>,
) -> Ingress {
    let class = &cih.spec.ingress_class_name;
    let hash = hash8(hostname, class);
    let (partial_namespace, partial_name) = resource::namespaced_name(partial);

    let mut annotations = template.metadata.annotations.to_owned().unwrap_or_default();
    annotations.insert(REPLICATED_FOR_ANNOTATION.to_string(), hostname.to_string());
    annotations.insert(
        SOURCE_PARTIAL_ANNOTATION.to_string(),
        format!("{}/{}", partial_namespace, partial_name),
    );

    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), OPERATOR.to_string()),
        (REPLICATED_LABEL.to_string(), "true".to_string()),
        (HOSTNAME_LABEL.to_string(), hostname.to_string()),
    ]);

    // every tls entry narrows to the replicated hostname, the certificate
    // secret living next to the replica
    let tls = template.spec.as_ref().and_then(|spec| {
        spec.tls.as_ref().map(|entries| {
            entries
                .iter()
                .map(|entry| IngressTLS {
                    hosts: Some(vec![hostname.to_string()]),
                    secret_name: entry
                        .secret_name
                        .as_ref()
                        .map(|secret| format!("{}-{}", secret, hash)),
                })
                .collect::<Vec<_>>()
        })
    });

    Ingress {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", template.name_any(), hash)),
            namespace: cih.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![resource::owner_reference(cih)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(class.to_owned()),
            rules: Some(vec![IngressRule {
                host: Some(hostname.to_string()),
                http: Some(HTTPIngressRuleValue { paths: carry }),
            }]),
            tls,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// returns whether a live partial ingress still matches the composite host
pub fn has_matching_partial(cih: &CompositeIngressHost, partials: &[PartialIngress]) -> bool {
    partials.iter().any(|partial| {
        !resource::deleted(partial)
            && partial.spec.class() == cih.spec.ingress_class_name
            && partial
                .spec
                .first_host()
                .map(|host| matches_pattern(host, &cih.spec.host_pattern))
                .unwrap_or(false)
    })
}

/// returns whether the ingress carries an owner reference to the given
/// composite ingress host
pub fn owned_by_composite(ingress: &Ingress, cih_name: &str) -> bool {
    ingress
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|owner| owner.kind == "CompositeIngressHost" && owner.name == cih_name)
}

// -----------------------------------------------------------------------------
// Reconciler structure

pub struct Reconciler {
    kube: kube::Client,
}

impl Reconciler {
    pub fn new(kube: kube::Client) -> Self {
        Self { kube }
    }

    async fn reconcile(&self, obj: &PartialIngress) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj);

        if resource::deleted(obj) {
            // replicas are owned by the composite host, not by the partial
            // ingress, so the garbage collector will not clean them up
            info!(
                namespace = &namespace,
                name = &name,
                "Custom resource is being deleted, checking for orphaned replicas",
            );
            return self.cleanup_orphaned_replicas().await;
        }

        let Some(hostname) = obj.spec.first_host().map(str::to_string) else {
            warn!(
                namespace = &namespace,
                name = &name,
                "No host in partial ingress rules, skipping",
            );
            return Ok(());
        };
        let class = obj.spec.class().to_string();

        info!(
            namespace = &namespace,
            name = &name,
            hostname = &hostname,
            class = &class,
            "Reconcile partial ingress",
        );

        // ---------------------------------------------------------------------
        // Step 1: project the spec into a same-namespace ingress

        let projection = local_projection(obj).map_err(ReconcilerError::Project)?;
        resource::upsert(self.kube.to_owned(), &projection).await?;

        // ---------------------------------------------------------------------
        // Step 2: replicate matching base ingresses into every composite
        // host namespace

        let composites: Vec<CompositeIngressHost> =
            resource::list(self.kube.to_owned(), &ListParams::default()).await?;
        let partials: Vec<PartialIngress> =
            resource::list(self.kube.to_owned(), &ListParams::default()).await?;
        let overrides = override_paths(&partials, &hostname, &class);

        let mut replicated = Vec::new();
        for cih in &composites {
            if cih.spec.ingress_class_name != class
                || !matches_pattern(&hostname, &cih.spec.host_pattern)
            {
                continue;
            }

            let (cih_namespace, cih_name) = resource::namespaced_name(cih);
            debug!(
                namespace = &cih_namespace,
                name = &cih_name,
                base_host = &cih.spec.base_host,
                "Partial ingress matched composite ingress host",
            );

            let templates = composite_ingress_host::base_ingresses(
                self.kube.to_owned(),
                &cih_namespace,
                &cih.spec.base_host,
                &class,
            )
            .await?;

            for template in &templates {
                let carry = carry_paths(&template_paths(template), &overrides);

                if carry.is_empty() {
                    debug!(
                        namespace = &cih_namespace,
                        template = template.name_any(),
                        "Every template path is overridden, skipping replica",
                    );
                    continue;
                }

                let replica = build_replica(template, cih, obj, &hostname, carry);
                let replica_name = replica.name_any();
                resource::upsert(self.kube.to_owned(), &replica).await?;

                replicated.push(ReplicatedIngress {
                    name: replica_name,
                    namespace: cih_namespace.to_owned(),
                    source_ingress: format!(
                        "{}/{}",
                        template.namespace().unwrap_or_default(),
                        template.name_any()
                    ),
                });
            }
        }

        // ---------------------------------------------------------------------
        // Step 3: record the generated objects on the status

        let status = Status {
            generated_ingress: Some(name.to_owned()),
            replicated_ingresses: Some(replicated),
            sync_status: Some(SYNC_STATUS_SYNCED.to_string()),
            last_synced: Some(k8s::timestamp()),
            message: Some(String::new()),
        };

        let api: Api<PartialIngress> = Api::namespaced(self.kube.to_owned(), &namespace);
        if let Err(err) = resource::patch_status(
            &api,
            &name,
            serde_json::to_value(status).map_err(ReconcilerError::Serialize)?,
        )
        .await
        {
            warn!(
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to update status of custom resource",
            );
        }

        Ok(())
    }

    /// delete the replicas of every composite host no live partial ingress
    /// matches anymore
    async fn cleanup_orphaned_replicas(&self) -> Result<(), ReconcilerError> {
        let composites: Vec<CompositeIngressHost> =
            resource::list(self.kube.to_owned(), &ListParams::default()).await?;
        let partials: Vec<PartialIngress> =
            resource::list(self.kube.to_owned(), &ListParams::default()).await?;

        for cih in &composites {
            let (cih_namespace, cih_name) = resource::namespaced_name(cih);

            if has_matching_partial(cih, &partials) {
                debug!(
                    namespace = &cih_namespace,
                    name = &cih_name,
                    "Composite ingress host still has matching partial ingresses",
                );
                continue;
            }

            info!(
                namespace = &cih_namespace,
                name = &cih_name,
                "No active partial ingress left, cleaning up replicated ingresses",
            );

            let params = ListParams::default().labels(&format!("{}=true", REPLICATED_LABEL));
            let replicas: Vec<Ingress> =
                resource::list_namespaced(self.kube.to_owned(), &cih_namespace, &params).await?;

            for replica in replicas {
                if !owned_by_composite(&replica, &cih_name) {
                    continue;
                }

                let replica_name = replica.name_any();
                info!(
                    namespace = &cih_namespace,
                    name = &replica_name,
                    "Delete replicated ingress",
                );

                if let Err(err) =
                    resource::delete::<Ingress>(self.kube.to_owned(), &cih_namespace, &replica_name)
                        .await
                {
                    warn!(
                        namespace = &cih_namespace,
                        name = &replica_name,
                        error = err.to_string(),
                        "Failed to delete replicated ingress, continuing",
                    );
                }
            }
        }

        Ok(())
    }

    /// record the failure on the resource status, never masking the original
    /// error
    async fn mark_failed(&self, obj: &PartialIngress, err: &ReconcilerError) {
        let (namespace, name) = resource::namespaced_name(obj);
        let api: Api<PartialIngress> = Api::namespaced(self.kube.to_owned(), &namespace);
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

            match kind {
                "PartialIngress" => {
                    let obj: PartialIngress = serde_json::from_value(event.object.to_owned())
                        .map_err(ReconcilerError::Deserialize)?;

                    if let Err(err) = self.reconcile(&obj).await {
                        self.mark_failed(&obj, &err).await;
                        return Err(err);
                    }
                }
                "CompositeIngressHost" => {
                    let obj: CompositeIngressHost =
                        serde_json::from_value(event.object.to_owned())
                            .map_err(ReconcilerError::Deserialize)?;

                    composite_ingress_host::reconcile(self.kube.to_owned(), &obj).await?;
                }
                _ => {
                    warn!(kind = kind, "Unknown kind, skipping");
                }
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use k8s_openapi::api::networking::v1::{
        IngressBackend, IngressServiceBackend, ServiceBackendPort,
    };

    use super::*;

    fn partial(name: &str, namespace: &str, spec: Value) -> PartialIngress {
        let mut obj = PartialIngress::new(name, serde_json::from_value(spec).unwrap());
        obj.metadata.namespace = Some(namespace.to_string());
        obj.metadata.uid = Some(format!("uid-{}", name));
        obj
    }

    fn composite(name: &str, namespace: &str, base: &str, pattern: &str, class: &str) -> CompositeIngressHost {
        let mut obj = CompositeIngressHost::new(
            name,
            composite_ingress_host::Spec {
                base_host: base.to_string(),
                host_pattern: pattern.to_string(),
                ingress_class_name: class.to_string(),
            },
        );
        obj.metadata.namespace = Some(namespace.to_string());
        obj.metadata.uid = Some(format!("uid-{}", name));
        obj
    }

    fn backend(service: &str) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(80),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }
    }

    fn template(name: &str, namespace: &str, host: &str, class: &str, paths: &[&str]) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some(class.to_string()),
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: paths
                            .iter()
                            .map(|path| HTTPIngressPath {
                                path: Some(path.to_string()),
                                path_type: "Prefix".to_string(),
                                backend: backend("svc"),
                            })
                            .collect(),
                    }),
                }]),
                tls: Some(vec![IngressTLS {
                    hosts: Some(vec![host.to_string()]),
                    secret_name: Some("base-tls".to_string()),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn hash8_is_stable_lowercase_hex() {
        let one = hash8("x.dev.example", "nginx");
        let two = hash8("x.dev.example", "nginx");

        assert_eq!(one, two);
        assert_eq!(one.len(), 8);
        assert!(one.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        assert_ne!(one, hash8("x.dev.example", "traefik"));
        assert_ne!(one, hash8("y.dev.example", "nginx"));
    }

    #[test]
    fn pattern_matching_follows_fnmatch_semantics() {
        assert!(matches_pattern("x.dev.example", "*.dev.example"));
        assert!(matches_pattern("x.dev.example", "x.dev.*"));
        assert!(!matches_pattern("x.example", "*.dev.example"));
        assert!(!matches_pattern("x.dev.example", "[invalid"));
    }

    #[test]
    fn override_paths_unions_first_rules_of_live_partials() {
        let partials = vec![
            partial(
                "a",
                "ns-a",
                serde_json::json!({
                    "ingressClassName": "nginx",
                    "rules": [{"host": "x.dev.example", "http": {"paths": [{"path": "/a"}]}}],
                }),
            ),
            partial(
                "b",
                "ns-b",
                serde_json::json!({
                    "ingressClassName": "nginx",
                    "rules": [{"host": "x.dev.example", "http": {"paths": [{"path": "/b"}, {"path": "/c"}]}}],
                }),
            ),
            // other hostname, not part of the override set
            partial(
                "c",
                "ns-c",
                serde_json::json!({
                    "ingressClassName": "nginx",
                    "rules": [{"host": "y.dev.example", "http": {"paths": [{"path": "/z"}]}}],
                }),
            ),
            // other class
            partial(
                "d",
                "ns-d",
                serde_json::json!({
                    "ingressClassName": "traefik",
                    "rules": [{"host": "x.dev.example", "http": {"paths": [{"path": "/t"}]}}],
                }),
            ),
        ];

        let overrides = override_paths(&partials, "x.dev.example", "nginx");

        assert_eq!(
            overrides,
            HashSet::from(["/a".to_string(), "/b".to_string(), "/c".to_string()])
        );
    }

    #[test]
    fn override_paths_skips_deleting_partials() {
        let mut deleting = partial(
            "a",
            "ns-a",
            serde_json::json!({
                "ingressClassName": "nginx",
                "rules": [{"host": "x.dev.example", "http": {"paths": [{"path": "/a"}]}}],
            }),
        );
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));

        assert!(override_paths(&[deleting], "x.dev.example", "nginx").is_empty());
    }

    #[test]
    fn carry_paths_subtracts_the_override_set() {
        let base = template("t", "nc", "b.example", "nginx", &["/a", "/b"]);
        let overrides = HashSet::from(["/a".to_string()]);

        let carry = carry_paths(&template_paths(&base), &overrides);

        assert_eq!(carry.len(), 1);
        assert_eq!(carry[0].path.as_deref(), Some("/b"));

        let all = HashSet::from(["/a".to_string(), "/b".to_string()]);
        assert!(carry_paths(&template_paths(&base), &all).is_empty());
    }

    #[test]
    fn replica_follows_the_naming_and_ownership_contract() {
        let base = template("t", "nc", "b.example", "nginx", &["/a", "/b"]);
        let cih = composite("env", "nc", "b.example", "*.dev.example", "nginx");
        let source = partial(
            "x",
            "np",
            serde_json::json!({
                "ingressClassName": "nginx",
                "rules": [{"host": "x.dev.example", "http": {"paths": [{"path": "/a"}]}}],
            }),
        );

        let carry = carry_paths(
            &template_paths(&base),
            &HashSet::from(["/a".to_string()]),
        );
        let replica = build_replica(&base, &cih, &source, "x.dev.example", carry);

        let hash = hash8("x.dev.example", "nginx");
        assert_eq!(replica.name_any(), format!("t-{}", hash));
        assert_eq!(replica.namespace().as_deref(), Some("nc"));

        let spec = replica.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));

        let rules = spec.rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host.as_deref(), Some("x.dev.example"));
        let paths = &rules[0].http.as_ref().unwrap().paths;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].path.as_deref(), Some("/b"));
        // the backend is the template's, pointing at a service local to the
        // composite host namespace
        assert_eq!(paths[0].backend, backend("svc"));

        let tls = spec.tls.unwrap();
        assert_eq!(tls[0].hosts.as_deref(), Some(&["x.dev.example".to_string()][..]));
        assert_eq!(
            tls[0].secret_name.as_deref(),
            Some(format!("base-tls-{}", hash).as_str())
        );

        let labels = replica.metadata.labels.unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], OPERATOR);
        assert_eq!(labels[REPLICATED_LABEL], "true");
        assert_eq!(labels[HOSTNAME_LABEL], "x.dev.example");

        let annotations = replica.metadata.annotations.unwrap();
        assert_eq!(annotations[REPLICATED_FOR_ANNOTATION], "x.dev.example");
        assert_eq!(annotations[SOURCE_PARTIAL_ANNOTATION], "np/x");

        let owners = replica.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "CompositeIngressHost");
        assert_eq!(owners[0].name, "env");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn local_projection_mirrors_the_spec() {
        let source = partial(
            "x",
            "np",
            serde_json::json!({
                "ingressClassName": "nginx",
                "annotations": {"cert-manager.io/cluster-issuer": "letsencrypt"},
                "rules": [{"host": "x.dev.example", "http": {"paths": [
                    {"path": "/a", "pathType": "Prefix", "backend": {"service": {"name": "svc", "port": {"number": 80}}}}
                ]}}],
            }),
        );

        let projection = local_projection(&source).unwrap();

        assert_eq!(projection.name_any(), "x");
        assert_eq!(projection.namespace().as_deref(), Some("np"));
        assert_eq!(
            projection.metadata.annotations.unwrap()["cert-manager.io/cluster-issuer"],
            "letsencrypt"
        );

        let spec = projection.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rules = spec.rules.unwrap();
        assert_eq!(rules[0].host.as_deref(), Some("x.dev.example"));
        assert_eq!(rules[0].http.as_ref().unwrap().paths[0].path_type, "Prefix");

        let owners = projection.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "PartialIngress");
        assert_eq!(owners[0].name, "x");
    }

    #[test]
    fn matching_partials_keep_replicas_alive() {
        let cih = composite("env", "nc", "b.example", "*.dev.example", "nginx");
        let live = partial(
            "x",
            "np",
            serde_json::json!({
                "ingressClassName": "nginx",
                "rules": [{"host": "x.dev.example", "http": {"paths": [{"path": "/a"}]}}],
            }),
        );
        let mut deleting = live.clone();
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));

        assert!(has_matching_partial(&cih, &[live]));
        assert!(!has_matching_partial(&cih, &[deleting]));
        assert!(!has_matching_partial(&cih, &[]));
    }

    #[test]
    fn replica_ownership_is_checked_by_kind_and_name() {
        let base = template("t", "nc", "b.example", "nginx", &["/a"]);
        let cih = composite("env", "nc", "b.example", "*.dev.example", "nginx");
        let source = partial(
            "x",
            "np",
            serde_json::json!({
                "ingressClassName": "nginx",
                "rules": [{"host": "x.dev.example", "http": {"paths": []}}],
            }),
        );

        let replica = build_replica(&base, &cih, &source, "x.dev.example", template_paths(&base));

        assert!(owned_by_composite(&replica, "env"));
        assert!(!owned_by_composite(&replica, "other"));
        assert!(!owned_by_composite(&base, "env"));
    }
}
