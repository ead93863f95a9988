//! # User custom resource
//!
//! This module provide the cluster-scoped user custom resource and the rbac
//! reconciler: role bindings fanned out over annotation-selected namespaces,
//! and the argocd policy document regenerated from the enabled users

use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{ConfigMap, Namespace},
    rbac::v1::{ClusterRole, RoleBinding, RoleRef, Subject},
};
use kube::{
    api::{ObjectMeta, PostParams},
    Api, CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::svc::{
    crd::MANAGED_BY_LABEL,
    dispatch::{Bundle, Handler},
    k8s::{self, resource},
};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR: &str = "rbac-operator";
pub const ROLE_ANNOTATION: &str = "zengarden.space/role";
pub const NAMESPACES_ANNOTATION: &str = "zengarden.space/namespaces";
pub const ROLE_LABEL: &str = "zengarden.space/role";
pub const USER_LABEL: &str = "zengarden.space/user";
pub const ARGOCD_SENTINEL: &str = "@argocd";
pub const ARGOCD_NAMESPACE: &str = "argocd";
pub const ARGOCD_CONFIGMAP: &str = "argocd-rbac-cm";
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// argocd roles are hierarchical, each user is granted only the highest one
pub const ROLE_HIERARCHY: [&str; 4] = [
    "cluster-admin",
    "system-admin",
    "platform-operator",
    "app-developer",
];

/// static role grants of the argocd policy document. The exact text is part
/// of the public interface and is regenerated verbatim on every sync.
const POLICY_HEADER: [&str; 53] = [
    "# ============================================",
    "# Application Developer Role",
    "# ============================================",
    "# Can work with apps in the 'apps' project only",
    "p, role:app-developer, applications, get, apps/*, allow",
    "p, role:app-developer, applications, sync, apps/*, allow",
    "p, role:app-developer, applications, override, apps/*, allow",
    "p, role:app-developer, applications, action/*, apps/*, allow",
    "p, role:app-developer, logs, get, apps/*, allow",
    "p, role:app-developer, exec, create, apps/*, allow",
    "",
    "# ============================================",
    "# Platform Operator Role",
    "# ============================================",
    "# Full access to apps project",
    "p, role:platform-operator, applications, *, apps/*, allow",
    "p, role:platform-operator, logs, get, */*, allow",
    "p, role:platform-operator, exec, create, */*, allow",
    "",
    "# Can view default project apps (but not modify)",
    "p, role:platform-operator, applications, get, default/*, allow",
    "",
    "# Can manage projects and repositories",
    "p, role:platform-operator, projects, get, *, allow",
    "p, role:platform-operator, projects, create, *, allow",
    "p, role:platform-operator, projects, update, *, allow",
    "p, role:platform-operator, repositories, get, *, allow",
    "p, role:platform-operator, repositories, create, *, allow",
    "p, role:platform-operator, repositories, update, *, allow",
    "",
    "# ============================================",
    "# System Administrator Role",
    "# ============================================",
    "# Full access to all projects and ArgoCD management",
    "p, role:system-admin, applications, *, */*, allow",
    "p, role:system-admin, logs, *, */*, allow",
    "p, role:system-admin, exec, *, */*, allow",
    "p, role:system-admin, projects, *, *, allow",
    "p, role:system-admin, repositories, *, *, allow",
    "p, role:system-admin, certificates, *, *, allow",
    "p, role:system-admin, gpgkeys, *, *, allow",
    "p, role:system-admin, accounts, get, *, allow",
    "p, role:system-admin, accounts, update, *, allow",
    "",
    "# ============================================",
    "# Cluster Admin Role",
    "# ============================================",
    "# Break-glass full access",
    "p, role:cluster-admin, *, *, *, allow",
    "",
    "# ============================================",
    "# Role Assignments (Generated from User CRDs)",
    "# ============================================",
];

// -----------------------------------------------------------------------------
// Spec structure

fn default_enabled() -> bool {
    true
}

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "zengarden.space")]
#[kube(version = "v1")]
#[kube(kind = "User")]
#[kube(singular = "user")]
#[kube(plural = "users")]
#[kube(status = "Status")]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"email", "type":"string", "description":"Email", "jsonPath":".spec.email"}"#
)]
#[kube(
    printcolumn = r#"{"name":"enabled", "type":"boolean", "description":"Enabled", "jsonPath":".spec.enabled"}"#
)]
pub struct Spec {
    #[serde(rename = "email")]
    pub email: String,
    #[serde(rename = "roles", default)]
    pub roles: Vec<String>,
    #[serde(rename = "enabled", default = "default_enabled")]
    pub enabled: bool,
}

// -----------------------------------------------------------------------------
// Status structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "status")]
    pub status: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
    #[serde(rename = "reason")]
    pub reason: String,
    #[serde(rename = "message")]
    pub message: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "conditions", skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(rename = "roleBindings", skip_serializing_if = "Option::is_none")]
    pub role_bindings: Option<BTreeMap<String, Vec<String>>>,
    #[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

// -----------------------------------------------------------------------------
// Application custom resource (read-only mirror)

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Destination {
    #[serde(rename = "namespace", skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// the slice of an argocd application this operator reads, everything else
/// on the wire being ignored
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "argoproj.io")]
#[kube(version = "v1alpha1")]
#[kube(kind = "Application")]
#[kube(singular = "application")]
#[kube(plural = "applications")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct ApplicationSpec {
    #[serde(rename = "destination", default)]
    pub destination: Destination,
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

/// a namespace entry of the `zengarden.space/namespaces` annotation
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum NamespaceEntry {
    Literal(String),
    ArgoApplications,
}

/// roles declared by annotated cluster roles, with their raw namespace
/// entries
pub fn annotated_roles(cluster_roles: &[ClusterRole]) -> BTreeMap<String, Vec<NamespaceEntry>> {
    let mut roles = BTreeMap::new();

    for cluster_role in cluster_roles {
        let Some(annotations) = &cluster_role.metadata.annotations else {
            continue;
        };

        let Some(role) = annotations.get(ROLE_ANNOTATION) else {
            continue;
        };

        let namespaces = annotations
            .get(NAMESPACES_ANNOTATION)
            .map(String::as_str)
            .unwrap_or_default();

        let entries: Vec<NamespaceEntry> = namespaces
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry {
                ARGOCD_SENTINEL => NamespaceEntry::ArgoApplications,
                literal => NamespaceEntry::Literal(literal.to_string()),
            })
            .collect();

        if entries.is_empty() {
            warn!(
                name = cluster_role.name_any(),
                "ClusterRole has a role annotation but no namespaces annotation",
            );
            continue;
        }

        roles.insert(role.to_owned(), entries);
    }

    roles
}

/// expand the namespace entries, the argocd sentinel resolving to the given
/// application namespaces
pub fn resolve_role_namespaces(
    annotated: &BTreeMap<String, Vec<NamespaceEntry>>,
    argocd: &HashSet<String>,
) -> BTreeMap<String, Vec<String>> {
    let mut resolved = BTreeMap::new();

    for (role, entries) in annotated {
        let mut namespaces = Vec::new();

        for entry in entries {
            match entry {
                NamespaceEntry::Literal(namespace) => namespaces.push(namespace.to_owned()),
                NamespaceEntry::ArgoApplications => {
                    let mut expanded: Vec<String> = argocd.iter().cloned().collect();
                    expanded.sort();
                    namespaces.extend(expanded);
                }
            }
        }

        if !namespaces.is_empty() {
            resolved.insert(role.to_owned(), namespaces);
        }
    }

    resolved
}

/// destination namespaces of the given argocd applications
pub fn application_namespaces(applications: &[Application]) -> HashSet<String> {
    applications
        .iter()
        .filter_map(|application| application.spec.destination.namespace.to_owned())
        .collect()
}

/// the first hierarchy role present in the user roles
pub fn highest_role(roles: &[String]) -> Option<&'static str> {
    ROLE_HIERARCHY
        .iter()
        .find(|role| roles.iter().any(|candidate| candidate == *role))
        .copied()
}

pub fn binding_name(role: &str, user: &str) -> String {
    format!("homelab:{}:{}", role, user)
}

pub fn cluster_role_name(role: &str) -> String {
    format!("homelab:{}", role)
}

fn user_subject(email: &str) -> Subject {
    Subject {
        kind: "User".to_string(),
        name: email.to_string(),
        api_group: Some(RBAC_API_GROUP.to_string()),
        ..Default::default()
    }
}

/// edit the subject list in place: the user subject is added when enabled
/// and missing, removed when disabled and present, other subjects are left
/// untouched. `None` means the binding needs no update.
pub fn edit_subjects(existing: &[Subject], email: &str, enabled: bool) -> Option<Vec<Subject>> {
    let present = existing
        .iter()
        .any(|subject| subject.kind == "User" && subject.name == email);

    if enabled && !present {
        let mut subjects = existing.to_vec();
        subjects.push(user_subject(email));
        return Some(subjects);
    }

    if !enabled && present {
        return Some(
            existing
                .iter()
                .filter(|subject| !(subject.kind == "User" && subject.name == email))
                .cloned()
                .collect(),
        );
    }

    None
}

/// the role binding granting the cluster role to the user in one namespace
pub fn desired_binding(namespace: &str, role: &str, user: &User) -> RoleBinding {
    let user_name = user.name_any();

    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), OPERATOR.to_string()),
        (ROLE_LABEL.to_string(), role.to_string()),
        (USER_LABEL.to_string(), user_name.to_owned()),
    ]);

    RoleBinding {
        metadata: ObjectMeta {
            name: Some(binding_name(role, &user_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![resource::owner_reference(user)]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role_name(role),
        },
        subjects: Some(vec![user_subject(&user.spec.email)]),
    }
}

/// the argocd policy document: static role grants followed by one grant per
/// enabled user, pinned to the highest role of the hierarchy
pub fn policy_csv(users: &[User]) -> String {
    let mut lines: Vec<String> = POLICY_HEADER.iter().map(|line| line.to_string()).collect();

    for user in users {
        if !user.spec.enabled || user.spec.email.is_empty() {
            continue;
        }

        if let Some(role) = highest_role(&user.spec.roles) {
            lines.push(format!("g, {}, role:{}", user.spec.email, role));
        }
    }

    lines.join("\n") + "\n"
}

// -----------------------------------------------------------------------------
// Reconciler structure

pub struct Reconciler {
    kube: kube::Client,
    resync_interval: Duration,
}

impl Reconciler {
    pub fn new(kube: kube::Client, resync_interval: Duration) -> Self {
        Self {
            kube,
            resync_interval,
        }
    }

    /// full reconciliation: every user, then the argocd policy document
    pub async fn reconcile_all(&self) -> Result<(), ReconcilerError> {
        info!("Start full rbac reconciliation");

        let users: Vec<User> = resource::list(self.kube.to_owned(), &Default::default()).await?;
        info!(count = users.len(), "Found users to reconcile");

        for user in &users {
            if let Err(err) = self.reconcile_user(user).await {
                error!(
                    name = user.name_any(),
                    error = err.to_string(),
                    "Failed to reconcile user",
                );
            }
        }

        if let Err(err) = self.sync_argocd_rbac(&users).await {
            error!(
                error = err.to_string(),
                "Failed to sync argocd rbac configmap",
            );
        }

        info!("Full rbac reconciliation complete");
        Ok(())
    }

    async fn reconcile_user(&self, user: &User) -> Result<(), ReconcilerError> {
        let name = user.name_any();

        info!(
            name = &name,
            email = &user.spec.email,
            enabled = user.spec.enabled,
            "Reconcile user",
        );

        let role_map = match self.resolve_roles().await {
            Ok(role_map) => role_map,
            Err(err) => {
                self.update_user_status(&name, BTreeMap::new(), Some(&err.to_string()))
                    .await;
                return Err(err);
            }
        };

        let mut ensured: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for role in &user.spec.roles {
            let Some(namespaces) = role_map.get(role) else {
                warn!(
                    role = role,
                    "Role not declared by any annotated cluster role, skipping",
                );
                continue;
            };

            debug!(
                role = role,
                namespaces = namespaces.len(),
                "Managing role bindings for role",
            );

            for namespace in namespaces {
                match self.ensure_binding(namespace, role, user).await {
                    Ok(()) => {
                        if user.spec.enabled {
                            ensured
                                .entry(namespace.to_owned())
                                .or_default()
                                .push(binding_name(role, &name));
                        }
                    }
                    Err(err) => {
                        error!(
                            namespace = namespace,
                            name = binding_name(role, &name),
                            error = err.to_string(),
                            "Failed to manage role binding, continuing",
                        );
                    }
                }
            }
        }

        self.update_user_status(&name, ensured, None).await;
        Ok(())
    }

    /// role to namespaces map from annotated cluster roles, the argocd
    /// sentinel expanded lazily once per reconcile
    async fn resolve_roles(&self) -> Result<BTreeMap<String, Vec<String>>, ReconcilerError> {
        let cluster_roles: Vec<ClusterRole> =
            resource::list(self.kube.to_owned(), &Default::default()).await?;
        let annotated = annotated_roles(&cluster_roles);

        let needs_argocd = annotated
            .values()
            .flatten()
            .any(|entry| *entry == NamespaceEntry::ArgoApplications);

        let argocd = if needs_argocd {
            match resource::list::<Application>(self.kube.to_owned(), &Default::default()).await {
                Ok(applications) => {
                    let namespaces = application_namespaces(&applications);
                    info!(
                        count = namespaces.len(),
                        "Discovered namespaces from argocd applications",
                    );
                    namespaces
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        "Failed to list argocd applications, expanding to nothing",
                    );
                    HashSet::new()
                }
            }
        } else {
            HashSet::new()
        };

        Ok(resolve_role_namespaces(&annotated, &argocd))
    }

    /// create or edit one role binding, the subject presence following the
    /// enabled flag
    async fn ensure_binding(
        &self,
        namespace: &str,
        role: &str,
        user: &User,
    ) -> Result<(), ReconcilerError> {
        let name = binding_name(role, &user.name_any());

        match resource::get::<RoleBinding>(self.kube.to_owned(), namespace, &name).await? {
            Some(mut existing) => {
                let subjects = existing.subjects.to_owned().unwrap_or_default();

                if let Some(edited) = edit_subjects(&subjects, &user.spec.email, user.spec.enabled)
                {
                    info!(
                        namespace = namespace,
                        name = &name,
                        enabled = user.spec.enabled,
                        "Update subjects of role binding",
                    );

                    existing.subjects = if edited.is_empty() { None } else { Some(edited) };

                    let api: Api<RoleBinding> = Api::namespaced(self.kube.to_owned(), namespace);
                    api.replace(&name, &PostParams::default(), &existing).await?;
                }

                Ok(())
            }
            None => {
                if !user.spec.enabled {
                    debug!(
                        namespace = namespace,
                        name = &name,
                        "User disabled, skipping creation of role binding",
                    );
                    return Ok(());
                }

                info!(namespace = namespace, name = &name, "Create role binding");

                let api: Api<RoleBinding> = Api::namespaced(self.kube.to_owned(), namespace);
                api.create(&PostParams::default(), &desired_binding(namespace, role, user))
                    .await?;

                Ok(())
            }
        }
    }

    /// regenerate the argocd policy configmap when the argocd namespace
    /// exists
    async fn sync_argocd_rbac(&self, users: &[User]) -> Result<(), ReconcilerError> {
        if resource::get_cluster::<Namespace>(self.kube.to_owned(), ARGOCD_NAMESPACE)
            .await?
            .is_none()
        {
            info!("ArgoCD namespace does not exist, skipping rbac sync");
            return Ok(());
        }

        info!("Sync argocd rbac configmap");

        let policy = policy_csv(users);
        let api: Api<ConfigMap> = Api::namespaced(self.kube.to_owned(), ARGOCD_NAMESPACE);

        match resource::get::<ConfigMap>(self.kube.to_owned(), ARGOCD_NAMESPACE, ARGOCD_CONFIGMAP)
            .await?
        {
            Some(mut existing) => {
                let data = existing.data.get_or_insert_with(BTreeMap::new);
                data.insert("policy.csv".to_string(), policy);
                data.insert("policy.default".to_string(), "role:readonly".to_string());
                data.insert("scopes".to_string(), "[groups, email]".to_string());

                api.replace(ARGOCD_CONFIGMAP, &PostParams::default(), &existing)
                    .await?;
                info!(count = users.len(), "Updated argocd rbac configmap");
            }
            None => {
                let labels = BTreeMap::from([
                    (MANAGED_BY_LABEL.to_string(), OPERATOR.to_string()),
                    ("app.kubernetes.io/part-of".to_string(), "argocd".to_string()),
                ]);

                let configmap = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(ARGOCD_CONFIGMAP.to_string()),
                        namespace: Some(ARGOCD_NAMESPACE.to_string()),
                        labels: Some(labels),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([
                        ("policy.csv".to_string(), policy),
                        ("policy.default".to_string(), "role:readonly".to_string()),
                        ("scopes".to_string(), "[groups, email]".to_string()),
                    ])),
                    ..Default::default()
                };

                api.create(&PostParams::default(), &configmap).await?;
                info!(count = users.len(), "Created argocd rbac configmap");
            }
        }

        Ok(())
    }

    /// write the ready condition and the ensured bindings on the user status
    async fn update_user_status(
        &self,
        name: &str,
        bindings: BTreeMap<String, Vec<String>>,
        error: Option<&str>,
    ) {
        let timestamp = k8s::timestamp();
        let total: usize = bindings.values().map(Vec::len).sum();

        let condition = match error {
            None => Condition {
                kind: "Ready".to_string(),
                status: "True".to_string(),
                last_transition_time: timestamp.to_owned(),
                reason: "ReconciliationSucceeded".to_string(),
                message: format!("Successfully ensured {} RoleBindings", total),
            },
            Some(message) => Condition {
                kind: "Ready".to_string(),
                status: "False".to_string(),
                last_transition_time: timestamp.to_owned(),
                reason: "ReconciliationFailed".to_string(),
                message: message.to_string(),
            },
        };

        let status = Status {
            conditions: Some(vec![condition]),
            role_bindings: Some(bindings),
            last_updated: Some(timestamp),
        };

        let api: Api<User> = Api::all(self.kube.to_owned());
        let status = match serde_json::to_value(status) {
            Ok(status) => status,
            Err(err) => {
                warn!(
                    name = name,
                    error = err.to_string(),
                    "Failed to serialize user status",
                );
                return;
            }
        };

        if let Err(err) = resource::patch_status(&api, name, status).await {
            warn!(
                name = name,
                error = err.to_string(),
                "Failed to update status of custom resource",
            );
        }
    }
}

#[async_trait]
impl Handler for Reconciler {
    type Error = ReconcilerError;

    /// any event triggers a full pass, the payload only tells us something
    /// changed
    async fn handle(&mut self, _bundle: &Bundle) -> Result<(), ReconcilerError> {
        self.reconcile_all().await
    }

    fn resync_interval(&self) -> Option<Duration> {
        Some(self.resync_interval)
    }

    async fn resync(&mut self) -> Result<(), ReconcilerError> {
        self.reconcile_all().await
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_role(name: &str, annotations: &[(&str, &str)]) -> ClusterRole {
        ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn user(name: &str, email: &str, roles: &[&str], enabled: bool) -> User {
        let mut obj = User::new(
            name,
            Spec {
                email: email.to_string(),
                roles: roles.iter().map(|role| role.to_string()).collect(),
                enabled,
            },
        );
        obj.metadata.uid = Some(format!("uid-{}", name));
        obj
    }

    fn application(namespace: &str) -> Application {
        Application::new(
            &format!("app-{}", namespace),
            ApplicationSpec {
                destination: Destination {
                    namespace: Some(namespace.to_string()),
                },
            },
        )
    }

    #[test]
    fn enabled_defaults_to_true_on_the_wire() {
        let parsed: User = serde_json::from_value(serde_json::json!({
            "apiVersion": "zengarden.space/v1",
            "kind": "User",
            "metadata": {"name": "alice"},
            "spec": {"email": "alice@x", "roles": ["editor"]},
        }))
        .unwrap();

        assert!(parsed.spec.enabled);
    }

    #[test]
    fn annotated_roles_require_both_annotations() {
        let roles = annotated_roles(&[
            cluster_role(
                "homelab:editor",
                &[(ROLE_ANNOTATION, "editor"), (NAMESPACES_ANNOTATION, "ns1, ns2")],
            ),
            cluster_role("homelab:viewer", &[(ROLE_ANNOTATION, "viewer")]),
            cluster_role("unrelated", &[("something", "else")]),
        ]);

        assert_eq!(
            roles,
            BTreeMap::from([(
                "editor".to_string(),
                vec![
                    NamespaceEntry::Literal("ns1".to_string()),
                    NamespaceEntry::Literal("ns2".to_string()),
                ],
            )])
        );
    }

    #[test]
    fn argocd_sentinel_expands_to_application_namespaces() {
        let annotated = annotated_roles(&[cluster_role(
            "homelab:editor",
            &[
                (ROLE_ANNOTATION, "editor"),
                (NAMESPACES_ANNOTATION, "ns1,@argocd"),
            ],
        )]);
        let argocd = application_namespaces(&[application("ns2")]);

        let resolved = resolve_role_namespaces(&annotated, &argocd);

        assert_eq!(
            resolved["editor"],
            vec!["ns1".to_string(), "ns2".to_string()]
        );
    }

    #[test]
    fn highest_role_follows_the_hierarchy() {
        let roles = vec![
            "app-developer".to_string(),
            "system-admin".to_string(),
        ];

        assert_eq!(highest_role(&roles), Some("system-admin"));
        assert_eq!(highest_role(&["unknown".to_string()]), None);
        assert_eq!(highest_role(&[]), None);
    }

    #[test]
    fn policy_grants_one_role_per_enabled_user() {
        let users = vec![
            user("alice", "alice@x", &["app-developer", "cluster-admin"], true),
            user("bob", "bob@x", &["platform-operator"], true),
            user("mallory", "mallory@x", &["cluster-admin"], false),
        ];

        let policy = policy_csv(&users);

        assert!(policy.contains("p, role:cluster-admin, *, *, *, allow"));
        assert!(policy.contains("g, alice@x, role:cluster-admin"));
        assert!(policy.contains("g, bob@x, role:platform-operator"));
        assert!(!policy.contains("mallory@x"));
        assert!(policy.ends_with('\n'));
    }

    #[test]
    fn subjects_are_edited_in_place() {
        let other = Subject {
            kind: "Group".to_string(),
            name: "admins".to_string(),
            api_group: Some(RBAC_API_GROUP.to_string()),
            ..Default::default()
        };

        // enabled and missing: added next to the untouched subject
        let edited = edit_subjects(&[other.to_owned()], "alice@x", true).unwrap();
        assert_eq!(edited.len(), 2);
        assert_eq!(edited[0], other);
        assert_eq!(edited[1].name, "alice@x");

        // disabled and present: removed, the other subject kept
        let edited = edit_subjects(&edited, "alice@x", false).unwrap();
        assert_eq!(edited, vec![other.to_owned()]);

        // no change needed either way
        assert!(edit_subjects(&[other.to_owned()], "alice@x", false).is_none());
        let present = edit_subjects(&[other], "alice@x", true).unwrap();
        assert!(edit_subjects(&present, "alice@x", true).is_none());
    }

    #[test]
    fn desired_binding_follows_the_naming_contract() {
        let owner = user("alice", "alice@x", &["editor"], true);
        let binding = desired_binding("ns1", "editor", &owner);

        assert_eq!(binding.metadata.name.as_deref(), Some("homelab:editor:alice"));
        assert_eq!(binding.metadata.namespace.as_deref(), Some("ns1"));
        assert_eq!(binding.role_ref.kind, "ClusterRole");
        assert_eq!(binding.role_ref.name, "homelab:editor");

        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "User");
        assert_eq!(subjects[0].name, "alice@x");

        let labels = binding.metadata.labels.unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], OPERATOR);
        assert_eq!(labels[ROLE_LABEL], "editor");
        assert_eq!(labels[USER_LABEL], "alice");

        let owners = binding.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "User");
        assert_eq!(owners[0].controller, Some(true));
    }
}
