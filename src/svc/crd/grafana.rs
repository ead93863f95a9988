//! # Grafana custom resources
//!
//! This module provide the four grafana alerting custom resources and their
//! reconcilers, mirroring each one into the grafana provisioning api

use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::{Api, CustomResource, Resource};
use k8s_openapi::NamespaceResourceScope;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::svc::{
    crd::{SYNC_STATUS_FAILED, SYNC_STATUS_SYNCED},
    dispatch::{Bundle, EventType, Handler},
    grafana::{self, client, GrafanaRef},
    k8s::{self, resource},
};

// -----------------------------------------------------------------------------
// GrafanaAlertRule custom resource

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "monitoring.zengarden.space")]
#[kube(version = "v1")]
#[kube(kind = "GrafanaAlertRule")]
#[kube(singular = "grafanaalertrule")]
#[kube(plural = "grafanaalertrules")]
#[kube(status = "AlertRuleStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"uid", "type":"string", "description":"Grafana-assigned uid", "jsonPath":".status.uid"}"#
)]
#[kube(
    printcolumn = r#"{"name":"status", "type":"string", "description":"Sync status", "jsonPath":".status.syncStatus"}"#
)]
pub struct AlertRuleSpec {
    #[serde(rename = "grafanaRef")]
    pub grafana_ref: GrafanaRef,
    #[serde(rename = "folderUID")]
    pub folder_uid: String,
    #[serde(rename = "ruleGroup")]
    pub rule_group: String,
    #[serde(rename = "title")]
    pub title: String,
    #[serde(rename = "condition")]
    pub condition: String,
    #[serde(rename = "noDataState", skip_serializing_if = "Option::is_none")]
    pub no_data_state: Option<String>,
    #[serde(rename = "execErrState", skip_serializing_if = "Option::is_none")]
    pub exec_err_state: Option<String>,
    #[serde(rename = "for", skip_serializing_if = "Option::is_none")]
    pub r#for: Option<String>,
    #[serde(rename = "annotations", skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "data")]
    pub data: Vec<Value>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct AlertRuleStatus {
    #[serde(rename = "uid", skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(rename = "provenance", skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(rename = "syncStatus", skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<String>,
    #[serde(rename = "lastSynced", skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// -----------------------------------------------------------------------------
// GrafanaNotificationPolicy custom resource

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Matcher {
    #[serde(rename = "label")]
    pub label: String,
    #[serde(rename = "match")]
    pub r#match: String,
    #[serde(rename = "value")]
    pub value: String,
}

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "monitoring.zengarden.space")]
#[kube(version = "v1")]
#[kube(kind = "GrafanaNotificationPolicy")]
#[kube(singular = "grafananotificationpolicy")]
#[kube(plural = "grafananotificationpolicies")]
#[kube(status = "PolicyStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct NotificationPolicySpec {
    #[serde(rename = "grafanaRef")]
    pub grafana_ref: GrafanaRef,
    #[serde(rename = "receiver")]
    pub receiver: String,
    #[serde(rename = "groupBy", skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(rename = "groupWait", skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<String>,
    #[serde(rename = "groupInterval", skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<String>,
    #[serde(rename = "repeatInterval", skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,
    #[serde(rename = "matchers", skip_serializing_if = "Option::is_none")]
    pub matchers: Option<Vec<Matcher>>,
    #[serde(rename = "muteTimeIntervals", skip_serializing_if = "Option::is_none")]
    pub mute_time_intervals: Option<Vec<String>>,
    #[serde(rename = "routes", skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Value>>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct PolicyStatus {
    #[serde(rename = "syncStatus", skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<String>,
    #[serde(rename = "lastSynced", skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// -----------------------------------------------------------------------------
// GrafanaMuteTiming custom resource

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "monitoring.zengarden.space")]
#[kube(version = "v1")]
#[kube(kind = "GrafanaMuteTiming")]
#[kube(singular = "grafanamutetiming")]
#[kube(plural = "grafanamutetimings")]
#[kube(status = "VersionedStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct MuteTimingSpec {
    #[serde(rename = "grafanaRef")]
    pub grafana_ref: GrafanaRef,
    /// grafana-side identifier of the mute timing
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "timeIntervals")]
    pub time_intervals: Vec<Value>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct VersionedStatus {
    #[serde(rename = "version", skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(rename = "syncStatus", skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<String>,
    #[serde(rename = "lastSynced", skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// -----------------------------------------------------------------------------
// GrafanaNotificationTemplate custom resource

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "monitoring.zengarden.space")]
#[kube(version = "v1")]
#[kube(kind = "GrafanaNotificationTemplate")]
#[kube(singular = "grafananotificationtemplate")]
#[kube(plural = "grafananotificationtemplates")]
#[kube(status = "VersionedStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct NotificationTemplateSpec {
    #[serde(rename = "grafanaRef")]
    pub grafana_ref: GrafanaRef,
    /// grafana-side identifier of the template
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "template")]
    pub template: String,
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to execute request on grafana api, {0}")]
    Grafana(grafana::Error),
    #[error("failed to create grafana client, {0}")]
    CreateClient(client::Error),
    #[error("failed to deserialize custom resource, {0}")]
    Deserialize(serde_json::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<grafana::Error> for ReconcilerError {
    fn from(err: grafana::Error) -> Self {
        Self::Grafana(err)
    }
}

impl From<client::Error> for ReconcilerError {
    fn from(err: client::Error) -> Self {
        Self::CreateClient(err)
    }
}

// -----------------------------------------------------------------------------
// payload helpers

pub fn alert_rule_payload(spec: &AlertRuleSpec, uid: Option<&str>) -> Value {
    let mut payload = serde_json::json!({
        "folderUID": spec.folder_uid,
        "ruleGroup": spec.rule_group,
        "title": spec.title,
        "condition": spec.condition,
        "noDataState": spec.no_data_state.as_deref().unwrap_or("NoData"),
        "execErrState": spec.exec_err_state.as_deref().unwrap_or("Alerting"),
        "for": spec.r#for.as_deref().unwrap_or("0s"),
        "annotations": spec.annotations.to_owned().unwrap_or_default(),
        "labels": spec.labels.to_owned().unwrap_or_default(),
        "data": spec.data,
    });

    if let Some(uid) = uid {
        payload["uid"] = uid.into();
    }

    payload
}

pub fn policy_payload(spec: &NotificationPolicySpec) -> Value {
    let group_by = spec
        .group_by
        .to_owned()
        .unwrap_or_else(|| vec!["grafana_folder".to_string(), "alertname".to_string()]);

    let mut payload = serde_json::json!({
        "receiver": spec.receiver,
        "group_by": group_by,
        "group_wait": spec.group_wait.as_deref().unwrap_or("30s"),
        "group_interval": spec.group_interval.as_deref().unwrap_or("5m"),
        "repeat_interval": spec.repeat_interval.as_deref().unwrap_or("4h"),
    });

    if let Some(matchers) = &spec.matchers {
        payload["object_matchers"] = matchers
            .iter()
            .map(|matcher| {
                serde_json::json!([matcher.label, matcher.r#match, matcher.value])
            })
            .collect::<Vec<_>>()
            .into();
    }

    if let Some(intervals) = &spec.mute_time_intervals {
        payload["mute_time_intervals"] = serde_json::json!(intervals);
    }

    if let Some(routes) = &spec.routes {
        payload["routes"] = serde_json::json!(routes);
    }

    payload
}

pub fn mute_timing_payload(spec: &MuteTimingSpec) -> Value {
    serde_json::json!({
        "name": spec.name,
        "time_intervals": spec.time_intervals,
    })
}

pub fn template_payload(spec: &NotificationTemplateSpec) -> Value {
    serde_json::json!({
        "name": spec.name,
        "template": spec.template,
    })
}

// -----------------------------------------------------------------------------
// synchronization helpers
//
// these operate on the gateway alone and return the status to write back, so
// that tests can drive them against an in-memory implementation

/// uid recorded on the status, the authoritative key across updates
fn status_uid(obj: &GrafanaAlertRule) -> Option<&str> {
    obj.status
        .as_ref()
        .and_then(|status| status.uid.as_deref())
        .filter(|uid| !uid.is_empty())
}

pub async fn sync_alert_rule(
    api: &dyn grafana::Api,
    obj: &GrafanaAlertRule,
) -> Result<Value, grafana::Error> {
    let uid = status_uid(obj);
    let existing = match uid {
        Some(uid) => api.get_alert_rule(uid).await?,
        None => None,
    };

    let result = match (uid, existing) {
        (Some(uid), Some(_)) => {
            let result = api
                .update_alert_rule(uid, &alert_rule_payload(&obj.spec, Some(uid)))
                .await?;
            info!(uid = uid, "Updated alert rule");
            result
        }
        _ => {
            let result = api
                .create_alert_rule(&alert_rule_payload(&obj.spec, None))
                .await?;
            let created_uid = result.get("uid").and_then(Value::as_str).unwrap_or_default();
            info!(uid = created_uid, "Created alert rule");
            result
        }
    };

    Ok(serde_json::json!({
        "uid": result.get("uid").and_then(Value::as_str).unwrap_or_default(),
        "provenance": result.get("provenance").and_then(Value::as_str).unwrap_or_default(),
        "syncStatus": SYNC_STATUS_SYNCED,
        "lastSynced": k8s::timestamp(),
        "message": "",
    }))
}

pub async fn sync_notification_policy(
    api: &dyn grafana::Api,
    obj: &GrafanaNotificationPolicy,
) -> Result<Value, grafana::Error> {
    // the policy is a singleton tree, the put replaces it whole
    api.get_notification_policy().await?;
    api.put_notification_policy(&policy_payload(&obj.spec)).await?;
    info!("Updated notification policy");

    Ok(serde_json::json!({
        "syncStatus": SYNC_STATUS_SYNCED,
        "lastSynced": k8s::timestamp(),
        "message": "",
    }))
}

pub async fn sync_mute_timing(
    api: &dyn grafana::Api,
    obj: &GrafanaMuteTiming,
) -> Result<Value, grafana::Error> {
    let name = &obj.spec.name;
    let payload = mute_timing_payload(&obj.spec);

    let result = match api.get_mute_timing(name).await? {
        Some(_) => {
            let result = api.update_mute_timing(name, &payload).await?;
            info!(name = name, "Updated mute timing");
            result
        }
        None => {
            let result = api.create_mute_timing(&payload).await?;
            info!(name = name, "Created mute timing");
            result
        }
    };

    Ok(serde_json::json!({
        "version": result.get("version").and_then(Value::as_i64).unwrap_or(0),
        "syncStatus": SYNC_STATUS_SYNCED,
        "lastSynced": k8s::timestamp(),
        "message": "",
    }))
}

pub async fn sync_notification_template(
    api: &dyn grafana::Api,
    obj: &GrafanaNotificationTemplate,
) -> Result<Value, grafana::Error> {
    let name = &obj.spec.name;
    let existing = api.get_template(name).await?;
    let result = api.put_template(name, &template_payload(&obj.spec)).await?;

    match existing {
        Some(_) => info!(name = name, "Updated template"),
        None => info!(name = name, "Created template"),
    }

    Ok(serde_json::json!({
        "version": result.get("version").and_then(Value::as_i64).unwrap_or(0),
        "syncStatus": SYNC_STATUS_SYNCED,
        "lastSynced": k8s::timestamp(),
        "message": "",
    }))
}

pub async fn remove_alert_rule(
    api: &dyn grafana::Api,
    obj: &GrafanaAlertRule,
) -> Result<(), grafana::Error> {
    match status_uid(obj) {
        Some(uid) => {
            api.delete_alert_rule(uid).await?;
            info!(uid = uid, "Deleted alert rule");
            Ok(())
        }
        None => {
            info!("No uid in status, nothing to delete");
            Ok(())
        }
    }
}

// -----------------------------------------------------------------------------
// Connector trait

/// resolves a grafana reference into a gateway; production resolves the
/// secret and speaks http, tests plug an in-memory gateway
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        reference: &GrafanaRef,
        default_namespace: &str,
    ) -> Result<Arc<dyn grafana::Api>, ReconcilerError>;
}

pub struct HttpConnector {
    kube: kube::Client,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(kube: kube::Client, timeout: Duration) -> Self {
        Self { kube, timeout }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        reference: &GrafanaRef,
        default_namespace: &str,
    ) -> Result<Arc<dyn grafana::Api>, ReconcilerError> {
        let connection =
            client::try_from_secret(self.kube.to_owned(), &reference.secret_ref, default_namespace)
                .await?;

        Ok(Arc::new(client::Http::try_new(&connection, self.timeout)?))
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

pub struct Reconciler {
    kube: kube::Client,
    connector: Arc<dyn Connector>,
}

impl Reconciler {
    pub fn new(kube: kube::Client, connector: Arc<dyn Connector>) -> Self {
        Self { kube, connector }
    }

    /// write the given status, a patch failure never masking the reconcile
    /// outcome
    async fn patch_status<K>(&self, namespace: &str, name: &str, status: Value)
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.kube.to_owned(), namespace);

        if let Err(err) = resource::patch_status(&api, name, status).await {
            warn!(
                namespace = namespace,
                name = name,
                error = err.to_string(),
                "Failed to update status of custom resource",
            );
        }
    }

    async fn mark_failed<K>(&self, namespace: &str, name: &str, message: &str)
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let status = serde_json::json!({
            "syncStatus": SYNC_STATUS_FAILED,
            "lastSynced": k8s::timestamp(),
            "message": message,
        });

        self.patch_status::<K>(namespace, name, status).await;
    }

    async fn reconcile_alert_rule(&self, obj: &GrafanaAlertRule) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj);
        let api = self.connector.connect(&obj.spec.grafana_ref, &namespace).await?;

        let status = sync_alert_rule(api.as_ref(), obj).await?;
        self.patch_status::<GrafanaAlertRule>(&namespace, &name, status)
            .await;

        Ok(())
    }

    async fn reconcile_notification_policy(
        &self,
        obj: &GrafanaNotificationPolicy,
    ) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj);
        let api = self.connector.connect(&obj.spec.grafana_ref, &namespace).await?;

        let status = sync_notification_policy(api.as_ref(), obj).await?;
        self.patch_status::<GrafanaNotificationPolicy>(&namespace, &name, status)
            .await;

        Ok(())
    }

    async fn reconcile_mute_timing(&self, obj: &GrafanaMuteTiming) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj);
        let api = self.connector.connect(&obj.spec.grafana_ref, &namespace).await?;

        let status = sync_mute_timing(api.as_ref(), obj).await?;
        self.patch_status::<GrafanaMuteTiming>(&namespace, &name, status)
            .await;

        Ok(())
    }

    async fn reconcile_notification_template(
        &self,
        obj: &GrafanaNotificationTemplate,
    ) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj);
        let api = self.connector.connect(&obj.spec.grafana_ref, &namespace).await?;

        let status = sync_notification_template(api.as_ref(), obj).await?;
        self.patch_status::<GrafanaNotificationTemplate>(&namespace, &name, status)
            .await;

        Ok(())
    }

    /// event-driven deletion; a resource vanished from a synchronization set
    /// is deliberately left alone
    async fn delete(&self, kind: &str, object: &Value) -> Result<(), ReconcilerError> {
        match kind {
            "GrafanaAlertRule" => {
                let obj: GrafanaAlertRule =
                    serde_json::from_value(object.to_owned()).map_err(ReconcilerError::Deserialize)?;
                let (namespace, _) = resource::namespaced_name(&obj);
                let api = self.connector.connect(&obj.spec.grafana_ref, &namespace).await?;

                remove_alert_rule(api.as_ref(), &obj).await?;
            }
            "GrafanaMuteTiming" => {
                let obj: GrafanaMuteTiming =
                    serde_json::from_value(object.to_owned()).map_err(ReconcilerError::Deserialize)?;
                let (namespace, _) = resource::namespaced_name(&obj);
                let api = self.connector.connect(&obj.spec.grafana_ref, &namespace).await?;

                api.delete_mute_timing(&obj.spec.name).await?;
                info!(name = &obj.spec.name, "Deleted mute timing");
            }
            "GrafanaNotificationTemplate" => {
                let obj: GrafanaNotificationTemplate =
                    serde_json::from_value(object.to_owned()).map_err(ReconcilerError::Deserialize)?;
                let (namespace, _) = resource::namespaced_name(&obj);
                let api = self.connector.connect(&obj.spec.grafana_ref, &namespace).await?;

                api.delete_template(&obj.spec.name).await?;
                info!(name = &obj.spec.name, "Deleted template");
            }
            // the notification policy tree has no deletion endpoint
            _ => {
                warn!(kind = kind, "No deletion handling for kind, skipping");
            }
        }

        Ok(())
    }

    async fn upsert(&self, kind: &str, object: &Value) -> Result<(), ReconcilerError> {
        match kind {
            "GrafanaAlertRule" => {
                let obj: GrafanaAlertRule =
                    serde_json::from_value(object.to_owned()).map_err(ReconcilerError::Deserialize)?;
                let (namespace, name) = resource::namespaced_name(&obj);

                if let Err(err) = self.reconcile_alert_rule(&obj).await {
                    self.mark_failed::<GrafanaAlertRule>(&namespace, &name, &err.to_string())
                        .await;
                    return Err(err);
                }
            }
            "GrafanaNotificationPolicy" => {
                let obj: GrafanaNotificationPolicy =
                    serde_json::from_value(object.to_owned()).map_err(ReconcilerError::Deserialize)?;
                let (namespace, name) = resource::namespaced_name(&obj);

                if let Err(err) = self.reconcile_notification_policy(&obj).await {
                    self.mark_failed::<GrafanaNotificationPolicy>(&namespace, &name, &err.to_string())
                        .await;
                    return Err(err);
                }
            }
            "GrafanaMuteTiming" => {
                let obj: GrafanaMuteTiming =
                    serde_json::from_value(object.to_owned()).map_err(ReconcilerError::Deserialize)?;
                let (namespace, name) = resource::namespaced_name(&obj);

                if let Err(err) = self.reconcile_mute_timing(&obj).await {
                    self.mark_failed::<GrafanaMuteTiming>(&namespace, &name, &err.to_string())
                        .await;
                    return Err(err);
                }
            }
            "GrafanaNotificationTemplate" => {
                let obj: GrafanaNotificationTemplate =
                    serde_json::from_value(object.to_owned()).map_err(ReconcilerError::Deserialize)?;
                let (namespace, name) = resource::namespaced_name(&obj);

                if let Err(err) = self.reconcile_notification_template(&obj).await {
                    self.mark_failed::<GrafanaNotificationTemplate>(
                        &namespace,
                        &name,
                        &err.to_string(),
                    )
                    .await;
                    return Err(err);
                }
            }
            _ => {
                warn!(kind = kind, "Unknown kind, skipping");
            }
        }

        Ok(())
    }

    /// full pass over every resource of the four kinds, isolating per-item
    /// failures
    async fn resync_all(&self) -> Result<(), ReconcilerError> {
        info!("Handling synchronization, reconciling every grafana resource");

        match resource::list::<GrafanaAlertRule>(self.kube.to_owned(), &Default::default()).await {
            Ok(rules) => {
                for rule in &rules {
                    if let Err(err) = self.reconcile_alert_rule(rule).await {
                        error!(error = err.to_string(), "Failed to reconcile alert rule");
                    }
                }
            }
            Err(err) => error!(error = err.to_string(), "Failed to list alert rules"),
        }

        match resource::list::<GrafanaNotificationPolicy>(self.kube.to_owned(), &Default::default())
            .await
        {
            Ok(policies) => {
                for policy in &policies {
                    if let Err(err) = self.reconcile_notification_policy(policy).await {
                        error!(
                            error = err.to_string(),
                            "Failed to reconcile notification policy",
                        );
                    }
                }
            }
            Err(err) => error!(error = err.to_string(), "Failed to list notification policies"),
        }

        match resource::list::<GrafanaMuteTiming>(self.kube.to_owned(), &Default::default()).await {
            Ok(timings) => {
                for timing in &timings {
                    if let Err(err) = self.reconcile_mute_timing(timing).await {
                        error!(error = err.to_string(), "Failed to reconcile mute timing");
                    }
                }
            }
            Err(err) => error!(error = err.to_string(), "Failed to list mute timings"),
        }

        match resource::list::<GrafanaNotificationTemplate>(self.kube.to_owned(), &Default::default())
            .await
        {
            Ok(templates) => {
                for template in &templates {
                    if let Err(err) = self.reconcile_notification_template(template).await {
                        error!(error = err.to_string(), "Failed to reconcile template");
                    }
                }
            }
            Err(err) => error!(error = err.to_string(), "Failed to list templates"),
        }

        Ok(())
    }
}

#[async_trait]
impl Handler for Reconciler {
    type Error = ReconcilerError;

    async fn handle(&mut self, bundle: &Bundle) -> Result<(), ReconcilerError> {
        let events = bundle.events();

        if events.is_empty() {
            // a synchronization binding may legitimately carry no object
            if bundle
                .bindings
                .iter()
                .any(|binding| binding.event_type() == EventType::Synchronization)
            {
                return self.resync_all().await;
            }

            warn!("No objects in binding context");
            return Ok(());
        }

        if events
            .iter()
            .any(|event| event.kind == EventType::Synchronization)
        {
            return self.resync_all().await;
        }

        for event in events {
            let kind = event
                .object
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or_default();

            match event.kind {
                EventType::Deleted => self.delete(kind, event.object).await?,
                _ => self.upsert(kind, event.object).await?,
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::svc::grafana::SecretRef;

    use super::*;

    fn grafana_ref() -> GrafanaRef {
        GrafanaRef {
            secret_ref: SecretRef {
                name: "grafana".to_string(),
                namespace: None,
                key: None,
            },
        }
    }

    /// in-memory provisioning api recording every call
    #[derive(Default)]
    struct InMemory {
        calls: Mutex<Vec<String>>,
        rules: Mutex<BTreeMap<String, Value>>,
        timings: Mutex<BTreeMap<String, Value>>,
        templates: Mutex<BTreeMap<String, Value>>,
        policy: Mutex<Option<Value>>,
    }

    impl InMemory {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().to_owned()
        }
    }

    #[async_trait]
    impl grafana::Api for InMemory {
        async fn get_alert_rule(&self, uid: &str) -> Result<Option<Value>, grafana::Error> {
            self.record(format!("get-rule {}", uid));
            Ok(self.rules.lock().unwrap().get(uid).cloned())
        }

        async fn create_alert_rule(&self, payload: &Value) -> Result<Value, grafana::Error> {
            self.record("create-rule");
            let uid = format!("uid-{}", self.rules.lock().unwrap().len() + 1);
            let mut stored = payload.to_owned();
            stored["uid"] = uid.to_owned().into();
            self.rules.lock().unwrap().insert(uid, stored.to_owned());
            Ok(stored)
        }

        async fn update_alert_rule(
            &self,
            uid: &str,
            payload: &Value,
        ) -> Result<Value, grafana::Error> {
            self.record(format!("update-rule {}", uid));
            self.rules
                .lock()
                .unwrap()
                .insert(uid.to_string(), payload.to_owned());
            Ok(payload.to_owned())
        }

        async fn delete_alert_rule(&self, uid: &str) -> Result<(), grafana::Error> {
            self.record(format!("delete-rule {}", uid));
            self.rules.lock().unwrap().remove(uid);
            Ok(())
        }

        async fn get_notification_policy(&self) -> Result<Value, grafana::Error> {
            self.record("get-policy");
            Ok(self
                .policy
                .lock()
                .unwrap()
                .to_owned()
                .unwrap_or_else(|| serde_json::json!({"receiver": "default"})))
        }

        async fn put_notification_policy(&self, payload: &Value) -> Result<Value, grafana::Error> {
            self.record("put-policy");
            *self.policy.lock().unwrap() = Some(payload.to_owned());
            Ok(serde_json::json!({"message": "policies updated"}))
        }

        async fn get_mute_timing(&self, name: &str) -> Result<Option<Value>, grafana::Error> {
            self.record(format!("get-timing {}", name));
            Ok(self.timings.lock().unwrap().get(name).cloned())
        }

        async fn create_mute_timing(&self, payload: &Value) -> Result<Value, grafana::Error> {
            self.record("create-timing");
            let name = payload["name"].as_str().unwrap_or_default().to_string();
            let mut stored = payload.to_owned();
            stored["version"] = 1.into();
            self.timings.lock().unwrap().insert(name, stored.to_owned());
            Ok(stored)
        }

        async fn update_mute_timing(
            &self,
            name: &str,
            payload: &Value,
        ) -> Result<Value, grafana::Error> {
            self.record(format!("update-timing {}", name));
            let version = self
                .timings
                .lock()
                .unwrap()
                .get(name)
                .and_then(|timing| timing.get("version"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let mut stored = payload.to_owned();
            stored["version"] = (version + 1).into();
            self.timings
                .lock()
                .unwrap()
                .insert(name.to_string(), stored.to_owned());
            Ok(stored)
        }

        async fn delete_mute_timing(&self, name: &str) -> Result<(), grafana::Error> {
            self.record(format!("delete-timing {}", name));
            self.timings.lock().unwrap().remove(name);
            Ok(())
        }

        async fn get_template(&self, name: &str) -> Result<Option<Value>, grafana::Error> {
            self.record(format!("get-template {}", name));
            Ok(self.templates.lock().unwrap().get(name).cloned())
        }

        async fn put_template(&self, name: &str, payload: &Value) -> Result<Value, grafana::Error> {
            self.record(format!("put-template {}", name));
            let mut stored = payload.to_owned();
            stored["version"] = 1.into();
            self.templates
                .lock()
                .unwrap()
                .insert(name.to_string(), stored.to_owned());
            Ok(stored)
        }

        async fn delete_template(&self, name: &str) -> Result<(), grafana::Error> {
            self.record(format!("delete-template {}", name));
            self.templates.lock().unwrap().remove(name);
            Ok(())
        }
    }

    fn alert_rule(status: Option<AlertRuleStatus>) -> GrafanaAlertRule {
        let mut obj = GrafanaAlertRule::new(
            "high-load",
            AlertRuleSpec {
                grafana_ref: grafana_ref(),
                folder_uid: "folder-1".to_string(),
                rule_group: "node".to_string(),
                title: "High load".to_string(),
                condition: "C".to_string(),
                no_data_state: None,
                exec_err_state: None,
                r#for: Some("5m".to_string()),
                annotations: None,
                labels: None,
                data: vec![serde_json::json!({"refId": "A"})],
            },
        );
        obj.metadata.namespace = Some("monitoring".to_string());
        obj.status = status;
        obj
    }

    #[test]
    fn alert_rule_payload_applies_documented_defaults() {
        let obj = alert_rule(None);
        let payload = alert_rule_payload(&obj.spec, None);

        assert_eq!(payload["noDataState"], "NoData");
        assert_eq!(payload["execErrState"], "Alerting");
        assert_eq!(payload["for"], "5m");
        assert!(payload.get("uid").is_none());

        let with_uid = alert_rule_payload(&obj.spec, Some("u1"));
        assert_eq!(with_uid["uid"], "u1");
    }

    #[test]
    fn policy_payload_folds_matchers_into_triples() {
        let spec = NotificationPolicySpec {
            grafana_ref: grafana_ref(),
            receiver: "oncall".to_string(),
            group_by: None,
            group_wait: None,
            group_interval: None,
            repeat_interval: None,
            matchers: Some(vec![Matcher {
                label: "severity".to_string(),
                r#match: "=".to_string(),
                value: "critical".to_string(),
            }]),
            mute_time_intervals: Some(vec!["nights".to_string()]),
            routes: None,
        };

        let payload = policy_payload(&spec);

        assert_eq!(
            payload["group_by"],
            serde_json::json!(["grafana_folder", "alertname"])
        );
        assert_eq!(payload["group_wait"], "30s");
        assert_eq!(payload["group_interval"], "5m");
        assert_eq!(payload["repeat_interval"], "4h");
        assert_eq!(
            payload["object_matchers"],
            serde_json::json!([["severity", "=", "critical"]])
        );
        assert_eq!(payload["mute_time_intervals"], serde_json::json!(["nights"]));
        assert!(payload.get("routes").is_none());
    }

    #[tokio::test]
    async fn alert_rule_without_uid_is_created_then_updated() {
        let api = InMemory::default();

        // first reconcile allocates a uid through a post
        let status = sync_alert_rule(&api, &alert_rule(None)).await.unwrap();
        assert_eq!(status["uid"], "uid-1");
        assert_eq!(status["syncStatus"], SYNC_STATUS_SYNCED);
        assert_eq!(api.calls(), vec!["create-rule"]);

        // the next reconcile observes the recorded uid and puts
        let recorded = alert_rule(Some(AlertRuleStatus {
            uid: Some("uid-1".to_string()),
            ..Default::default()
        }));
        let status = sync_alert_rule(&api, &recorded).await.unwrap();
        assert_eq!(status["uid"], "uid-1");
        assert_eq!(
            api.calls(),
            vec!["create-rule", "get-rule uid-1", "update-rule uid-1"]
        );
    }

    #[tokio::test]
    async fn alert_rule_with_stale_uid_is_recreated() {
        let api = InMemory::default();
        let stale = alert_rule(Some(AlertRuleStatus {
            uid: Some("gone".to_string()),
            ..Default::default()
        }));

        let status = sync_alert_rule(&api, &stale).await.unwrap();

        assert_eq!(status["uid"], "uid-1");
        assert_eq!(api.calls(), vec!["get-rule gone", "create-rule"]);
    }

    #[tokio::test]
    async fn mute_timing_is_created_then_versioned_on_update() {
        let api = InMemory::default();
        let mut obj = GrafanaMuteTiming::new(
            "nights",
            MuteTimingSpec {
                grafana_ref: grafana_ref(),
                name: "nights".to_string(),
                time_intervals: vec![serde_json::json!({"weekdays": ["saturday"]})],
            },
        );
        obj.metadata.namespace = Some("monitoring".to_string());

        let status = sync_mute_timing(&api, &obj).await.unwrap();
        assert_eq!(status["version"], 1);

        let status = sync_mute_timing(&api, &obj).await.unwrap();
        assert_eq!(status["version"], 2);
    }

    #[tokio::test]
    async fn template_upsert_is_a_put_either_way() {
        let api = InMemory::default();
        let mut obj = GrafanaNotificationTemplate::new(
            "slack",
            NotificationTemplateSpec {
                grafana_ref: grafana_ref(),
                name: "slack".to_string(),
                template: "{{ define \"slack\" }}{{ end }}".to_string(),
            },
        );
        obj.metadata.namespace = Some("monitoring".to_string());

        sync_notification_template(&api, &obj).await.unwrap();
        sync_notification_template(&api, &obj).await.unwrap();

        assert_eq!(
            api.calls(),
            vec![
                "get-template slack",
                "put-template slack",
                "get-template slack",
                "put-template slack",
            ]
        );
    }

    #[tokio::test]
    async fn deletion_without_recorded_uid_is_a_no_op() {
        let api = InMemory::default();

        remove_alert_rule(&api, &alert_rule(None)).await.unwrap();

        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn policy_put_replaces_the_tree() {
        let api = InMemory::default();
        let mut obj = GrafanaNotificationPolicy::new(
            "root",
            NotificationPolicySpec {
                grafana_ref: grafana_ref(),
                receiver: "oncall".to_string(),
                group_by: None,
                group_wait: None,
                group_interval: None,
                repeat_interval: None,
                matchers: None,
                mute_time_intervals: None,
                routes: None,
            },
        );
        obj.metadata.namespace = Some("monitoring".to_string());

        sync_notification_policy(&api, &obj).await.unwrap();

        assert_eq!(api.calls(), vec!["get-policy", "put-policy"]);
        assert_eq!(
            api.policy.lock().unwrap().as_ref().unwrap()["receiver"],
            "oncall"
        );
    }
}
