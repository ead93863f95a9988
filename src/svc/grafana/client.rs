//! # Client module
//!
//! This module provides the http implementation of the grafana gateway and
//! the resolution of its connection parameters from a cluster secret

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Method, StatusCode,
};
use serde_json::Value;

use crate::svc::{
    grafana::{self, SecretRef},
    k8s::resource,
};

// -----------------------------------------------------------------------------
// Constants

pub const TOKEN_KEY: &str = "token";
pub const URL_KEY: &str = "url";
pub const ORG_ID_KEY: &str = "orgId";
pub const ORG_ID_HEADER: &str = "X-Grafana-Org-Id";
pub const DISABLE_PROVENANCE_HEADER: &str = "X-Disable-Provenance";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("failed to find secret '{0}/{1}'")]
    SecretNotFound(String, String),
    #[error("failed to retrieve data from secret '{0}/{1}'")]
    SecretData(String, String),
    #[error("failed to find key '{0}' in secret '{1}/{2}'")]
    SecretKey(String, String, String),
    #[error("failed to decode key '{0}' of secret '{1}/{2}' as utf-8, {3}")]
    Utf8(String, String, String, std::string::FromUtf8Error),
    #[error("failed to parse organisation identifier '{0}', {1}")]
    OrgId(String, std::num::ParseIntError),
    #[error("failed to build grafana http client, {0}")]
    Build(reqwest::Error),
    #[error("failed to build http header '{0}' from connection parameters")]
    Header(&'static str),
}

// -----------------------------------------------------------------------------
// Connection structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Connection {
    pub url: String,
    pub token: String,
    pub org_id: i64,
}

/// resolve the grafana connection parameters from the referenced secret,
/// defaulting the namespace to the given one and the token key to `token`
pub async fn try_from_secret(
    client: kube::Client,
    reference: &SecretRef,
    default_namespace: &str,
) -> Result<Connection, Error> {
    let namespace = reference
        .namespace
        .as_deref()
        .unwrap_or(default_namespace)
        .to_string();
    let name = reference.name.to_owned();
    let token_key = reference.key.as_deref().unwrap_or(TOKEN_KEY).to_string();

    let secret: Secret = resource::get(client, &namespace, &name)
        .await
        .map_err(Error::Kube)?
        .ok_or_else(|| Error::SecretNotFound(namespace.to_owned(), name.to_owned()))?;

    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::SecretData(namespace.to_owned(), name.to_owned()))?;

    let token = decode(&namespace, &name, &token_key, data.get(&token_key))?;
    let url = decode(&namespace, &name, URL_KEY, data.get(URL_KEY))?;
    let org_id = match data.get(ORG_ID_KEY) {
        Some(_) => {
            let raw = decode(&namespace, &name, ORG_ID_KEY, data.get(ORG_ID_KEY))?;
            raw.trim().parse().map_err(|err| Error::OrgId(raw, err))?
        }
        None => 1,
    };

    Ok(Connection {
        url: url.trim_end_matches('/').to_string(),
        token,
        org_id,
    })
}

/// secrets hold raw bytes; the grafana connection keys are utf-8 text
fn decode(
    namespace: &str,
    name: &str,
    key: &str,
    value: Option<&k8s_openapi::ByteString>,
) -> Result<String, Error> {
    let bytes = value
        .ok_or_else(|| Error::SecretKey(key.into(), namespace.into(), name.into()))?
        .0
        .to_owned();

    String::from_utf8(bytes)
        .map_err(|err| Error::Utf8(key.into(), namespace.into(), name.into(), err))
}

// -----------------------------------------------------------------------------
// Http structure

/// grafana gateway over http, carrying the bearer token, organisation and
/// provenance headers on every request
pub struct Http {
    inner: reqwest::Client,
    base: String,
}

impl Http {
    pub fn try_new(connection: &Connection, timeout: Duration) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();

        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {}", connection.token))
                .map_err(|_| Error::Header("authorization"))?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(
            ORG_ID_HEADER,
            HeaderValue::from_str(&connection.org_id.to_string())
                .map_err(|_| Error::Header(ORG_ID_HEADER))?,
        );
        headers.insert(DISABLE_PROVENANCE_HEADER, HeaderValue::from_static("true"));

        let inner = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(Error::Build)?;

        Ok(Self {
            inner,
            base: connection.url.to_owned(),
        })
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Value>,
    ) -> Result<reqwest::Response, grafana::Error> {
        let mut builder = self.inner.request(method, format!("{}{}", self.base, path));

        if let Some(payload) = payload {
            builder = builder.json(payload);
        }

        builder.send().await.map_err(grafana::Error::Request)
    }

    /// read a successful json answer, any other status being an error
    async fn read(path: &str, response: reqwest::Response) -> Result<Value, grafana::Error> {
        let status = response.status();

        if !status.is_success() {
            return Err(grafana::Error::Status(
                status.as_u16(),
                path.to_string(),
                response.text().await.unwrap_or_default(),
            ));
        }

        response.json().await.map_err(grafana::Error::Deserialize)
    }

    /// read an answer where a http 404 means the object is absent
    async fn read_opt(
        path: &str,
        response: reqwest::Response,
    ) -> Result<Option<Value>, grafana::Error> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Self::read(path, response).await.map(Some)
    }

    /// read a deletion answer, a http 404 meaning already-gone
    async fn read_deleted(path: &str, response: reqwest::Response) -> Result<(), grafana::Error> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }

        Err(grafana::Error::Status(
            status.as_u16(),
            path.to_string(),
            response.text().await.unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl grafana::Api for Http {
    async fn get_alert_rule(&self, uid: &str) -> Result<Option<Value>, grafana::Error> {
        let path = format!("{}/{}", grafana::ALERT_RULES_PATH, uid);
        let response = self.execute(Method::GET, &path, None).await?;

        Self::read_opt(&path, response).await
    }

    async fn create_alert_rule(&self, payload: &Value) -> Result<Value, grafana::Error> {
        let path = grafana::ALERT_RULES_PATH;
        let response = self.execute(Method::POST, path, Some(payload)).await?;

        Self::read(path, response).await
    }

    async fn update_alert_rule(&self, uid: &str, payload: &Value) -> Result<Value, grafana::Error> {
        let path = format!("{}/{}", grafana::ALERT_RULES_PATH, uid);
        let response = self.execute(Method::PUT, &path, Some(payload)).await?;

        Self::read(&path, response).await
    }

    async fn delete_alert_rule(&self, uid: &str) -> Result<(), grafana::Error> {
        let path = format!("{}/{}", grafana::ALERT_RULES_PATH, uid);
        let response = self.execute(Method::DELETE, &path, None).await?;

        Self::read_deleted(&path, response).await
    }

    async fn get_notification_policy(&self) -> Result<Value, grafana::Error> {
        let path = grafana::POLICIES_PATH;
        let response = self.execute(Method::GET, path, None).await?;

        Self::read(path, response).await
    }

    async fn put_notification_policy(&self, payload: &Value) -> Result<Value, grafana::Error> {
        let path = grafana::POLICIES_PATH;
        let response = self.execute(Method::PUT, path, Some(payload)).await?;

        Self::read(path, response).await
    }

    async fn get_mute_timing(&self, name: &str) -> Result<Option<Value>, grafana::Error> {
        let path = format!("{}/{}", grafana::MUTE_TIMINGS_PATH, name);
        let response = self.execute(Method::GET, &path, None).await?;

        Self::read_opt(&path, response).await
    }

    async fn create_mute_timing(&self, payload: &Value) -> Result<Value, grafana::Error> {
        let path = grafana::MUTE_TIMINGS_PATH;
        let response = self.execute(Method::POST, path, Some(payload)).await?;

        Self::read(path, response).await
    }

    async fn update_mute_timing(
        &self,
        name: &str,
        payload: &Value,
    ) -> Result<Value, grafana::Error> {
        let path = format!("{}/{}", grafana::MUTE_TIMINGS_PATH, name);
        let response = self.execute(Method::PUT, &path, Some(payload)).await?;

        Self::read(&path, response).await
    }

    async fn delete_mute_timing(&self, name: &str) -> Result<(), grafana::Error> {
        let path = format!("{}/{}", grafana::MUTE_TIMINGS_PATH, name);
        let response = self.execute(Method::DELETE, &path, None).await?;

        Self::read_deleted(&path, response).await
    }

    async fn get_template(&self, name: &str) -> Result<Option<Value>, grafana::Error> {
        let path = format!("{}/{}", grafana::TEMPLATES_PATH, name);
        let response = self.execute(Method::GET, &path, None).await?;

        Self::read_opt(&path, response).await
    }

    async fn put_template(&self, name: &str, payload: &Value) -> Result<Value, grafana::Error> {
        let path = format!("{}/{}", grafana::TEMPLATES_PATH, name);
        let response = self.execute(Method::PUT, &path, Some(payload)).await?;

        Self::read(&path, response).await
    }

    async fn delete_template(&self, name: &str) -> Result<(), grafana::Error> {
        let path = format!("{}/{}", grafana::TEMPLATES_PATH, name);
        let response = self.execute(Method::DELETE, &path, None).await?;

        Self::read_deleted(&path, response).await
    }
}
