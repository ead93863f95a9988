//! # Resource module
//!
//! This module provide helpers on kubernetes resources implementing the
//! idempotent upsert contract shared by every reconciler

use std::fmt::Debug;

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::OwnerReference, ClusterResourceScope,
    NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, CustomResourceExt, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as
/// deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource.
///
/// # Panic
///
/// panic if the namespace or name is null which is impossible btw
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (
        obj.namespace()
            .expect("resource to be owned by a namespace"),
        obj.name_any(),
    )
}

/// returns a controller owner reference pointing to the given custom
/// resource, so that the garbage collector cascades on its deletion
pub fn owner_reference<T>(obj: &T) -> OwnerReference
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    OwnerReference {
        api_version: api_resource.api_version,
        kind: api_resource.kind,
        name: obj.name_any(),
        uid: obj
            .uid()
            .expect("to have an unique identifier provided by kubernetes"),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// retrieve the namespaced resource, a http 404 answer translating to `None`
pub async fn get<K>(client: Client, namespace: &str, name: &str) -> Result<Option<K>, kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, namespace);

    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(err) => Err(err),
    }
}

/// retrieve the cluster-scoped resource, a http 404 answer translating to
/// `None`
pub async fn get_cluster<K>(client: Client, name: &str) -> Result<Option<K>, kube::Error>
where
    K: Resource<Scope = ClusterResourceScope> + Clone + Debug + DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::all(client);

    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(err) => Err(err),
    }
}

/// create the resource when absent, replace it whole when present. The
/// replacement carries the observed resourceVersion over, so a conflicting
/// foreign write surfaces as an api error and the next reconcile converges.
pub async fn upsert<K>(client: Client, desired: &K) -> Result<K, kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + ResourceExt,
    <K as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(desired);
    let api: Api<K> = Api::namespaced(client.to_owned(), &namespace);

    match get::<K>(client, &namespace, &name).await? {
        Some(current) => {
            debug!(
                namespace = &namespace,
                name = &name,
                "Replace already existing resource",
            );

            let mut desired = desired.to_owned();
            desired.meta_mut().resource_version = current.meta().resource_version.to_owned();
            api.replace(&name, &PostParams::default(), &desired).await
        }
        None => {
            debug!(namespace = &namespace, name = &name, "Create resource");
            api.create(&PostParams::default(), desired).await
        }
    }
}

/// list the resource across every namespace. A http 404 answer translates to
/// an empty list, so that a custom resource definition not registered yet is
/// not an error.
pub async fn list<K>(client: Client, params: &ListParams) -> Result<Vec<K>, kube::Error>
where
    K: Resource + Clone + Debug + DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::all(client);

    match api.list(params).await {
        Ok(objects) => Ok(objects.items),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

/// list the resource within the given namespace, a http 404 answer
/// translating to an empty list
pub async fn list_namespaced<K>(
    client: Client,
    namespace: &str,
    params: &ListParams,
) -> Result<Vec<K>, kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, namespace);

    match api.list(params).await {
        Ok(objects) => Ok(objects.items),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

/// delete the namespaced resource, a http 404 answer meaning it is already
/// gone
pub async fn delete<K>(client: Client, namespace: &str, name: &str) -> Result<(), kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, namespace);

    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}

/// merge-patch the `/status` subresource of the given resource
pub async fn patch_status<K>(api: &Api<K>, name: &str, status: Value) -> Result<K, kube::Error>
where
    K: Clone + Debug + DeserializeOwned,
{
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await
}
