//! # Client module
//!
//! This module provide an helper to create a kubernetes client

use std::{convert::TryFrom, path::PathBuf};

use kube::{
    config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
    Config,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read kubernetes configuration file, {0}")]
    Kubeconfig(KubeconfigError),
    #[error("failed to create kubernetes client, {0}")]
    CreateClient(kube::Error),
}

// -----------------------------------------------------------------------------
// helpers

/// returns a new kubernetes client from the given kubeconfig path if defined,
/// or infer the configuration from the environment (in-cluster service
/// account or default kubeconfig locations)
pub async fn try_new(path: Option<PathBuf>) -> Result<kube::Client, Error> {
    match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(Error::Kubeconfig)?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(Error::Kubeconfig)?;

            kube::Client::try_from(config).map_err(Error::CreateClient)
        }
        None => kube::Client::try_default().await.map_err(Error::CreateClient),
    }
}
