//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::svc::{
    cfg::{self, Configuration},
    crd::{derived_secret, grafana, partial_ingress, user},
    dispatch::{self, Dispatcher, Handler},
    k8s::client,
    kdf,
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(
        &self,
        kubeconfig: Option<PathBuf>,
        config: Arc<Configuration>,
    ) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to read configuration, {0}")]
    Configuration(cfg::Error),
    #[error("failed to run dispatch loop, {0}")]
    Dispatch(dispatch::Error),
    #[error("failed to interact with custom resource definitions, {0}")]
    CustomResourceDefinition(crd::Error),
}

impl From<client::Error> for Error {
    fn from(err: client::Error) -> Self {
        Self::Client(err)
    }
}

impl From<dispatch::Error> for Error {
    fn from(err: dispatch::Error) -> Self {
        Self::Dispatch(err)
    }
}

impl From<crd::Error> for Error {
    fn from(err: crd::Error) -> Self {
        Self::CustomResourceDefinition(err)
    }
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the derived secret controller
    #[command(name = "derived-secret")]
    DerivedSecret,
    /// Run the partial ingress controller
    #[command(name = "partial-ingress")]
    PartialIngress,
    /// Run the grafana alerting controller
    #[command(name = "grafana-alert")]
    GrafanaAlert,
    /// Run the rbac controller
    #[command(name = "rbac")]
    Rbac,
    /// Print the custom resource definitions as yaml
    #[command(name = "custom-resource-definition", alias = "crd")]
    CustomResourceDefinition,
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(
        &self,
        kubeconfig: Option<PathBuf>,
        config: Arc<Configuration>,
    ) -> Result<(), Self::Error> {
        match self {
            Self::DerivedSecret => derived_secret_daemon(kubeconfig, config).await,
            Self::PartialIngress => partial_ingress_daemon(kubeconfig, config).await,
            Self::GrafanaAlert => grafana_alert_daemon(kubeconfig, config).await,
            Self::Rbac => rbac_daemon(kubeconfig, config).await,
            Self::CustomResourceDefinition => Ok(crd::view()?),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

// -----------------------------------------------------------------------------
// daemon functions

/// run the dispatch loop of one controller until termination
async fn serve<H>(config: &Configuration, handler: H) -> Result<(), Error>
where
    H: Handler + Send,
{
    let dispatcher = Dispatcher::new(
        config.shared.directory.to_owned(),
        Duration::from_millis(config.shared.poll_interval),
        handler,
    );

    Ok(dispatcher.run().await?)
}

pub async fn derived_secret_daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), Error> {
    // an unreadable master password aborts startup
    let master = config.read_master_password().map_err(Error::Configuration)?;
    let params = kdf::Params::from(&config.argon2);

    info!(
        time_cost = params.time_cost,
        memory_cost = params.memory_cost,
        parallelism = params.parallelism,
        "Argon2 configuration",
    );

    let kube = client::try_new(kubeconfig).await?;

    info!("Start to listen for events of derived secret custom resources");
    serve(
        &config,
        derived_secret::Reconciler::new(kube, master, params),
    )
    .await
}

pub async fn partial_ingress_daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), Error> {
    let kube = client::try_new(kubeconfig).await?;

    info!("Start to listen for events of partial ingress custom resources");
    serve(&config, partial_ingress::Reconciler::new(kube)).await
}

pub async fn grafana_alert_daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), Error> {
    let kube = client::try_new(kubeconfig).await?;
    let connector = Arc::new(grafana::HttpConnector::new(
        kube.to_owned(),
        Duration::from_secs(config.http.timeout),
    ));

    info!("Start to listen for events of grafana custom resources");
    serve(&config, grafana::Reconciler::new(kube, connector)).await
}

pub async fn rbac_daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), Error> {
    let kube = client::try_new(kubeconfig).await?;
    let resync = Duration::from_secs(config.rbac.resync_interval);

    info!("Start to listen for events of user custom resources");
    serve(&config, user::Reconciler::new(kube, resync)).await
}
