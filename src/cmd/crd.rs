//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface function
//! implementation

use kube::CustomResourceExt;

use crate::svc::crd::{
    composite_ingress_host::CompositeIngressHost,
    derived_secret::DerivedSecret,
    grafana::{
        GrafanaAlertRule, GrafanaMuteTiming, GrafanaNotificationPolicy,
        GrafanaNotificationTemplate,
    },
    partial_ingress::PartialIngress,
    user::User,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// view function

/// print every custom resource definition of the operators as yaml
pub fn view() -> Result<(), Error> {
    let crds = vec![
        serde_yaml::to_string(&DerivedSecret::crd()).map_err(Error::Serialize)?,
        serde_yaml::to_string(&PartialIngress::crd()).map_err(Error::Serialize)?,
        serde_yaml::to_string(&CompositeIngressHost::crd()).map_err(Error::Serialize)?,
        serde_yaml::to_string(&GrafanaAlertRule::crd()).map_err(Error::Serialize)?,
        serde_yaml::to_string(&GrafanaNotificationPolicy::crd()).map_err(Error::Serialize)?,
        serde_yaml::to_string(&GrafanaMuteTiming::crd()).map_err(Error::Serialize)?,
        serde_yaml::to_string(&GrafanaNotificationTemplate::crd()).map_err(Error::Serialize)?,
        serde_yaml::to_string(&User::crd()).map_err(Error::Serialize)?,
    ];

    print!("{}", crds.join("---\n"));
    Ok(())
}
