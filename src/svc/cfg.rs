//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::warn;

// -----------------------------------------------------------------------------
// Constants

pub const SHARED_DIRECTORY: &str = "/shared";
pub const SHARED_POLL_INTERVAL: i64 = 100;
pub const ARGON2_TIME_COST: i64 = 3;
pub const ARGON2_MEMORY_COST: i64 = 65536;
pub const ARGON2_PARALLELISM: i64 = 4;
pub const MASTER_PASSWORD_PATH: &str = "/master-password/master-password";
pub const RBAC_RESYNC_INTERVAL: i64 = 300;
pub const HTTP_TIMEOUT: i64 = 30;

// -----------------------------------------------------------------------------
// Shared structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Shared {
    #[serde(rename = "directory")]
    pub directory: PathBuf,
    /// scan period of the dispatcher directory, in milliseconds
    #[serde(rename = "pollInterval")]
    pub poll_interval: u64,
}

// -----------------------------------------------------------------------------
// Argon2 structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Argon2 {
    #[serde(rename = "timeCost")]
    pub time_cost: u32,
    /// memory cost in kibibytes
    #[serde(rename = "memoryCost")]
    pub memory_cost: u32,
    #[serde(rename = "parallelism")]
    pub parallelism: u32,
}

// -----------------------------------------------------------------------------
// MasterPassword structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct MasterPassword {
    #[serde(rename = "path")]
    pub path: PathBuf,
}

// -----------------------------------------------------------------------------
// Rbac structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Rbac {
    /// full reconciliation period, in seconds
    #[serde(rename = "resyncInterval")]
    pub resync_interval: u64,
}

// -----------------------------------------------------------------------------
// Http structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Http {
    /// per-call deadline for grafana round-trips, in seconds
    #[serde(rename = "timeout")]
    pub timeout: u64,
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to read master password file '{0}', {1}")]
    MasterPassword(PathBuf, std::io::Error),
}

// -----------------------------------------------------------------------------
// Configuration structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "shared")]
    pub shared: Shared,
    #[serde(rename = "argon2")]
    pub argon2: Argon2,
    #[serde(rename = "masterPassword")]
    pub master_password: MasterPassword,
    #[serde(rename = "rbac")]
    pub rbac: Rbac,
    #[serde(rename = "http")]
    pub http: Http,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        builder()?
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        builder()?
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// returns the master password, trimmed of surrounding whitespace
    pub fn read_master_password(&self) -> Result<String, Error> {
        let path = &self.master_password.path;

        std::fs::read_to_string(path)
            .map(|password| password.trim().to_string())
            .map_err(|err| Error::MasterPassword(path.to_owned(), err))
    }

    /// Prints a message about suspicious configuration values
    pub fn help(&self) {
        if self.argon2.memory_cost < 8 * self.argon2.parallelism {
            warn!(
                "Configuration key 'argon2.memoryCost' is below the minimum accepted by argon2id"
            );
        }

        if self.shared.poll_interval == 0 {
            warn!("Configuration key 'shared.pollInterval' is zero, the scan loop will busy-wait");
        }
    }
}

fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, Error> {
    Ok(Config::builder()
        .set_default("shared.directory", SHARED_DIRECTORY)
        .map_err(|err| Error::Default("shared.directory".into(), err))?
        .set_default("shared.pollInterval", SHARED_POLL_INTERVAL)
        .map_err(|err| Error::Default("shared.pollInterval".into(), err))?
        .set_default("argon2.timeCost", ARGON2_TIME_COST)
        .map_err(|err| Error::Default("argon2.timeCost".into(), err))?
        .set_default("argon2.memoryCost", ARGON2_MEMORY_COST)
        .map_err(|err| Error::Default("argon2.memoryCost".into(), err))?
        .set_default("argon2.parallelism", ARGON2_PARALLELISM)
        .map_err(|err| Error::Default("argon2.parallelism".into(), err))?
        .set_default("masterPassword.path", MASTER_PASSWORD_PATH)
        .map_err(|err| Error::Default("masterPassword.path".into(), err))?
        .set_default("rbac.resyncInterval", RBAC_RESYNC_INTERVAL)
        .map_err(|err| Error::Default("rbac.resyncInterval".into(), err))?
        .set_default("http.timeout", HTTP_TIMEOUT)
        .map_err(|err| Error::Default("http.timeout".into(), err))?
        .set_override_option("argon2.timeCost", env_integer("ARGON2_TIME_COST"))
        .map_err(|err| Error::Default("argon2.timeCost".into(), err))?
        .set_override_option("argon2.memoryCost", env_integer("ARGON2_MEMORY_COST"))
        .map_err(|err| Error::Default("argon2.memoryCost".into(), err))?
        .set_override_option("argon2.parallelism", env_integer("ARGON2_PARALLELISM"))
        .map_err(|err| Error::Default("argon2.parallelism".into(), err))?
        .add_source(Environment::with_prefix(
            &env!("CARGO_PKG_NAME").replace('-', "_"),
        )))
}

/// documented operator environment variables take precedence over file keys
fn env_integer(name: &str) -> Option<i64> {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(
                    variable = name,
                    value = value,
                    "Environment variable is not an integer, ignoring",
                );
                None
            }
        },
        Err(_) => None,
    }
}
