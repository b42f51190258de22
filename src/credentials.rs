use crate::error::{Error, Result};
use crate::secret_string::SecretString;
use std::env;

pub const REGISTRY_PROVIDER_ENV: &str = "REGISTRY_PROVIDER";
pub const REGISTRY_USERNAME_ENV: &str = "REGISTRY_USERNAME";
pub const REGISTRY_PASSWORD_ENV: &str = "REGISTRY_PASSWORD";

/// Credentials of the backup registry. The username doubles as the namespace
/// that every backed up repository is placed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub provider: Option<String>,
    pub username: String,
    pub password: SecretString,
}

impl RegistryCredentials {
    /// Builds credentials from raw values, rejecting an empty username or password.
    /// An empty provider means "no provider prefix".
    pub fn new(provider: Option<String>, username: String, password: SecretString) -> Result<Self> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::CredentialsMissing);
        }
        Ok(Self {
            provider: provider.filter(|p| !p.is_empty()),
            username,
            password,
        })
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Self::new(
            lookup(REGISTRY_PROVIDER_ENV),
            lookup(REGISTRY_USERNAME_ENV).unwrap_or_default(),
            SecretString::new(lookup(REGISTRY_PASSWORD_ENV).unwrap_or_default()),
        )
    }
}

/// Source of registry credentials, consulted at the start of every resolve and backup
/// so that rotated secrets are picked up without a restart.
pub trait CredentialsProvider: Send + Sync {
    fn load(&self) -> Result<RegistryCredentials>;
}

/// Reads REGISTRY_PROVIDER, REGISTRY_USERNAME and REGISTRY_PASSWORD on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialsProvider for EnvCredentials {
    fn load(&self) -> Result<RegistryCredentials> {
        RegistryCredentials::from_lookup(|key| env::var(key).ok())
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub RegistryCredentials);

#[cfg(test)]
impl CredentialsProvider for StaticCredentials {
    fn load(&self) -> Result<RegistryCredentials> {
        Ok(self.0.clone())
    }
}
