use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
    Json(#[from] serde_json::Error),
    BadAuthEntry(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Registry credential handed out by an [`AuthProvider`]. The empty
/// credential means anonymous access.
#[derive(Clone, Default)]
pub struct Credential {
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity_token: Option<String>,
    /// When the credential stops being valid. `None` means it does not
    /// expire by time.
    pub expires_on: Option<DateTime<Utc>>,
}

// credentials must never end up in logs
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("expires_on", &self.expires_on)
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() && self.password.is_none() && self.identity_token.is_none()
    }

    /// The secret used for token exchange: the password when present,
    /// otherwise the identity token.
    pub fn secret(&self) -> Option<&str> {
        self.password
            .as_deref()
            .or(self.identity_token.as_deref())
    }
}

/// Produces per-registry credentials. Implementations must be safe for
/// concurrent `provide` calls.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn enabled(&self) -> bool;

    /// Returns the credential for `registry`. `Ok` with an empty credential
    /// means "use anonymous". Callers log provider errors and proceed
    /// anonymously, letting the registry produce the real 401/403.
    async fn provide(&self, registry: &str) -> Result<Credential, Error>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name")]
pub enum AuthProviderConfig {
    #[serde(rename = "dockerConfig", rename_all = "camelCase")]
    DockerConfig {
        #[serde(default)]
        config_path: Option<PathBuf>,
    },
    #[serde(rename = "static")]
    Static {
        #[serde(default)]
        registries: BTreeMap<String, StaticCredential>,
    },
}

impl Default for AuthProviderConfig {
    fn default() -> Self {
        AuthProviderConfig::DockerConfig { config_path: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticCredential {
    pub username: String,
    pub password: String,
}

/// Resolves the tagged provider config into a provider instance.
pub fn create_provider(config: &AuthProviderConfig) -> Arc<dyn AuthProvider> {
    match config {
        AuthProviderConfig::DockerConfig { config_path } => Arc::new(DockerConfigProvider {
            config_path: config_path.clone(),
        }),
        AuthProviderConfig::Static { registries } => Arc::new(StaticProvider {
            registries: registries.clone(),
        }),
    }
}

/// Reads credentials from a docker `config.json`. The file is re-read on
/// every `provide` call so rotated credentials are picked up without a
/// restart.
pub struct DockerConfigProvider {
    config_path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
}

impl DockerConfigProvider {
    fn resolve_path(&self) -> PathBuf {
        self.config_path.clone().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_default()
                .join(".docker/config.json")
        })
    }
}

fn credential_from_entry(registry: &str, entry: &DockerAuthEntry) -> Result<Credential, Error> {
    let (username, password) = match (&entry.username, &entry.password, &entry.auth) {
        (Some(user), Some(pass), _) => (Some(user.clone()), Some(pass.clone())),
        (_, _, Some(auth)) => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth)
                .map_err(|_| Error::BadAuthEntry(registry.to_string()))?;
            let decoded =
                String::from_utf8(decoded).map_err(|_| Error::BadAuthEntry(registry.to_string()))?;
            let (user, pass) = decoded
                .split_once(':')
                .ok_or_else(|| Error::BadAuthEntry(registry.to_string()))?;
            (Some(user.to_string()), Some(pass.to_string()))
        }
        _ => (None, None),
    };
    Ok(Credential {
        username,
        password,
        identity_token: entry.identitytoken.clone(),
        expires_on: None,
    })
}

#[async_trait]
impl AuthProvider for DockerConfigProvider {
    fn enabled(&self) -> bool {
        true
    }

    async fn provide(&self, registry: &str) -> Result<Credential, Error> {
        let path = self.resolve_path();
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            // no config file just means anonymous, not a provider failure
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Credential::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: DockerConfigFile = serde_json::from_slice(&data)?;
        match config.auths.get(registry) {
            Some(entry) => credential_from_entry(registry, entry),
            None => Ok(Credential::default()),
        }
    }
}

/// Fixed registry -> credential map from configuration.
pub struct StaticProvider {
    registries: BTreeMap<String, StaticCredential>,
}

#[async_trait]
impl AuthProvider for StaticProvider {
    fn enabled(&self) -> bool {
        !self.registries.is_empty()
    }

    async fn provide(&self, registry: &str) -> Result<Credential, Error> {
        Ok(self
            .registries
            .get(registry)
            .map(|c| Credential {
                username: Some(c.username.clone()),
                password: Some(c.password.clone()),
                identity_token: None,
                expires_on: None,
            })
            .unwrap_or_default())
    }
}
