use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::auth::AuthProviderConfig;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Json(#[from] serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Configuration for [`crate::OrasStore`]. Field names follow the JSON the
/// outer service hands to the store factory.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrasStoreConfig {
    /// Store name as it appears in the outer service's config; informational.
    #[serde(default = "default_name")]
    pub name: String,

    /// Talk plain http to registries instead of https.
    #[serde(default)]
    pub use_http: bool,

    /// Also look up cosign's legacy `sha256-<hex>.sig` signature tags.
    #[serde(default)]
    pub cosign_enabled: bool,

    #[serde(default)]
    pub auth_provider: AuthProviderConfig,

    /// Root of the on-disk content cache (an OCI image-layout directory).
    #[serde(default = "default_local_cache_path")]
    pub local_cache_path: PathBuf,

    /// Registries (host or host:port) contacted with TLS verification
    /// disabled.
    #[serde(default)]
    pub insecure_registries: Vec<String>,
}

impl Default for OrasStoreConfig {
    fn default() -> Self {
        OrasStoreConfig {
            name: default_name(),
            use_http: false,
            cosign_enabled: false,
            auth_provider: AuthProviderConfig::default(),
            local_cache_path: default_local_cache_path(),
            insecure_registries: Vec::new(),
        }
    }
}

impl OrasStoreConfig {
    pub fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure_registries.iter().any(|r| r == registry)
    }

    pub fn local_cache_path(&self) -> &Path {
        &self.local_cache_path
    }
}

fn default_name() -> String {
    "oras".to_string()
}

fn default_local_cache_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".config/ratify/local_oras_cache")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthProviderConfig;

    #[test]
    fn test_defaults() {
        let config = OrasStoreConfig::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.name, "oras");
        assert!(!config.use_http);
        assert!(!config.cosign_enabled);
        assert!(config.insecure_registries.is_empty());
        assert!(
            config
                .local_cache_path
                .ends_with(".config/ratify/local_oras_cache")
        );
        assert!(matches!(
            config.auth_provider,
            AuthProviderConfig::DockerConfig { config_path: None }
        ));
    }

    #[test]
    fn test_full_config() {
        let config = OrasStoreConfig::from_value(serde_json::json!({
            "name": "oras",
            "useHttp": true,
            "cosignEnabled": true,
            "localCachePath": "/tmp/oras-cache",
            "insecureRegistries": ["registry.test:5000"],
            "authProvider": {
                "name": "dockerConfig",
                "configPath": "/etc/docker/config.json",
            },
        }))
        .unwrap();
        assert!(config.use_http);
        assert!(config.cosign_enabled);
        assert_eq!(config.local_cache_path, PathBuf::from("/tmp/oras-cache"));
        assert!(config.is_insecure("registry.test:5000"));
        assert!(!config.is_insecure("registry.test"));
        match config.auth_provider {
            AuthProviderConfig::DockerConfig { config_path } => {
                assert_eq!(config_path.unwrap(), PathBuf::from("/etc/docker/config.json"));
            }
            other => panic!("unexpected provider {other:?}"),
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(OrasStoreConfig::from_value(serde_json::json!({"useHttps": true})).is_err());
    }
}
