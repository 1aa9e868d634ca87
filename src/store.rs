use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use oci_spec::{
    OciSpecError,
    distribution::Reference,
    image::{Descriptor, Digest, ImageManifest},
};

use crate::auth::{self, AuthProvider};
use crate::blobstore::{self, BlobStore};
use crate::config::{self, OrasStoreConfig};
use crate::cosign;
use crate::registry;
use crate::repocache::{RepositoryCache, RepositoryEntry};
use crate::transport::{self, TransportPair};

pub const STORE_NAME: &str = "oras";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Config(#[from] config::Error),
    Transport(#[from] transport::Error),
    ContentCache(#[from] blobstore::Error),
    Registry(#[from] registry::Error),
    BadReference(String),
    ManifestParse(OciSpecError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One page of referrers. Pagination is driven internally (every page of
/// the Referrers API is drained), so `next_token` is currently always
/// `None`; it stays in the shape for callers that page through other
/// store backends.
#[derive(Debug, Default)]
pub struct ReferrerList {
    pub referrers: Vec<Descriptor>,
    pub next_token: Option<String>,
}

/// The store contract consumed by verifiers: resolve a subject, enumerate
/// what refers to it, and hand over manifest and blob payloads.
#[async_trait]
pub trait ReferrerStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> &OrasStoreConfig;

    /// Lists artifacts referring to `subject`. `artifact_types` and
    /// `next_token` are accepted at the boundary; the registry may ignore
    /// them and the result is the full referrer set either way.
    async fn list_referrers(
        &self,
        subject: &str,
        artifact_types: &[String],
        next_token: Option<&str>,
        subject_descriptor: Option<&Descriptor>,
    ) -> Result<ReferrerList, Error>;

    async fn get_subject_descriptor(&self, subject: &str) -> Result<Descriptor, Error>;

    async fn get_reference_manifest(
        &self,
        subject: &str,
        referrer: &Descriptor,
    ) -> Result<ImageManifest, Error>;

    async fn get_blob_content(&self, subject: &str, digest: &Digest) -> Result<Bytes, Error>;
}

/// Referrer store over OCI Distribution v2 registries, with a local
/// content-addressed cache for manifests and blobs and a client cache per
/// image reference. Construct once per configured backend and share via
/// `Arc`; all operations take `&self`.
pub struct OrasStore {
    config: OrasStoreConfig,
    repositories: RepositoryCache,
    content: BlobStore,
}

impl OrasStore {
    pub fn new(config: OrasStoreConfig) -> Result<Self, Error> {
        let provider = auth::create_provider(&config.auth_provider);
        Self::with_auth_provider(config, provider)
    }

    /// Builds the store with a caller-supplied auth provider, for
    /// credential backends beyond the built-in config variants (cloud
    /// workload identity, in-cluster secrets, ...).
    pub fn with_auth_provider(
        config: OrasStoreConfig,
        provider: Arc<dyn AuthProvider>,
    ) -> Result<Self, Error> {
        let transports = TransportPair::new(config.use_http)?;
        let content = BlobStore::open(&config.local_cache_path)?;
        let insecure_registries = config.insecure_registries.clone();
        let repositories = RepositoryCache::new(
            provider,
            transports,
            config.use_http,
            Arc::new(move |registry| insecure_registries.iter().any(|r| r == registry)),
        );
        info!(
            "oras store ready, content cache at {}",
            config.local_cache_path.display()
        );
        Ok(OrasStore {
            config,
            repositories,
            content,
        })
    }

    /// Factory entry point taking the raw JSON config handed down by the
    /// outer service.
    pub fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        Self::new(OrasStoreConfig::from_value(value)?)
    }

    /// Introspection over the repository client cache; also how the test
    /// suite asserts the add/evict discipline.
    pub fn repository_cache(&self) -> &RepositoryCache {
        &self.repositories
    }

    pub fn content_cache_stats(&self) -> blobstore::Stats {
        self.content.stats()
    }

    fn parse_reference(subject: &str) -> Result<Reference, Error> {
        subject
            .parse()
            .map_err(|_| Error::BadReference(subject.to_string()))
    }

    // A successful registry interaction installs or refreshes the client
    // entry before bytes are returned; any registry error evicts the
    // reference.
    async fn settle<T>(
        &self,
        key: String,
        entry: Arc<RepositoryEntry>,
        result: Result<T, registry::Error>,
    ) -> Result<T, Error> {
        match result {
            Ok(value) => {
                self.repositories.add(key, entry).await;
                Ok(value)
            }
            Err(e) => {
                debug!("registry error for {key}, evicting client: {e:?}");
                self.repositories.evict(&key).await;
                Err(e.into())
            }
        }
    }

    async fn referrer_manifest_bytes(
        &self,
        subject: &str,
        referrer: &Descriptor,
    ) -> Result<Bytes, Error> {
        if let Some(data) = self.content.fetch(referrer.digest())? {
            return Ok(data);
        }
        let reference = Self::parse_reference(subject)?;
        let entry = self.repositories.get_or_create(&reference).await;
        let result = entry.client.fetch_manifest(referrer).await;
        let data = self.settle(reference.to_string(), entry, result).await?;
        // a concurrent writer may have won the race; AlreadyExists is fine
        self.content.push(referrer.digest(), &data)?;
        Ok(data)
    }
}

#[async_trait]
impl ReferrerStore for OrasStore {
    fn name(&self) -> &'static str {
        STORE_NAME
    }

    fn config(&self) -> &OrasStoreConfig {
        &self.config
    }

    async fn list_referrers(
        &self,
        subject: &str,
        artifact_types: &[String],
        _next_token: Option<&str>,
        subject_descriptor: Option<&Descriptor>,
    ) -> Result<ReferrerList, Error> {
        let reference = Self::parse_reference(subject)?;
        let entry = self.repositories.get_or_create(&reference).await;

        // the wire query takes a single artifactType and is advisory, so
        // it is only forwarded when the caller asked for exactly one
        let filter = match artifact_types {
            [only] => Some(only.as_str()),
            _ => None,
        };

        let result = async {
            let subject_descriptor = match subject_descriptor {
                Some(d) => d.clone(),
                None => entry.client.resolve(&reference).await?,
            };
            let mut referrers = entry
                .client
                .list_referrers(subject_descriptor.digest(), filter)
                .await?;
            if self.config.cosign_enabled {
                // appended after native referrers; ordering between the
                // two groups is unspecified
                if let Some(signature) =
                    cosign::signature_descriptor(&entry.client, subject_descriptor.digest()).await?
                {
                    referrers.push(signature);
                }
            }
            Ok(referrers)
        }
        .await;

        let referrers = self.settle(reference.to_string(), entry, result).await?;
        Ok(ReferrerList {
            referrers,
            next_token: None,
        })
    }

    async fn get_subject_descriptor(&self, subject: &str) -> Result<Descriptor, Error> {
        let reference = Self::parse_reference(subject)?;
        let entry = self.repositories.get_or_create(&reference).await;
        let result = entry.client.resolve(&reference).await;
        self.settle(reference.to_string(), entry, result).await
    }

    async fn get_reference_manifest(
        &self,
        subject: &str,
        referrer: &Descriptor,
    ) -> Result<ImageManifest, Error> {
        let data = self.referrer_manifest_bytes(subject, referrer).await?;
        ImageManifest::from_reader(Cursor::new(&data)).map_err(Error::ManifestParse)
    }

    async fn get_blob_content(&self, subject: &str, digest: &Digest) -> Result<Bytes, Error> {
        if let Some(data) = self.content.fetch(digest)? {
            return Ok(data);
        }
        let reference = Self::parse_reference(subject)?;
        let entry = self.repositories.get_or_create(&reference).await;
        let result = entry.client.fetch_blob(digest).await;
        let data = self.settle(reference.to_string(), entry, result).await?;
        self.content.push(digest, &data)?;
        Ok(data)
    }
}
