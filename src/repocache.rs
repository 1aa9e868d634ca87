use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{trace, warn};
use moka::{Expiry, future::Cache};
use oci_spec::distribution::Reference;

use crate::auth::{AuthProvider, Credential};
use crate::registry::RepositoryClient;
use crate::transport::TransportPair;

/// Decides per registry host whether to use the TLS-skipping transport.
pub type InsecurePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// An authenticated client plus the expiry of the credential it was built
/// with. `expires_on == None` means the entry does not expire by time.
pub struct RepositoryEntry {
    pub client: RepositoryClient,
    pub expires_on: Option<DateTime<Utc>>,
}

struct ExpireEntry;

impl Expiry<String, Arc<RepositoryEntry>> for ExpireEntry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<RepositoryEntry>,
        _current_time: Instant,
    ) -> Option<Duration> {
        // an already-past expiry becomes a zero TTL, dropping the entry on
        // its next access
        value
            .expires_on
            .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug)]
pub struct Stats {
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Cache of authenticated repository clients keyed by the canonical
/// reference string. Lookups never build entries implicitly: a miss in
/// `get_or_create` returns a new client that is only installed by `add`
/// after a registry interaction succeeds with it, and any registry error
/// evicts the reference.
pub struct RepositoryCache {
    entries: Cache<String, Arc<RepositoryEntry>>,
    counters: Counters,
    provider: Arc<dyn AuthProvider>,
    transports: TransportPair,
    plain_http: bool,
    insecure: InsecurePredicate,
}

impl RepositoryCache {
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        transports: TransportPair,
        plain_http: bool,
        insecure: InsecurePredicate,
    ) -> Self {
        let entries = Cache::builder().expire_after(ExpireEntry).build();
        RepositoryCache {
            entries,
            counters: Counters::default(),
            provider,
            transports,
            plain_http,
            insecure,
        }
    }

    /// Returns the live entry for `reference`, or builds a fresh client
    /// without inserting it. A client built here must not be trusted for
    /// future calls until a registry interaction proves its credentials;
    /// callers install it with [`RepositoryCache::add`] at that point.
    pub async fn get_or_create(&self, reference: &Reference) -> Arc<RepositoryEntry> {
        let key = reference.to_string();
        if let Some(entry) = self.entries.get(&key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!("repository cache hit ref={key}");
            return entry;
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        trace!("repository cache miss ref={key}");

        let registry = reference.resolve_registry();
        let credential = if self.provider.enabled() {
            match self.provider.provide(registry).await {
                Ok(credential) => credential,
                // partial or no credentials may still work for public
                // repositories; let the registry produce the real error
                Err(e) => {
                    warn!("auth provider failed for {registry}, proceeding anonymously: {e:?}");
                    Credential::default()
                }
            }
        } else {
            Credential::default()
        };

        let expires_on = credential.expires_on;
        let http = self.transports.select((self.insecure)(registry)).clone();
        let client = RepositoryClient::new(reference, credential, http, self.plain_http);
        Arc::new(RepositoryEntry { client, expires_on })
    }

    /// Insert-if-absent. Two concurrent builders for one reference may both
    /// reach here; the loser is discarded, which is fine because client
    /// construction is cheap and the auth provider is idempotent.
    pub async fn add(&self, reference: String, entry: Arc<RepositoryEntry>) {
        let installed = self.entries.entry(reference).or_insert(entry).await;
        if !installed.is_fresh() {
            trace!("kept existing client for {}", installed.key());
        }
    }

    /// Unconditional removal. The distribution protocol does not reliably
    /// distinguish expired from wrong credentials, so any registry error
    /// for the reference drops its entry.
    pub async fn evict(&self, reference: &str) {
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        self.entries.invalidate(reference).await;
    }

    pub async fn get(&self, reference: &str) -> Option<Arc<RepositoryEntry>> {
        self.entries.get(reference).await
    }

    pub async fn contains(&self, reference: &str) -> bool {
        self.entries.run_pending_tasks().await;
        self.entries.contains_key(reference)
    }

    pub async fn stats(&self) -> Stats {
        self.entries.run_pending_tasks().await;
        Stats {
            entry_count: self.entries.entry_count(),
            hits: self.counters.hits.swap(0, Ordering::Relaxed),
            misses: self.counters.misses.swap(0, Ordering::Relaxed),
            evictions: self.counters.evictions.swap(0, Ordering::Relaxed),
        }
    }
}
