//! Referrer store for OCI artifact verification: resolves an image
//! reference to its subject descriptor, enumerates the artifacts that refer
//! to it (signatures, SBOMs, attestations), and pulls their manifests and
//! blobs through a local content-addressed cache.

pub mod auth;
pub mod blobstore;
pub mod config;
pub mod cosign;
pub mod registry;
pub mod repocache;
pub mod store;
pub mod transport;

pub use config::OrasStoreConfig;
pub use store::{OrasStore, ReferrerList, ReferrerStore};

// re-exported for convenience, the public API speaks these types
pub use oci_spec;
