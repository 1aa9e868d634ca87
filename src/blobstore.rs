use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use log::{debug, error};
use oci_spec::image::{Digest, DigestAlgorithm};
use rustix::{
    fd::OwnedFd,
    fs::{AtFlags, Mode, OFlags, ResolveFlags},
    io::Errno,
};
use sha2::Sha256;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Errno(#[from] Errno),
    Io(#[from] std::io::Error),
    DigestAlgorithmNotHandled(DigestAlgorithm),
    CorruptEntry(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of a [`BlobStore::push`]. A duplicate push is not an error;
/// callers treat it the same as a fresh write.
#[derive(Debug, PartialEq, Eq)]
pub enum Push {
    Written,
    AlreadyExists,
}

#[derive(Debug)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const INDEX_CONTENT: &[u8] = br#"{"schemaVersion":2,"manifests":[]}"#;

/// Content-addressed store over an OCI image-layout directory:
/// `oci-layout` and `index.json` markers at the root, content at
/// `blobs/<alg>/<hex>`. Writes go through a tmp file and a rename, so a
/// partial entry is never observable; entries live until the deployment
/// deletes the directory.
pub struct BlobStore {
    blobs: OwnedFd,
    tmp_seq: AtomicU64,
    counters: Counters,
}

// Digest is validated on parse (lowercase algorithm, lowercase hex), so the
// derived relative path cannot traverse out of the blobs directory; the
// BENEATH opens below are belt and braces.
fn digest_path(digest: &Digest) -> String {
    format!("{}/{}", digest.algorithm().as_ref(), digest.digest())
}

struct TmpGuard<'a> {
    dir: &'a OwnedFd,
    name: Option<String>,
}

impl<'a> TmpGuard<'a> {
    fn success(mut self, dest: &str) -> Result<(), Errno> {
        if let Some(name) = self.name.take() {
            rustix::fs::renameat(self.dir, name, self.dir, dest)?;
        }
        Ok(())
    }
}

impl Drop for TmpGuard<'_> {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            if let Err(e) = rustix::fs::unlinkat(self.dir, &name, AtFlags::empty()) {
                error!("error unlinking tmp file {} on drop: {:?}", name, e);
            }
        }
    }
}

fn open_or_create_dir_at(dir: Option<&OwnedFd>, path: &str) -> Result<OwnedFd, Errno> {
    if let Some(dir) = dir {
        match rustix::fs::mkdirat(dir, path, Mode::from_bits_truncate(0o755)) {
            Ok(_) | Err(Errno::EXIST) => {}
            Err(e) => return Err(e),
        }
        rustix::fs::openat2(
            dir,
            path,
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
            ResolveFlags::BENEATH,
        )
    } else {
        match rustix::fs::mkdir(path, Mode::from_bits_truncate(0o755)) {
            Ok(_) | Err(Errno::EXIST) => {}
            Err(e) => return Err(e),
        }
        rustix::fs::open(
            path,
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
    }
}

fn write_marker(root: &OwnedFd, name: &str, content: &[u8]) -> Result<(), Error> {
    match rustix::fs::openat2(
        root,
        name,
        OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
        Mode::from_bits_truncate(0o644),
        ResolveFlags::BENEATH,
    ) {
        Ok(fd) => {
            let mut file = std::fs::File::from(fd);
            file.write_all(content)?;
            Ok(())
        }
        Err(Errno::EXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl BlobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let root = rustix::fs::open(
            path,
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        write_marker(&root, OCI_LAYOUT_FILE, OCI_LAYOUT_CONTENT)?;
        write_marker(&root, INDEX_FILE, INDEX_CONTENT)?;
        let blobs = open_or_create_dir_at(Some(&root), "blobs")?;
        Ok(BlobStore {
            blobs,
            tmp_seq: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    pub fn exists(&self, digest: &Digest) -> Result<bool, Error> {
        match rustix::fs::statat(&self.blobs, digest_path(digest), AtFlags::empty()) {
            Ok(_) => Ok(true),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `data` under its digest if absent. The tmp name is unique per
    /// attempt so concurrent pushes of one digest cannot interleave; the
    /// loser of the rename race overwrites identical content.
    pub fn push(&self, digest: &Digest, data: &[u8]) -> Result<Push, Error> {
        let dest = digest_path(digest);
        if self.exists(digest)? {
            return Ok(Push::AlreadyExists);
        }

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = format!("{}_{}_tmp", dest, seq);
        let fd = match self.openat_write(&tmp) {
            Ok(fd) => fd,
            Err(Errno::NOENT) => {
                match rustix::fs::mkdirat(
                    &self.blobs,
                    digest.algorithm().as_ref(),
                    Mode::from_bits_truncate(0o755),
                ) {
                    Ok(_) | Err(Errno::EXIST) => {}
                    Err(e) => return Err(e.into()),
                }
                self.openat_write(&tmp)?
            }
            Err(e) => return Err(e.into()),
        };
        let guard = TmpGuard {
            dir: &self.blobs,
            name: Some(tmp),
        };

        let mut file = std::fs::File::from(fd);
        file.write_all(data)?;
        file.sync_data()?;
        drop(file);
        guard.success(&dest)?;

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!("content cache write digest={} size={}", digest, data.len());
        Ok(Push::Written)
    }

    /// Reads the entry for `digest`, re-verifying the content hash. A hash
    /// mismatch surfaces as [`Error::CorruptEntry`] rather than stale bytes.
    pub fn fetch(&self, digest: &Digest) -> Result<Option<Bytes>, Error> {
        let fd = match rustix::fs::openat2(
            &self.blobs,
            digest_path(digest),
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
            ResolveFlags::BENEATH,
        ) {
            Ok(fd) => fd,
            Err(Errno::NOENT) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::new();
        std::fs::File::from(fd).read_to_end(&mut data)?;
        verify_digest(digest, &data)?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(data.into()))
    }

    pub fn stats(&self) -> Stats {
        Stats {
            hits: self.counters.hits.swap(0, Ordering::Relaxed),
            misses: self.counters.misses.swap(0, Ordering::Relaxed),
            writes: self.counters.writes.swap(0, Ordering::Relaxed),
        }
    }

    fn openat_write(&self, name: &str) -> Result<OwnedFd, Errno> {
        rustix::fs::openat2(
            &self.blobs,
            name,
            OFlags::WRONLY | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
            Mode::from_bits_truncate(0o644),
            ResolveFlags::BENEATH,
        )
    }
}

fn verify_digest(expected: &Digest, data: &[u8]) -> Result<(), Error> {
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            use sha2::Digest as _;
            if hex::encode(Sha256::digest(data)) == expected.digest() {
                Ok(())
            } else {
                Err(Error::CorruptEntry(expected.to_string()))
            }
        }
        algo => Err(Error::DigestAlgorithmNotHandled(algo.clone())),
    }
}
