//! Certificate trust stores.
//!
//! A trust store is partitioned by [`StoreRole`] and keyed by subject name.
//! Inserts are idempotent: the first certificate stored under a subject
//! wins. Stores only ever hold public-only certificates; a personal entry
//! records that the matching key exists elsewhere (in a device HSM) without
//! holding it.
//!
//! # Directory layout
//!
//! [`DirectoryTrustStore`] keeps one PEM file per subject:
//!
//! ```text
//! <base>/root/<id>.pem           0o644
//! <base>/intermediate/<id>.pem   0o644
//! <base>/personal/<id>.pem       0o600
//! ```
//!
//! where `<id>` is the hex BLAKE3 digest of the subject name.

use skytrust_core::{Error, Result};
use skytrust_crypto::Certificate;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

/// Trust store partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreRole {
    /// Trust anchors
    Root,
    /// Issuing CAs between the root and the leaf
    Intermediate,
    /// Certificates whose key belongs to this device
    Personal,
}

impl StoreRole {
    pub const ALL: [StoreRole; 3] = [StoreRole::Root, StoreRole::Intermediate, StoreRole::Personal];

    fn dir_name(&self) -> &'static str {
        match self {
            StoreRole::Root => "root",
            StoreRole::Intermediate => "intermediate",
            StoreRole::Personal => "personal",
        }
    }
}

/// A stored certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub certificate: Certificate,
    /// The matching private key is held by the owner of this store
    pub has_private_key: bool,
}

impl StoreEntry {
    pub fn public(certificate: Certificate) -> Self {
        Self {
            certificate,
            has_private_key: false,
        }
    }

    pub fn key_bound(certificate: Certificate) -> Self {
        Self {
            certificate,
            has_private_key: true,
        }
    }
}

pub trait TrustStore: Send + Sync {
    /// Insert unless an entry with the same subject exists. Returns whether
    /// the entry was added.
    fn insert_if_absent(&self, role: StoreRole, entry: StoreEntry) -> Result<bool>;

    fn find_by_subject(&self, role: StoreRole, subject: &str) -> Result<Option<StoreEntry>>;

    fn list(&self, role: StoreRole) -> Result<Vec<StoreEntry>>;

    /// Remove every entry, in any role, whose `O=` equals `organization` and
    /// which carries the clientAuth extended key usage. Returns the count.
    fn remove_by_organization(&self, organization: &str) -> Result<usize>;
}

fn matches_organization(certificate: &Certificate, organization: &str) -> bool {
    certificate.organization() == Some(organization) && certificate.has_client_auth()
}

/// Process-local store.
#[derive(Default)]
pub struct InMemoryTrustStore {
    entries: RwLock<HashMap<StoreRole, BTreeMap<String, StoreEntry>>>,
}

impl InMemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for InMemoryTrustStore {
    fn insert_if_absent(&self, role: StoreRole, entry: StoreEntry) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let partition = entries.entry(role).or_default();
        let subject = entry.certificate.subject().to_string();
        if partition.contains_key(&subject) {
            return Ok(false);
        }
        debug!(?role, subject = %subject, "Trust store insert");
        partition.insert(subject, entry);
        Ok(true)
    }

    fn find_by_subject(&self, role: StoreRole, subject: &str) -> Result<Option<StoreEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(&role)
            .and_then(|partition| partition.get(subject))
            .cloned())
    }

    fn list(&self, role: StoreRole) -> Result<Vec<StoreEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(&role)
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default())
    }

    fn remove_by_organization(&self, organization: &str) -> Result<usize> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for partition in entries.values_mut() {
            let before = partition.len();
            partition.retain(|_, entry| !matches_organization(&entry.certificate, organization));
            removed += before - partition.len();
        }
        info!(organization, removed, "Trust store cleaned");
        Ok(removed)
    }
}

/// Filesystem-backed store, one PEM file per subject.
pub struct DirectoryTrustStore {
    base: PathBuf,
    // serializes check-then-write across threads
    write_lock: RwLock<()>,
}

impl DirectoryTrustStore {
    /// Open (creating if needed) a store rooted at `base`.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        for role in StoreRole::ALL {
            create_private_dir(&base.join(role.dir_name()))?;
        }
        info!(path = %base.display(), "STATUS: DirectoryTrustStore :: Opened :: ACTIVE");
        Ok(Self {
            base,
            write_lock: RwLock::new(()),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn entry_path(&self, role: StoreRole, subject: &str) -> PathBuf {
        self.base
            .join(role.dir_name())
            .join(format!("{}.pem", blake3::hash(subject.as_bytes()).to_hex()))
    }

    fn read_entry(role: StoreRole, path: &Path) -> Result<StoreEntry> {
        let pem = std::fs::read_to_string(path)?;
        let certificate = Certificate::from_pem(&pem)?;
        Ok(StoreEntry {
            certificate,
            has_private_key: role == StoreRole::Personal,
        })
    }

    fn entry_files(&self, role: StoreRole) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for item in std::fs::read_dir(self.base.join(role.dir_name()))? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("pem") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl TrustStore for DirectoryTrustStore {
    fn insert_if_absent(&self, role: StoreRole, entry: StoreEntry) -> Result<bool> {
        let _guard = self.write_lock.write().unwrap_or_else(|e| e.into_inner());
        let path = self.entry_path(role, entry.certificate.subject());
        if path.exists() {
            return Ok(false);
        }

        let mode = match role {
            StoreRole::Personal => 0o600,
            StoreRole::Root | StoreRole::Intermediate => 0o644,
        };
        if !write_new_file(&path, entry.certificate.to_pem().as_bytes(), mode)? {
            return Ok(false);
        }

        debug!(?role, subject = %entry.certificate.subject(), path = %path.display(), "Trust store insert");
        Ok(true)
    }

    fn find_by_subject(&self, role: StoreRole, subject: &str) -> Result<Option<StoreEntry>> {
        let _guard = self.write_lock.read().unwrap_or_else(|e| e.into_inner());
        let path = self.entry_path(role, subject);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_entry(role, &path).map(Some)
    }

    fn list(&self, role: StoreRole) -> Result<Vec<StoreEntry>> {
        let _guard = self.write_lock.read().unwrap_or_else(|e| e.into_inner());
        self.entry_files(role)?
            .iter()
            .map(|path| Self::read_entry(role, path))
            .collect()
    }

    fn remove_by_organization(&self, organization: &str) -> Result<usize> {
        let _guard = self.write_lock.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for role in StoreRole::ALL {
            for path in self.entry_files(role)? {
                let entry = Self::read_entry(role, &path)?;
                if matches_organization(&entry.certificate, organization) {
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        info!(organization, removed, path = %self.base.display(), "Trust store cleaned");
        Ok(removed)
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .map_err(|e| {
                Error::Configuration(format!(
                    "Failed to create trust store directory {}: {}",
                    path.display(),
                    e
                ))
            })
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to create trust store directory {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Create `path` with `mode` from the first byte written. Returns `false`
/// when the file already exists.
#[cfg(unix)]
fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> Result<bool> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    // The umask can only narrow the creation mode; widen back to the exact bits
    file.set_permissions(std::fs::Permissions::from_mode(mode))?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(true)
}

#[cfg(not(unix))]
fn write_new_file(path: &Path, contents: &[u8], _mode: u32) -> Result<bool> {
    use std::io::Write;

    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    file.write_all(contents)?;
    Ok(true)
}
