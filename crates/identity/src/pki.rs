//! Certificate authority hierarchy for the device supply chain.
//!
//! Authorities live in an arena ([`AuthorityHierarchy`]) and refer to their
//! parent by [`AuthorityId`]. Parents are always added before children, so
//! the parent relation of a well-formed hierarchy cannot contain a cycle;
//! chain collection still bounds every walk by the configured depth.
//!
//! Each authority keeps its with-key certificate behind a lock and hands out
//! only the public-only form. Disposal drops the key (zeroizing it) and is
//! the single release point for authority key material.

use skytrust_core::{Error, HashAlgorithm, KeyProfile, Result};
use skytrust_crypto::{
    CertRequestEngine, Certificate, CertificateRequest, CertificateWithKey, DistinguishedName,
    SecretKey,
};
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, info};

/// Arena index of an authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthorityId(usize);

impl AuthorityId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for AuthorityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authority#{}", self.0)
    }
}

/// An authority that can sign certificate requests.
pub trait Signer: Send + Sync {
    fn name(&self) -> &str;

    /// Issue a certificate for `request` under this authority.
    fn sign(&self, request: &CertificateRequest) -> Result<Certificate>;

    /// Public-only certificate of this authority.
    fn exposed_certificate(&self) -> &Certificate;

    fn parent(&self) -> Option<AuthorityId>;

    /// Release the key. Idempotent.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// An authority that can issue its own certificate.
pub trait SelfSign: Signer {
    /// Re-sign this authority's name with its existing key.
    fn self_sign_new_certificate(&self) -> Result<Certificate>;
}

/// State shared by every authority kind.
struct AuthorityCore {
    name: String,
    exposed: Certificate,
    signer: RwLock<Option<CertificateWithKey>>,
    issued_days: u32,
    engine: CertRequestEngine,
}

impl AuthorityCore {
    fn new(name: String, signer: CertificateWithKey, issued_days: u32) -> Self {
        Self {
            name,
            exposed: signer.public_certificate().clone(),
            signer: RwLock::new(Some(signer)),
            issued_days,
            engine: CertRequestEngine::new(),
        }
    }

    fn with_signer<T>(&self, f: impl FnOnce(&CertificateWithKey) -> Result<T>) -> Result<T> {
        let guard = self.signer.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(signer) => f(signer),
            None => Err(Error::InvalidRequest(format!(
                "authority {} has been disposed",
                self.name
            ))),
        }
    }

    fn sign(&self, request: &CertificateRequest) -> Result<Certificate> {
        if request.subject().common_name().trim().is_empty() {
            return Err(Error::InvalidRequest(
                "certificate request has an empty subject".to_string(),
            ));
        }
        let certificate =
            self.with_signer(|signer| self.engine.issue(request, signer, self.issued_days))?;
        debug!(
            authority = %self.name,
            subject = %certificate.subject(),
            serial = %certificate.serial_hex(),
            "Signed certificate request"
        );
        Ok(certificate)
    }

    fn dispose(&self) {
        let mut guard = self.signer.write().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            info!(authority = %self.name, "Authority key disposed");
        }
    }

    fn is_disposed(&self) -> bool {
        self.signer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

/// Self-signed authority at the top of the hierarchy.
pub struct RootAuthority {
    core: AuthorityCore,
    request: CertificateRequest,
    self_signed_days: u32,
}

impl RootAuthority {
    /// Self-sign a CA certificate for `subject` with `key`.
    ///
    /// `issued_days` is the validity of certificates this root signs.
    pub fn new(
        name: impl Into<String>,
        subject: DistinguishedName,
        key: SecretKey,
        hash: HashAlgorithm,
        self_signed_days: u32,
        issued_days: u32,
    ) -> Result<Self> {
        let name = name.into();
        let engine = CertRequestEngine::new();
        let request = engine.create_request(subject, key.public_key(), hash, true, None)?;
        let signer = engine.self_sign(&request, key, self_signed_days)?;

        info!(
            authority = %name,
            subject = %signer.subject(),
            "STATUS: RootAuthority :: Self-signed :: ACTIVE"
        );
        Ok(Self {
            core: AuthorityCore::new(name, signer, issued_days),
            request,
            self_signed_days,
        })
    }
}

impl Signer for RootAuthority {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn sign(&self, request: &CertificateRequest) -> Result<Certificate> {
        self.core.sign(request)
    }

    fn exposed_certificate(&self) -> &Certificate {
        &self.core.exposed
    }

    fn parent(&self) -> Option<AuthorityId> {
        None
    }

    fn dispose(&self) {
        self.core.dispose()
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl SelfSign for RootAuthority {
    fn self_sign_new_certificate(&self) -> Result<Certificate> {
        self.core.with_signer(|signer| {
            self.core
                .engine
                .renew(&self.request, signer, self.self_signed_days)
        })
    }
}

/// Authority whose certificate was issued by its parent.
pub struct IntermediateAuthority {
    core: AuthorityCore,
    parent: AuthorityId,
}

impl IntermediateAuthority {
    /// Generate a key, have `parent_signer` sign a CA request for it, and
    /// bind the result.
    pub fn new(
        name: impl Into<String>,
        subject: DistinguishedName,
        profile: &KeyProfile,
        issued_days: u32,
        parent: AuthorityId,
        parent_signer: &dyn Signer,
    ) -> Result<Self> {
        let name = name.into();
        let engine = CertRequestEngine::new();
        let key = SecretKey::generate(profile.algorithm)?;
        let request = engine.create_request(subject, key.public_key(), profile.hash, true, None)?;
        let certificate = parent_signer.sign(&request)?;
        let signer = CertificateWithKey::bind(certificate, key)?;

        info!(
            authority = %name,
            parent = %parent_signer.name(),
            subject = %signer.subject(),
            "STATUS: IntermediateAuthority :: Issued :: ACTIVE"
        );
        Ok(Self {
            core: AuthorityCore::new(name, signer, issued_days),
            parent,
        })
    }
}

impl Signer for IntermediateAuthority {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn sign(&self, request: &CertificateRequest) -> Result<Certificate> {
        self.core.sign(request)
    }

    fn exposed_certificate(&self) -> &Certificate {
        &self.core.exposed
    }

    fn parent(&self) -> Option<AuthorityId> {
        Some(self.parent)
    }

    fn dispose(&self) {
        self.core.dispose()
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

enum AuthorityNode {
    Root(RootAuthority),
    Intermediate(IntermediateAuthority),
}

impl AuthorityNode {
    fn as_signer(&self) -> &dyn Signer {
        match self {
            AuthorityNode::Root(root) => root as &dyn Signer,
            AuthorityNode::Intermediate(intermediate) => intermediate as &dyn Signer,
        }
    }
}

/// Arena of authorities, parents before children.
pub struct AuthorityHierarchy {
    nodes: Vec<AuthorityNode>,
    max_depth: usize,
}

impl AuthorityHierarchy {
    /// `max_depth` bounds the number of parent links followed by a walk.
    pub fn new(max_depth: usize) -> Self {
        Self {
            nodes: Vec::new(),
            max_depth,
        }
    }

    pub fn add_root(&mut self, root: RootAuthority) -> AuthorityId {
        let id = AuthorityId(self.nodes.len());
        self.nodes.push(AuthorityNode::Root(root));
        id
    }

    /// Create an intermediate under `parent`, which must already exist.
    pub fn add_intermediate(
        &mut self,
        parent: AuthorityId,
        name: impl Into<String>,
        subject: DistinguishedName,
        profile: &KeyProfile,
        issued_days: u32,
    ) -> Result<AuthorityId> {
        let parent_signer = self.signer(parent)?;
        let intermediate =
            IntermediateAuthority::new(name, subject, profile, issued_days, parent, parent_signer)?;
        let id = AuthorityId(self.nodes.len());
        self.nodes.push(AuthorityNode::Intermediate(intermediate));
        Ok(id)
    }

    pub fn signer(&self, id: AuthorityId) -> Result<&dyn Signer> {
        self.nodes
            .get(id.0)
            .map(AuthorityNode::as_signer)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown {}", id)))
    }

    pub fn root(&self, id: AuthorityId) -> Result<&RootAuthority> {
        match self.nodes.get(id.0) {
            Some(AuthorityNode::Root(root)) => Ok(root),
            Some(_) => Err(Error::InvalidRequest(format!("{} is not a root", id))),
            None => Err(Error::InvalidRequest(format!("unknown {}", id))),
        }
    }

    /// Sign `request` with authority `id`.
    pub fn sign(&self, id: AuthorityId, request: &CertificateRequest) -> Result<Certificate> {
        self.signer(id)?.sign(request)
    }

    /// Chain from the root down to `id` inclusive, root first.
    pub fn collect_chain(&self, id: AuthorityId) -> Result<Vec<Certificate>> {
        walk_chain(
            id,
            self.max_depth,
            |node| Ok(self.signer(node)?.parent()),
            |node| Ok(self.signer(node)?.exposed_certificate().clone()),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Dispose every authority, leaves first.
    pub fn dispose(&self) {
        for node in self.nodes.iter().rev() {
            node.as_signer().dispose();
        }
    }
}

impl Drop for AuthorityHierarchy {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Walk parent links from `start`, prepending each certificate.
///
/// Fails with `ChainCycleDetected` once more than `max_depth` links have
/// been followed.
pub(crate) fn walk_chain<P, C>(
    start: AuthorityId,
    max_depth: usize,
    parent_of: P,
    certificate_of: C,
) -> Result<Vec<Certificate>>
where
    P: Fn(AuthorityId) -> Result<Option<AuthorityId>>,
    C: Fn(AuthorityId) -> Result<Certificate>,
{
    let mut chain = vec![certificate_of(start)?];
    let mut current = start;
    let mut depth = 0;

    while let Some(parent) = parent_of(current)? {
        depth += 1;
        if depth > max_depth {
            return Err(Error::ChainCycleDetected {
                depth,
                max: max_depth,
            });
        }
        chain.push(certificate_of(parent)?);
        current = parent;
    }

    chain.reverse();
    Ok(chain)
}
