//! Software HSM custodying a single device key.
//!
//! The key is generated inside [`DeviceHsm::new`] and never leaves it. Once
//! a leaf certificate for that key is stored, key-bound work runs through
//! [`DeviceHsm::execute_with_signing_key`], which lends the with-key leaf to
//! a closure for the duration of the call.

use crate::trust_store::{StoreEntry, StoreRole, TrustStore};
use skytrust_core::{Error, KeyAlgorithm, Result};
use skytrust_crypto::{Certificate, CertificateWithKey, PublicKeyInfo, SecretKey};
use std::sync::Arc;
use tracing::{debug, info};

enum HsmState {
    /// Key generated, no certificate yet
    Pending(SecretKey),
    Installed {
        leaf: CertificateWithKey,
        chain: Vec<Certificate>,
    },
    Disposed,
}

pub struct DeviceHsm {
    state: HsmState,
    public_key: PublicKeyInfo,
    device_id: String,
    trust_store: Arc<dyn TrustStore>,
}

impl DeviceHsm {
    /// Generate a fresh device key of `algorithm`.
    pub fn new(algorithm: KeyAlgorithm, trust_store: Arc<dyn TrustStore>) -> Result<Self> {
        let key = SecretKey::generate(algorithm)?;
        let public_key = key.public_key().clone();
        let device_id = format!("device-{}", public_key.fingerprint());

        info!(device_id = %device_id, ?algorithm, "STATUS: DeviceHsm :: Key generated :: ACTIVE");
        Ok(Self {
            state: HsmState::Pending(key),
            public_key,
            device_id,
            trust_store,
        })
    }

    /// Stable identifier derived from the device public key.
    pub fn unique_device_id(&self) -> &str {
        &self.device_id
    }

    pub fn public_key(&self) -> &PublicKeyInfo {
        &self.public_key
    }

    /// Install `leaf` (issued for this HSM's key) and its root-first `chain`.
    ///
    /// Returns `false` without touching anything when a leaf is already
    /// installed.
    pub fn store_certificate(&mut self, leaf: Certificate, chain: Vec<Certificate>) -> Result<bool> {
        if chain.is_empty() {
            return Err(Error::EmptyChain);
        }
        match self.state {
            HsmState::Installed { .. } => {
                debug!(device_id = %self.device_id, "Certificate already installed");
                return Ok(false);
            }
            HsmState::Disposed => {
                return Err(Error::InvalidRequest(format!(
                    "HSM for {} has been disposed",
                    self.device_id
                )));
            }
            HsmState::Pending(_) => {}
        }
        if leaf.public_key() != &self.public_key {
            return Err(Error::InvalidRequest(format!(
                "certificate {} was not issued for key {}",
                leaf.subject(),
                self.public_key.fingerprint()
            )));
        }
        if leaf.is_ca() {
            return Err(Error::InvalidRequest(format!(
                "device certificate {} must not be a CA",
                leaf.subject()
            )));
        }

        let mut added = 0;
        for (index, cert) in chain.iter().enumerate() {
            let role = if index == 0 {
                StoreRole::Root
            } else {
                StoreRole::Intermediate
            };
            if self
                .trust_store
                .insert_if_absent(role, StoreEntry::public(cert.clone()))?
            {
                added += 1;
            }
        }
        if self
            .trust_store
            .insert_if_absent(StoreRole::Personal, StoreEntry::key_bound(leaf.clone()))?
        {
            added += 1;
        }

        // Preconditions above guarantee the key matches a non-CA leaf
        let key = match std::mem::replace(&mut self.state, HsmState::Disposed) {
            HsmState::Pending(key) => key,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "HSM for {} is not awaiting a certificate",
                    self.device_id
                )))
            }
        };
        let leaf = CertificateWithKey::bind(leaf, key)?;

        info!(
            device_id = %self.device_id,
            subject = %leaf.subject(),
            chain_len = chain.len(),
            store_entries_added = added,
            "STATUS: DeviceHsm :: Certificate installed :: ACTIVE"
        );
        self.state = HsmState::Installed { leaf, chain };
        Ok(true)
    }

    /// Run `f` with the with-key leaf.
    pub fn execute_with_signing_key<T>(
        &self,
        f: impl FnOnce(&CertificateWithKey) -> Result<T>,
    ) -> Result<T> {
        match &self.state {
            HsmState::Installed { leaf, .. } => f(leaf),
            HsmState::Pending(_) => Err(Error::NotReady(format!(
                "no certificate installed for {}",
                self.device_id
            ))),
            HsmState::Disposed => Err(Error::NotReady(format!(
                "HSM for {} has been disposed",
                self.device_id
            ))),
        }
    }

    /// Public-only leaf, once installed.
    pub fn leaf_certificate(&self) -> Option<&Certificate> {
        match &self.state {
            HsmState::Installed { leaf, .. } => Some(leaf.public_certificate()),
            _ => None,
        }
    }

    /// Root-first issuing chain, once installed.
    pub fn chain(&self) -> Option<&[Certificate]> {
        match &self.state {
            HsmState::Installed { chain, .. } => Some(chain),
            _ => None,
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self.state, HsmState::Installed { .. })
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state, HsmState::Disposed)
    }

    /// Drop the key and cached certificates. Idempotent.
    pub fn dispose(&mut self) {
        if !self.is_disposed() {
            self.state = HsmState::Disposed;
            info!(device_id = %self.device_id, "Device key disposed");
        }
    }
}

impl Drop for DeviceHsm {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust_store::InMemoryTrustStore;
    use skytrust_core::HashAlgorithm;
    use skytrust_crypto::{CertRequestEngine, DistinguishedName};

    struct Issuer {
        engine: CertRequestEngine,
        root: CertificateWithKey,
    }

    impl Issuer {
        fn new() -> Self {
            let engine = CertRequestEngine::new();
            let key = SecretKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
            let request = engine
                .create_request(
                    DistinguishedName::new("Test Root CA").with_organization("Fabrikam"),
                    key.public_key(),
                    HashAlgorithm::Sha256,
                    true,
                    None,
                )
                .unwrap();
            let root = engine.self_sign(&request, key, 365).unwrap();
            Self { engine, root }
        }

        fn issue_for(&self, hsm: &DeviceHsm) -> Certificate {
            let request = self
                .engine
                .create_request(
                    DistinguishedName::new(hsm.unique_device_id()).with_organization("Fabrikam"),
                    hsm.public_key(),
                    HashAlgorithm::Sha256,
                    false,
                    None,
                )
                .unwrap();
            self.engine.issue(&request, &self.root, 30).unwrap()
        }

        fn chain(&self) -> Vec<Certificate> {
            vec![self.root.public_certificate().clone()]
        }
    }

    fn new_hsm(store: &Arc<InMemoryTrustStore>) -> DeviceHsm {
        DeviceHsm::new(KeyAlgorithm::EcdsaP256, store.clone()).unwrap()
    }

    #[test]
    fn test_device_id_is_stable_per_key() {
        let store = Arc::new(InMemoryTrustStore::new());
        let a = new_hsm(&store);
        let b = new_hsm(&store);

        assert!(a.unique_device_id().starts_with("device-"));
        assert_eq!(a.unique_device_id().len(), "device-".len() + 32);
        assert_ne!(a.unique_device_id(), b.unique_device_id());
        assert_eq!(
            a.unique_device_id(),
            format!("device-{}", a.public_key().fingerprint())
        );
    }

    #[test]
    fn test_signing_requires_installed_leaf() {
        let store = Arc::new(InMemoryTrustStore::new());
        let hsm = new_hsm(&store);
        let err = hsm
            .execute_with_signing_key(|leaf| leaf.sign(b"hello"))
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
        assert!(hsm.leaf_certificate().is_none());
    }

    #[test]
    fn test_store_certificate_once() {
        let store = Arc::new(InMemoryTrustStore::new());
        let issuer = Issuer::new();
        let mut hsm = new_hsm(&store);
        let leaf = issuer.issue_for(&hsm);

        assert!(hsm.store_certificate(leaf.clone(), issuer.chain()).unwrap());
        assert!(!hsm.store_certificate(leaf.clone(), issuer.chain()).unwrap());

        assert_eq!(store.list(StoreRole::Personal).unwrap().len(), 1);
        assert_eq!(store.list(StoreRole::Root).unwrap().len(), 1);
        assert!(store.list(StoreRole::Intermediate).unwrap().is_empty());

        let exported = hsm.leaf_certificate().unwrap();
        assert!(!exported.has_private_key());
        assert_eq!(exported, &leaf);
        assert!(hsm
            .execute_with_signing_key(|leaf| Ok(leaf.has_private_key()))
            .unwrap());

        let signature = hsm
            .execute_with_signing_key(|leaf| leaf.sign(b"telemetry"))
            .unwrap();
        hsm.public_key().verify(b"telemetry", &signature).unwrap();
    }

    #[test]
    fn test_rejects_foreign_leaf() {
        let store = Arc::new(InMemoryTrustStore::new());
        let issuer = Issuer::new();
        let other = new_hsm(&store);
        let mut hsm = new_hsm(&store);

        let err = hsm
            .store_certificate(issuer.issue_for(&other), issuer.chain())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(!hsm.is_installed());
        assert!(store.list(StoreRole::Personal).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_empty_chain() {
        let store = Arc::new(InMemoryTrustStore::new());
        let issuer = Issuer::new();
        let mut hsm = new_hsm(&store);
        let leaf = issuer.issue_for(&hsm);

        assert!(matches!(
            hsm.store_certificate(leaf, Vec::new()),
            Err(Error::EmptyChain)
        ));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let store = Arc::new(InMemoryTrustStore::new());
        let issuer = Issuer::new();
        let mut hsm = new_hsm(&store);
        let leaf = issuer.issue_for(&hsm);
        hsm.store_certificate(leaf.clone(), issuer.chain()).unwrap();

        hsm.dispose();
        hsm.dispose();
        assert!(hsm.is_disposed());
        assert!(hsm.chain().is_none());
        assert!(matches!(
            hsm.execute_with_signing_key(|leaf| leaf.sign(b"x")),
            Err(Error::NotReady(_))
        ));
        assert!(matches!(
            hsm.store_certificate(leaf, issuer.chain()),
            Err(Error::InvalidRequest(_))
        ));
    }
}
