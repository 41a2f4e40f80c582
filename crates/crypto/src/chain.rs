//! Certificate chain validation.
//!
//! Chains are ordered root first, leaf last. Validation walks the chain
//! pairwise and checks, for every link:
//!
//! - the child's issuer name equals the parent's subject name
//! - the parent is a CA whose key usage allows certificate signing
//! - the child's signature verifies under the parent's public key
//! - no CA path length constraint is exceeded below it
//!
//! and, for every certificate, that it is valid at the check time. The root
//! must be self-signed and, unless unknown CAs are allowed, pinned as a
//! trust anchor.

use crate::certificate::Certificate;
use serde::Serialize;
use skytrust_core::{Error, Result};
use std::fmt;
use time::OffsetDateTime;
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// What the validator accepts as a root.
#[derive(Debug, Clone, Default)]
pub struct ChainPolicy {
    /// Accept any self-signed root instead of requiring a pinned anchor.
    pub allow_unknown_ca: bool,
    /// Pinned root thumbprints (hex SHA-256 of the DER).
    pub trust_anchors: Vec<String>,
    /// Check time; `None` means now.
    pub validation_time: Option<OffsetDateTime>,
}

impl ChainPolicy {
    /// Accept any self-signed root.
    pub fn allow_unknown_ca() -> Self {
        Self {
            allow_unknown_ca: true,
            ..Default::default()
        }
    }

    /// Require the root to be `anchor`.
    pub fn pinned(anchor: &Certificate) -> Self {
        Self {
            allow_unknown_ca: false,
            trust_anchors: vec![anchor.thumbprint()],
            validation_time: None,
        }
    }

    pub fn at(mut self, time: OffsetDateTime) -> Self {
        self.validation_time = Some(time);
        self
    }
}

/// Summary of a chain that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub length: usize,
    pub root_subject: String,
    pub leaf_subject: String,
    pub trusted_root: bool,
}

impl fmt::Display for ChainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} certificates, {} -> {}",
            self.length, self.root_subject, self.leaf_subject
        )
    }
}

/// Validates root-first chains under a [`ChainPolicy`].
#[derive(Debug, Clone, Default)]
pub struct ChainValidator {
    policy: ChainPolicy,
}

impl ChainValidator {
    pub fn new(policy: ChainPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ChainPolicy {
        &self.policy
    }

    /// Validate `chain`, root first.
    pub fn validate(&self, chain: &[Certificate]) -> Result<ChainReport> {
        let (root, leaf) = match (chain.first(), chain.last()) {
            (Some(root), Some(leaf)) => (root, leaf),
            _ => return Err(Error::EmptyChain),
        };
        let now = self
            .policy
            .validation_time
            .unwrap_or_else(OffsetDateTime::now_utc);

        for (index, cert) in chain.iter().enumerate() {
            if !cert.is_valid_at(now) {
                return Err(fail(
                    index,
                    format!(
                        "{} is outside its validity window ({} .. {})",
                        cert.subject(),
                        cert.not_before(),
                        cert.not_after()
                    ),
                ));
            }
        }

        if !root.is_self_issued() {
            return Err(fail(
                0,
                format!("root {} is not self-issued", root.subject()),
            ));
        }
        verify_signed_by(root, root).map_err(|reason| fail(0, reason))?;

        let trusted_root = self
            .policy
            .trust_anchors
            .iter()
            .any(|anchor| anchor.eq_ignore_ascii_case(&root.thumbprint()));
        if !trusted_root && !self.policy.allow_unknown_ca {
            return Err(fail(
                0,
                format!("root {} is not a trust anchor", root.subject()),
            ));
        }

        for (index, pair) in chain.windows(2).enumerate() {
            let (parent, child) = (&pair[0], &pair[1]);
            let child_index = index + 1;

            if child.issuer() != parent.subject() {
                return Err(fail(
                    child_index,
                    format!(
                        "issuer {} does not match parent subject {}",
                        child.issuer(),
                        parent.subject()
                    ),
                ));
            }
            if !parent.is_ca() {
                return Err(fail(
                    index,
                    format!("{} is not a certificate authority", parent.subject()),
                ));
            }
            if let Some(usage) = parent.key_usage() {
                if !usage.key_cert_sign {
                    return Err(fail(
                        index,
                        format!("{} may not sign certificates", parent.subject()),
                    ));
                }
            }
            verify_signed_by(child, parent).map_err(|reason| fail(child_index, reason))?;
        }

        // CAs strictly between a constrained CA and the leaf count toward its limit
        let last = chain.len() - 1;
        for (index, cert) in chain.iter().enumerate().take(last) {
            if let Some(limit) = cert.path_len_constraint() {
                let below = (last - index - 1) as u32;
                if below > limit {
                    return Err(fail(
                        index,
                        format!(
                            "{} allows {} intermediate CAs below it, found {}",
                            cert.subject(),
                            limit,
                            below
                        ),
                    ));
                }
            }
        }

        let report = ChainReport {
            length: chain.len(),
            root_subject: root.subject().to_string(),
            leaf_subject: leaf.subject().to_string(),
            trusted_root,
        };
        debug!(chain = %report, trusted_root, "Chain validated");
        Ok(report)
    }
}

fn fail(index: usize, reason: String) -> Error {
    warn!(index, %reason, "Chain validation failed");
    Error::ChainValidation(format!("certificate {}: {}", index, reason))
}

fn verify_signed_by(child: &Certificate, parent: &Certificate) -> std::result::Result<(), String> {
    let (_, child_x509) =
        X509Certificate::from_der(child.der()).map_err(|e| format!("unparseable: {}", e))?;
    let (_, parent_x509) =
        X509Certificate::from_der(parent.der()).map_err(|e| format!("unparseable: {}", e))?;
    child_x509
        .verify_signature(Some(parent_x509.public_key()))
        .map_err(|e| {
            format!(
                "signature of {} does not verify under {}: {}",
                child.subject(),
                parent.subject(),
                e
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{CertificateWithKey, DistinguishedName};
    use crate::keys::SecretKey;
    use crate::request::CertRequestEngine;
    use skytrust_core::{HashAlgorithm, KeyAlgorithm};
    use time::Duration;

    struct Fixture {
        root: CertificateWithKey,
        intermediate: CertificateWithKey,
        leaf: Certificate,
    }

    fn ca(
        engine: &CertRequestEngine,
        name: &str,
        parent: Option<&CertificateWithKey>,
        path_len: Option<u8>,
    ) -> CertificateWithKey {
        let key = SecretKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let request = engine
            .create_request(
                DistinguishedName::new(name).with_organization("Fabrikam Drone Delivery"),
                key.public_key(),
                HashAlgorithm::Sha256,
                true,
                path_len,
            )
            .unwrap();
        match parent {
            None => engine.self_sign(&request, key, 365).unwrap(),
            Some(parent) => {
                let cert = engine.issue(&request, parent, 200).unwrap();
                CertificateWithKey::bind(cert, key).unwrap()
            }
        }
    }

    fn leaf_under(engine: &CertRequestEngine, issuer: &CertificateWithKey) -> Certificate {
        let key = SecretKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let request = engine
            .create_request(
                DistinguishedName::new("device-leaf"),
                key.public_key(),
                HashAlgorithm::Sha256,
                false,
                None,
            )
            .unwrap();
        engine.issue(&request, issuer, 30).unwrap()
    }

    fn fixture(root_path_len: Option<u8>) -> Fixture {
        let engine = CertRequestEngine::new();
        let root = ca(&engine, "Root CA", None, root_path_len);
        let intermediate = ca(&engine, "Intermediate CA", Some(&root), None);
        let leaf = leaf_under(&engine, &intermediate);
        Fixture {
            root,
            intermediate,
            leaf,
        }
    }

    fn chain_of(f: &Fixture) -> Vec<Certificate> {
        vec![
            f.root.public_certificate().clone(),
            f.intermediate.public_certificate().clone(),
            f.leaf.clone(),
        ]
    }

    #[test]
    fn test_valid_chain_with_unknown_ca() {
        let f = fixture(None);
        let report = ChainValidator::new(ChainPolicy::allow_unknown_ca())
            .validate(&chain_of(&f))
            .unwrap();
        assert_eq!(report.length, 3);
        assert_eq!(report.leaf_subject, "CN=device-leaf");
        assert!(!report.trusted_root);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["length"], 3);
    }

    #[test]
    fn test_pinned_anchor() {
        let f = fixture(None);
        let chain = chain_of(&f);

        let pinned = ChainValidator::new(ChainPolicy::pinned(f.root.public_certificate()));
        assert!(pinned.validate(&chain).unwrap().trusted_root);

        let other = fixture(None);
        let strict = ChainValidator::new(ChainPolicy::pinned(other.root.public_certificate()));
        assert!(matches!(
            strict.validate(&chain),
            Err(Error::ChainValidation(_))
        ));
    }

    #[test]
    fn test_empty_chain() {
        assert!(matches!(
            ChainValidator::default().validate(&[]),
            Err(Error::EmptyChain)
        ));
    }

    #[test]
    fn test_broken_link_detected() {
        let f = fixture(None);
        let other = fixture(None);
        let chain = vec![
            f.root.public_certificate().clone(),
            other.intermediate.public_certificate().clone(),
            other.leaf.clone(),
        ];
        let err = ChainValidator::new(ChainPolicy::allow_unknown_ca())
            .validate(&chain)
            .unwrap_err();
        assert!(matches!(err, Error::ChainValidation(_)));
    }

    #[test]
    fn test_forged_signature_detected() {
        // Same names, different keys: only the signature check can catch it
        let f = fixture(None);
        let engine = CertRequestEngine::new();
        let impostor = ca(&engine, "Root CA", None, None);
        let forged = ca(&engine, "Intermediate CA", Some(&impostor), None);

        let chain = vec![
            f.root.public_certificate().clone(),
            forged.public_certificate().clone(),
        ];
        let err = ChainValidator::new(ChainPolicy::allow_unknown_ca())
            .validate(&chain)
            .unwrap_err();
        assert!(err.to_string().contains("does not verify"));
    }

    #[test]
    fn test_leaf_cannot_act_as_issuer() {
        let f = fixture(None);
        let chain = vec![
            f.root.public_certificate().clone(),
            f.intermediate.public_certificate().clone(),
            f.leaf.clone(),
            f.leaf.clone(),
        ];
        assert!(ChainValidator::new(ChainPolicy::allow_unknown_ca())
            .validate(&chain)
            .is_err());
    }

    #[test]
    fn test_path_len_constraint_enforced() {
        let f = fixture(Some(0));
        let err = ChainValidator::new(ChainPolicy::allow_unknown_ca())
            .validate(&chain_of(&f))
            .unwrap_err();
        assert!(err.to_string().contains("intermediate CAs below it"));

        let ok = fixture(Some(1));
        assert!(ChainValidator::new(ChainPolicy::allow_unknown_ca())
            .validate(&chain_of(&ok))
            .is_ok());
    }

    #[test]
    fn test_expired_at_check_time() {
        let f = fixture(None);
        let later = f.leaf.not_after() + Duration::days(1);
        let err = ChainValidator::new(ChainPolicy::allow_unknown_ca().at(later))
            .validate(&chain_of(&f))
            .unwrap_err();
        assert!(err.to_string().contains("validity window"));
    }
}
