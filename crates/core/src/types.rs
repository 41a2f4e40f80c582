//! Algorithm identifiers shared between configuration and the crypto engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Asymmetric key family of a certificate subject or issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// ECDSA over NIST P-256
    EcdsaP256,
    /// ECDSA over NIST P-384
    EcdsaP384,
    /// RSA of any modulus size (import only)
    Rsa,
    /// Ed25519; parsed and generated, but rejected for certificate requests
    Ed25519,
}

impl KeyAlgorithm {
    /// RSA or ECDSA, the only families accepted for certificate requests.
    pub fn is_certificate_capable(&self) -> bool {
        !matches!(self, KeyAlgorithm::Ed25519)
    }

    /// Digest an ECDSA key signs with; `None` for RSA, which accepts any.
    pub fn native_hash(&self) -> Option<HashAlgorithm> {
        match self {
            KeyAlgorithm::EcdsaP256 => Some(HashAlgorithm::Sha256),
            KeyAlgorithm::EcdsaP384 => Some(HashAlgorithm::Sha384),
            KeyAlgorithm::Rsa | KeyAlgorithm::Ed25519 => None,
        }
    }

    /// Whether a signature with this key may use the given digest.
    pub fn supports_hash(&self, hash: HashAlgorithm) -> bool {
        match self {
            KeyAlgorithm::Rsa => true,
            KeyAlgorithm::Ed25519 => false,
            _ => self.native_hash() == Some(hash),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyAlgorithm::EcdsaP256 => "ECDSA-P256",
            KeyAlgorithm::EcdsaP384 => "ECDSA-P384",
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Ed25519 => "Ed25519",
        };
        f.write_str(name)
    }
}

/// Digest used for certificate signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_compatibility() {
        assert!(KeyAlgorithm::EcdsaP256.supports_hash(HashAlgorithm::Sha256));
        assert!(!KeyAlgorithm::EcdsaP256.supports_hash(HashAlgorithm::Sha384));
        assert!(KeyAlgorithm::EcdsaP384.supports_hash(HashAlgorithm::Sha384));
        assert!(KeyAlgorithm::Rsa.supports_hash(HashAlgorithm::Sha512));
        assert!(!KeyAlgorithm::Ed25519.supports_hash(HashAlgorithm::Sha256));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&KeyAlgorithm::EcdsaP384).unwrap();
        assert_eq!(json, "\"ecdsa-p384\"");
        let hash: HashAlgorithm = serde_json::from_str("\"sha512\"").unwrap();
        assert_eq!(hash, HashAlgorithm::Sha512);
    }
}
