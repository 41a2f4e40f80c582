//! Certificate primitives for the SkyTrust chain of trust.
//!
//! This crate provides the X.509 building blocks used by authorities and
//! device HSMs:
//!
//! - **Key material**: zeroize-on-drop private keys and SPKI public keys
//! - **Requests**: certificate requests with the fleet's standard extensions
//! - **Issuance**: self-signing and issuing under an authority
//! - **PEM**: single certificates and root-first bundles
//! - **Validation**: root-first chain checks against pinned or unknown roots
//!
//! # Supported Algorithms
//!
//! - **Certificates**: ECDSA P-256/SHA-256, ECDSA P-384/SHA-384, RSA
//!   PKCS#1 v1.5 with SHA-256/384/512 (import only)
//! - **Payload signatures**: ECDSA P-256 and P-384, DER encoded
//! - **Identifiers**: SHA-256 key identifiers, BLAKE3 fingerprints
//!
//! Ed25519 keys can be generated but are rejected for certificates.

pub mod certificate;
pub mod chain;
pub mod keys;
pub mod pem;
pub mod request;

pub use certificate::{Certificate, CertificateWithKey, DistinguishedName, KeyUsageFlags};
pub use chain::{ChainPolicy, ChainReport, ChainValidator};
pub use keys::{PublicKeyInfo, SecretKey};
pub use request::{CertRequestEngine, CertificateRequest, SERIAL_LEN};
