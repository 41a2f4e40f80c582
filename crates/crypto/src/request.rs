//! Certificate request construction and issuance.
//!
//! [`CertRequestEngine`] turns a subject name and public key into a
//! [`CertificateRequest`] carrying the fleet's standard extensions, then
//! either self-signs it or issues it under an authority.
//!
//! # Validity
//!
//! Issued certificates inherit the issuer's own `notBefore` instead of the
//! wall-clock time at signing, so every certificate in a chain shares the
//! issuance epoch of the root. Self-signed certificates start now.
//!
//! # Serial numbers
//!
//! Serials are 10 bytes: a fixed `0x01` prefix (keeps the DER integer
//! positive and non-zero-padded) followed by 9 bytes from the OS CSPRNG.

use crate::certificate::{Certificate, CertificateWithKey, DistinguishedName};
use crate::keys::{signature_scheme, PublicKeyInfo, SecretKey};
use rand::{rngs::OsRng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod,
    KeyUsagePurpose, SerialNumber,
};
use skytrust_core::{Error, HashAlgorithm, Result};
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Serial length in bytes, including the prefix byte.
pub const SERIAL_LEN: usize = 10;

/// Unsigned certificate template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    subject: DistinguishedName,
    public_key: PublicKeyInfo,
    hash: HashAlgorithm,
    is_ca: bool,
    path_len_constraint: Option<u8>,
}

impl CertificateRequest {
    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn public_key(&self) -> &PublicKeyInfo {
        &self.public_key
    }

    pub fn hash(&self) -> HashAlgorithm {
        self.hash
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn path_len_constraint(&self) -> Option<u8> {
        self.path_len_constraint
    }

    fn to_params(
        &self,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
        serial: SerialNumber,
    ) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.distinguished_name = self.subject.to_rcgen();
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(serial);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.key_identifier_method =
            KeyIdMethod::PreSpecified(self.public_key.key_identifier());

        if self.is_ca {
            params.is_ca = IsCa::Ca(match self.path_len_constraint {
                Some(n) => BasicConstraints::Constrained(n),
                None => BasicConstraints::Unconstrained,
            });
            params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        } else {
            params.is_ca = IsCa::ExplicitNoCa;
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::ContentCommitment,
                KeyUsagePurpose::KeyEncipherment,
                KeyUsagePurpose::DataEncipherment,
            ];
        }
        params
    }
}

/// Builds requests and signs certificates.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertRequestEngine;

impl CertRequestEngine {
    pub fn new() -> Self {
        Self
    }

    /// Build a request for `key` carrying clientAuth EKU, a subject key
    /// identifier, CA or end-entity key usage, and basic constraints.
    pub fn create_request(
        &self,
        subject: DistinguishedName,
        key: &PublicKeyInfo,
        hash: HashAlgorithm,
        is_ca: bool,
        path_len_constraint: Option<u8>,
    ) -> Result<CertificateRequest> {
        if !key.algorithm().is_certificate_capable() {
            return Err(Error::UnsupportedKeyAlgorithm(format!(
                "{} keys are not supported; use RSA or ECDSA",
                key.algorithm()
            )));
        }
        if subject.common_name().trim().is_empty() {
            return Err(Error::InvalidRequest(
                "subject common name is empty".to_string(),
            ));
        }

        Ok(CertificateRequest {
            subject,
            public_key: key.clone(),
            hash,
            is_ca,
            path_len_constraint: if is_ca { path_len_constraint } else { None },
        })
    }

    /// Issue `request` under `issuer`, valid from the issuer's `notBefore`
    /// for `validity_days`.
    pub fn issue(
        &self,
        request: &CertificateRequest,
        issuer: &CertificateWithKey,
        validity_days: u32,
    ) -> Result<Certificate> {
        if validity_days == 0 {
            return Err(Error::InvalidRequest(
                "validity must be at least one day".to_string(),
            ));
        }
        let handle = issuer.issuer_handle()?;

        let not_before = issuer.not_before();
        let not_after = not_before + Duration::days(i64::from(validity_days));
        let mut params = request.to_params(not_before, not_after, self.next_serial());
        params.use_authority_key_identifier_extension = true;

        // ECDSA issuers sign with their curve's digest; RSA honors the request
        let issuer_key = issuer.key();
        let hash = issuer_key.algorithm().native_hash().unwrap_or(request.hash);
        let key_pair = issuer_key.key_pair_for(signature_scheme(issuer_key.algorithm(), hash)?)?;

        let subject_key = rcgen::SubjectPublicKeyInfo::from_der(request.public_key.spki_der())
            .map_err(|e| Error::Crypto(format!("Invalid subject public key: {}", e)))?;

        let issued = params
            .signed_by(&subject_key, handle, &key_pair)
            .map_err(|e| Error::Crypto(format!("Failed to sign certificate: {}", e)))?;
        let certificate = Certificate::from_der(issued.der().to_vec())?;

        debug!(
            subject = %certificate.subject(),
            issuer = %certificate.issuer(),
            serial = %certificate.serial_hex(),
            "Issued certificate"
        );
        Ok(certificate)
    }

    /// Self-sign `request` with `key`, valid from now for `validity_days`.
    ///
    /// The key moves into the returned with-key certificate.
    pub fn self_sign(
        &self,
        request: &CertificateRequest,
        key: SecretKey,
        validity_days: u32,
    ) -> Result<CertificateWithKey> {
        let certificate = self.self_signed_certificate(request, &key, validity_days)?;
        CertificateWithKey::bind(certificate, key)
    }

    /// Self-sign `request` again with the key already bound to `signer`.
    ///
    /// Returns a fresh public-only certificate; `signer` is left untouched.
    pub fn renew(
        &self,
        request: &CertificateRequest,
        signer: &CertificateWithKey,
        validity_days: u32,
    ) -> Result<Certificate> {
        self.self_signed_certificate(request, signer.key(), validity_days)
    }

    fn self_signed_certificate(
        &self,
        request: &CertificateRequest,
        key: &SecretKey,
        validity_days: u32,
    ) -> Result<Certificate> {
        if validity_days == 0 {
            return Err(Error::InvalidRequest(
                "validity must be at least one day".to_string(),
            ));
        }
        if key.public_key() != request.public_key() {
            return Err(Error::InvalidRequest(
                "signing key does not match the request public key".to_string(),
            ));
        }

        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + Duration::days(i64::from(validity_days));
        let params = request.to_params(not_before, not_after, self.next_serial());

        let key_pair = key.key_pair_for(signature_scheme(key.algorithm(), request.hash)?)?;
        let signed = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Crypto(format!("Failed to self-sign certificate: {}", e)))?;
        let certificate = Certificate::from_der(signed.der().to_vec())?;

        debug!(
            subject = %certificate.subject(),
            serial = %certificate.serial_hex(),
            "Self-signed certificate"
        );
        Ok(certificate)
    }

    fn next_serial(&self) -> SerialNumber {
        let mut serial = [0u8; SERIAL_LEN];
        serial[0] = 0x01;
        OsRng.fill_bytes(&mut serial[1..]);
        SerialNumber::from_slice(&serial)
    }
}
