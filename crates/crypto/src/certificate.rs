//! X.509 certificate model.
//!
//! A certificate exists in exactly one of two forms:
//!
//! - [`Certificate`]: public-only. DER plus parsed metadata; safe to export,
//!   persist and hand to collaborators. It never carries a key.
//! - [`CertificateWithKey`]: a public-only certificate bound to the
//!   [`SecretKey`] that matches its subject public key. Only authorities and
//!   device HSMs hold these; they hand out the public-only form.

use crate::keys::{signature_scheme, PublicKeyInfo, SecretKey};
use rcgen::CertificateParams;
use sha2::{Digest, Sha256};
use skytrust_core::{Error, KeyAlgorithm, Result};
use std::fmt;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;

/// Guard against oversized input before handing it to the DER parser.
const MAX_CERT_SIZE: usize = 16 * 1024;

const OID_ED25519: &str = "1.3.101.112";

/// Subject or issuer name, rendered as `CN=…, O=…, OU=…, C=…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DistinguishedName {
    common_name: String,
    organization: Option<String>,
    organizational_unit: Option<String>,
    country: Option<String>,
}

impl DistinguishedName {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            organizational_unit: None,
            country: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = Some(unit.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    /// Attribute order here must match `Display` so rendered names compare
    /// equal to what the parser reports for issued certificates.
    pub(crate) fn to_rcgen(&self) -> rcgen::DistinguishedName {
        use rcgen::DnType;

        let mut dn = rcgen::DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        if let Some(o) = &self.organization {
            dn.push(DnType::OrganizationName, o.as_str());
        }
        if let Some(ou) = &self.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou.as_str());
        }
        if let Some(c) = &self.country {
            dn.push(DnType::CountryName, c.as_str());
        }
        dn
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN={}", self.common_name)?;
        if let Some(o) = &self.organization {
            write!(f, ", O={}", o)?;
        }
        if let Some(ou) = &self.organizational_unit {
            write!(f, ", OU={}", ou)?;
        }
        if let Some(c) = &self.country {
            write!(f, ", C={}", c)?;
        }
        Ok(())
    }
}

/// Key usage bits as parsed from the certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyUsageFlags {
    pub digital_signature: bool,
    pub non_repudiation: bool,
    pub key_encipherment: bool,
    pub data_encipherment: bool,
    pub key_cert_sign: bool,
    pub crl_sign: bool,
}

impl KeyUsageFlags {
    /// Usage set for issuing authorities.
    pub fn ca() -> Self {
        Self {
            key_cert_sign: true,
            crl_sign: true,
            ..Default::default()
        }
    }

    /// Usage set for devices and other end entities.
    pub fn end_entity() -> Self {
        Self {
            digital_signature: true,
            non_repudiation: true,
            key_encipherment: true,
            data_encipherment: true,
            ..Default::default()
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
struct Metadata {
    subject: String,
    issuer: String,
    common_name: Option<String>,
    organization: Option<String>,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    is_ca: bool,
    path_len_constraint: Option<u32>,
    key_usage: Option<KeyUsageFlags>,
    client_auth: bool,
    subject_key_identifier: Option<Vec<u8>>,
    public_key: PublicKeyInfo,
}

/// Public-only certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    meta: Metadata,
}

impl Certificate {
    /// Parse a DER-encoded certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        if der.len() > MAX_CERT_SIZE {
            return Err(Error::Certificate(format!(
                "certificate is {} bytes, limit is {}",
                der.len(),
                MAX_CERT_SIZE
            )));
        }
        let meta = parse_metadata(&der)?;
        Ok(Self { der, meta })
    }

    /// Parse the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(pem: &str) -> Result<Self> {
        crate::pem::parse_certificate(pem)
    }

    pub fn to_pem(&self) -> String {
        crate::pem::encode_certificate(&self.der)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject rendered as `CN=…, O=…`.
    pub fn subject(&self) -> &str {
        &self.meta.subject
    }

    pub fn issuer(&self) -> &str {
        &self.meta.issuer
    }

    pub fn common_name(&self) -> Option<&str> {
        self.meta.common_name.as_deref()
    }

    pub fn organization(&self) -> Option<&str> {
        self.meta.organization.as_deref()
    }

    /// Raw serial number bytes as encoded.
    pub fn serial(&self) -> &[u8] {
        &self.meta.serial
    }

    pub fn serial_hex(&self) -> String {
        hex::encode(&self.meta.serial)
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.meta.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.meta.not_after
    }

    pub fn is_ca(&self) -> bool {
        self.meta.is_ca
    }

    pub fn path_len_constraint(&self) -> Option<u32> {
        self.meta.path_len_constraint
    }

    pub fn key_usage(&self) -> Option<KeyUsageFlags> {
        self.meta.key_usage
    }

    /// Extended key usage includes TLS client authentication.
    pub fn has_client_auth(&self) -> bool {
        self.meta.client_auth
    }

    pub fn subject_key_identifier(&self) -> Option<&[u8]> {
        self.meta.subject_key_identifier.as_deref()
    }

    pub fn public_key(&self) -> &PublicKeyInfo {
        &self.meta.public_key
    }

    /// Always `false`: the public-only form never carries a key.
    pub fn has_private_key(&self) -> bool {
        false
    }

    pub fn is_self_issued(&self) -> bool {
        self.meta.subject == self.meta.issuer
    }

    pub fn is_valid_at(&self, at: OffsetDateTime) -> bool {
        self.meta.not_before <= at && at <= self.meta.not_after
    }

    /// Hex SHA-256 over the DER encoding.
    pub fn thumbprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.meta.subject)
            .field("issuer", &self.meta.issuer)
            .field("serial", &self.serial_hex())
            .field("not_before", &self.meta.not_before)
            .field("not_after", &self.meta.not_after)
            .field("is_ca", &self.meta.is_ca)
            .finish()
    }
}

fn parse_metadata(der: &[u8]) -> Result<Metadata> {
    let (rest, x509) = X509Certificate::from_der(der)
        .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {}", e)))?;
    if !rest.is_empty() {
        return Err(Error::Certificate(format!(
            "{} trailing bytes after certificate",
            rest.len()
        )));
    }

    let ext_err = |e: x509_parser::error::X509Error| {
        Error::Certificate(format!("Malformed extension: {}", e))
    };

    let (is_ca, path_len_constraint) = x509
        .basic_constraints()
        .map_err(ext_err)?
        .map(|bc| (bc.value.ca, bc.value.path_len_constraint))
        .unwrap_or((false, None));

    let key_usage = x509.key_usage().map_err(ext_err)?.map(|ku| KeyUsageFlags {
        digital_signature: ku.value.digital_signature(),
        non_repudiation: ku.value.non_repudiation(),
        key_encipherment: ku.value.key_encipherment(),
        data_encipherment: ku.value.data_encipherment(),
        key_cert_sign: ku.value.key_cert_sign(),
        crl_sign: ku.value.crl_sign(),
    });

    let client_auth = x509
        .extended_key_usage()
        .map_err(ext_err)?
        .map(|eku| eku.value.client_auth)
        .unwrap_or(false);

    let subject_key_identifier = x509.extensions().iter().find_map(|ext| {
        match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
            _ => None,
        }
    });

    let spki = x509.public_key();
    let algorithm = match spki.parsed() {
        Ok(PublicKey::RSA(_)) => KeyAlgorithm::Rsa,
        Ok(PublicKey::EC(point)) => match point.key_size() {
            256 => KeyAlgorithm::EcdsaP256,
            384 => KeyAlgorithm::EcdsaP384,
            bits => {
                return Err(Error::UnsupportedKeyAlgorithm(format!(
                    "EC key of {} bits",
                    bits
                )))
            }
        },
        _ if spki.algorithm.algorithm.to_id_string() == OID_ED25519 => KeyAlgorithm::Ed25519,
        _ => {
            return Err(Error::UnsupportedKeyAlgorithm(format!(
                "public key algorithm {}",
                spki.algorithm.algorithm.to_id_string()
            )))
        }
    };

    let common_name = x509
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    let organization = x509
        .subject()
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);

    let meta = Metadata {
        subject: x509.subject().to_string(),
        issuer: x509.issuer().to_string(),
        common_name,
        organization,
        serial: x509.raw_serial().to_vec(),
        not_before: x509.validity().not_before.to_datetime(),
        not_after: x509.validity().not_after.to_datetime(),
        is_ca,
        path_len_constraint,
        key_usage,
        client_auth,
        subject_key_identifier,
        public_key: PublicKeyInfo::new(algorithm, spki.raw.to_vec()),
    };
    Ok(meta)
}

/// Certificate bound to its private key.
///
/// Not `Clone`: the key has a single owner, and dropping the value
/// zeroizes it.
pub struct CertificateWithKey {
    certificate: Certificate,
    key: SecretKey,
    /// Signing handle carrying the issuer name and key identifier; CA only
    issuer: Option<rcgen::Certificate>,
}

impl CertificateWithKey {
    /// Bind a certificate to the key matching its subject public key.
    pub fn bind(certificate: Certificate, key: SecretKey) -> Result<Self> {
        if certificate.public_key().spki_der() != key.public_key().spki_der() {
            return Err(Error::InvalidRequest(format!(
                "key {} does not match certificate {}",
                key.public_key().fingerprint(),
                certificate.subject()
            )));
        }

        let issuer = if certificate.is_ca() {
            Some(issuer_handle(&certificate, &key)?)
        } else {
            None
        };

        Ok(Self {
            certificate,
            key,
            issuer,
        })
    }

    /// Public-only form, the only one that may leave the owner.
    pub fn public_certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn has_private_key(&self) -> bool {
        true
    }

    pub fn subject(&self) -> &str {
        self.certificate.subject()
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.certificate.not_before()
    }

    /// Sign an opaque payload with the bound key.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.key.sign(payload)
    }

    pub(crate) fn key(&self) -> &SecretKey {
        &self.key
    }

    pub(crate) fn issuer_handle(&self) -> Result<&rcgen::Certificate> {
        self.issuer.as_ref().ok_or_else(|| {
            Error::InvalidRequest(format!(
                "{} is not a certificate authority",
                self.certificate.subject()
            ))
        })
    }
}

impl fmt::Debug for CertificateWithKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateWithKey")
            .field("certificate", &self.certificate)
            .field("key", &self.key)
            .finish()
    }
}

/// rcgen signs children from the issuer's parameters; rebuild them from
/// the issued certificate so the child issuer name is byte-identical.
fn issuer_handle(certificate: &Certificate, key: &SecretKey) -> Result<rcgen::Certificate> {
    let params = CertificateParams::from_ca_cert_pem(&certificate.to_pem())
        .map_err(|e| Error::Certificate(format!("Failed to load issuer parameters: {}", e)))?;
    let hash = key
        .algorithm()
        .native_hash()
        .unwrap_or(skytrust_core::HashAlgorithm::Sha256);
    let key_pair = key.key_pair_for(signature_scheme(key.algorithm(), hash)?)?;
    params
        .self_signed(&key_pair)
        .map_err(|e| Error::Crypto(format!("Failed to prepare issuer: {}", e)))
}
