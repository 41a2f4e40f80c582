//! PEM export and import for certificates and chains.
//!
//! Export is used for the human-in-the-loop proof-of-possession upload and
//! for the directory trust store.

use crate::certificate::Certificate;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use skytrust_core::{Error, Result};
use x509_parser::pem::{parse_x509_pem, Pem};

const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const LINE_WIDTH: usize = 64;

/// Encode DER bytes as a `CERTIFICATE` PEM block.
pub fn encode_certificate(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = String::with_capacity(body.len() + body.len() / LINE_WIDTH + 64);
    out.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(LINE_WIDTH) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

/// Parse the first PEM block, which must be a certificate.
pub fn parse_certificate(pem: &str) -> Result<Certificate> {
    let (_, block) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("Failed to read PEM: {}", e)))?;
    certificate_from_block(block)
}

/// Concatenate certificates into one bundle, in the given order.
pub fn encode_chain(chain: &[Certificate]) -> String {
    chain.iter().map(Certificate::to_pem).collect()
}

/// Parse every block of a bundle, preserving order.
pub fn parse_chain(pem: &str) -> Result<Vec<Certificate>> {
    let chain = Pem::iter_from_buffer(pem.as_bytes())
        .map(|block| {
            block
                .map_err(|e| Error::Certificate(format!("Failed to read PEM block: {}", e)))
                .and_then(certificate_from_block)
        })
        .collect::<Result<Vec<_>>>()?;
    if chain.is_empty() {
        return Err(Error::EmptyChain);
    }
    Ok(chain)
}

fn certificate_from_block(block: Pem) -> Result<Certificate> {
    if block.label != CERTIFICATE_LABEL {
        return Err(Error::Certificate(format!(
            "expected {} block, found {}",
            CERTIFICATE_LABEL, block.label
        )));
    }
    Certificate::from_der(block.contents)
}
