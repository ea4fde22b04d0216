//! DER-encoded certificate and private key containers.
//!
//! Both types validate their bytes at construction, so every held value is
//! known to be parseable.

use std::fmt;

use pkcs8::PrivateKeyInfo;
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::extensions::GeneralName;
use x509_parser::nom::Err as NomErr;
use zeroize::Zeroize;

use crate::spiffe_id::{SpiffeId, SpiffeIdError};

// Bounds on URI SAN processing; adversarial certificates should not make us
// parse arbitrary amounts of junk.
const MAX_URI_SAN_ENTRIES: usize = 32;
const MAX_URI_SAN_LENGTH: usize = 2048;

/// An error arising while parsing or inspecting X.509 certificates.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum CertificateError {
    /// The bytes are not a parseable DER-encoded X.509 certificate.
    #[error("failed parsing X.509 certificate")]
    Parse(#[from] X509Error),

    /// The certificate carries no URI SAN encoding a SPIFFE ID.
    #[error("certificate has no SPIFFE ID in its URI SAN")]
    MissingSpiffeId,

    /// The certificate carries more than one SPIFFE ID in its URI SAN.
    #[error("certificate encodes more than one SPIFFE ID in its URI SAN")]
    MultipleSpiffeIds,

    /// The certificate has more URI SAN entries than we are willing to scan.
    #[error("certificate has too many URI SAN entries")]
    TooManyUriSanEntries,

    /// A `spiffe://` URI SAN failed SPIFFE ID parsing.
    #[error("failed to parse SPIFFE ID from URI SAN: {0}")]
    InvalidSpiffeId(#[from] SpiffeIdError),
}

/// An error arising while decoding private keys.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum PrivateKeyError {
    /// The bytes are not a parseable PKCS#8 document.
    #[error("failed decoding PKCS#8 private key")]
    DecodePkcs8(pkcs8::Error),
}

/// A single DER-encoded X.509 certificate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// The DER bytes of the certificate.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Extracts the SPIFFE ID from the certificate's URI SAN.
    ///
    /// The certificate must carry exactly one `spiffe://` URI SAN.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::MissingSpiffeId`] or
    /// [`CertificateError::MultipleSpiffeIds`] when the URI SAN does not
    /// encode exactly one SPIFFE ID, and parse errors otherwise.
    pub fn spiffe_id(&self) -> Result<SpiffeId, CertificateError> {
        let parsed = parse_x509(&self.0)?;
        uri_san_spiffe_id(&parsed)
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Certificate {
    type Error = CertificateError;

    fn try_from(der: &[u8]) -> Result<Self, Self::Error> {
        parse_x509(der)?;
        Ok(Self(der.to_vec()))
    }
}

impl TryFrom<Vec<u8>> for Certificate {
    type Error = CertificateError;

    fn try_from(der: Vec<u8>) -> Result<Self, Self::Error> {
        parse_x509(&der)?;
        Ok(Self(der))
    }
}

/// A DER-encoded PKCS#8 private key. Zeroized on drop.
#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// The DER bytes of the key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PrivateKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = PrivateKeyError;

    fn try_from(der: &[u8]) -> Result<Self, Self::Error> {
        PrivateKeyInfo::try_from(der).map_err(PrivateKeyError::DecodePkcs8)?;
        Ok(Self(der.to_vec()))
    }
}

impl TryFrom<Vec<u8>> for PrivateKey {
    type Error = PrivateKeyError;

    fn try_from(der: Vec<u8>) -> Result<Self, Self::Error> {
        PrivateKeyInfo::try_from(der.as_slice()).map_err(PrivateKeyError::DecodePkcs8)?;
        Ok(Self(der))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("PrivateKey")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Parses DER bytes as one X.509 certificate, normalizing the nom error
/// shapes.
pub(crate) fn parse_x509(der: &[u8]) -> Result<X509Certificate<'_>, CertificateError> {
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => Ok(cert),
        Err(NomErr::Incomplete(_)) => Err(CertificateError::Parse(X509Error::InvalidCertificate)),
        Err(NomErr::Error(e) | NomErr::Failure(e)) => Err(CertificateError::Parse(e)),
    }
}

/// Splits a concatenation of DER-encoded certificates into individual
/// [`Certificate`] values, preserving order.
pub(crate) fn split_der_certificates(mut der: &[u8]) -> Result<Vec<Certificate>, CertificateError> {
    let mut certs = Vec::new();
    while !der.is_empty() {
        let rest = match x509_parser::parse_x509_certificate(der) {
            Ok((rest, _)) => rest,
            Err(NomErr::Incomplete(_)) => {
                return Err(CertificateError::Parse(X509Error::InvalidCertificate))
            }
            Err(NomErr::Error(e) | NomErr::Failure(e)) => return Err(CertificateError::Parse(e)),
        };
        let consumed = der.len() - rest.len();
        certs.push(Certificate(der[..consumed].to_vec()));
        der = rest;
    }
    Ok(certs)
}

/// Extracts the single SPIFFE ID a certificate's URI SAN must carry.
pub(crate) fn uri_san_spiffe_id(cert: &X509Certificate<'_>) -> Result<SpiffeId, CertificateError> {
    let san = cert
        .subject_alternative_name()?
        .ok_or(CertificateError::MissingSpiffeId)?;

    let mut found: Option<SpiffeId> = None;
    let mut uri_count = 0usize;
    for name in &san.value.general_names {
        let GeneralName::URI(uri) = name else {
            continue;
        };
        uri_count += 1;
        if uri_count > MAX_URI_SAN_ENTRIES {
            return Err(CertificateError::TooManyUriSanEntries);
        }
        if uri.len() > MAX_URI_SAN_LENGTH || !uri.starts_with("spiffe://") {
            continue;
        }
        let id = SpiffeId::new(uri)?;
        if found.replace(id).is_some() {
            return Err(CertificateError::MultipleSpiffeIds);
        }
    }
    found.ok_or(CertificateError::MissingSpiffeId)
}
