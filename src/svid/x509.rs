//! X.509-SVID parsing and validation.

use std::sync::Arc;

use thiserror::Error;
use x509_parser::certificate::X509Certificate;

use crate::cert::{
    parse_x509, split_der_certificates, uri_san_spiffe_id, Certificate, CertificateError,
    PrivateKey, PrivateKeyError,
};
use crate::spiffe_id::SpiffeId;

/// A SPIFFE X509-SVID: a SPIFFE ID bound to a DER-encoded certificate chain
/// and its PKCS#8 private key.
///
/// The first certificate in the chain is the leaf; any remaining entries are
/// the signing certificates needed to chain back to a trust anchor.
///
/// When the Workload API issues several SVIDs it may tag each with an opaque
/// hint so workloads can tell them apart. The hint is transport metadata, not
/// part of the certificate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct X509Svid {
    spiffe_id: SpiffeId,
    cert_chain: Vec<Certificate>,
    private_key: PrivateKey,
    hint: Option<Arc<str>>,
}

/// An error arising while parsing an [`X509Svid`] from DER input.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum X509SvidError {
    /// The certificate chain contained no certificates.
    #[error("no certificates found in chain")]
    EmptyChain,

    /// A required X.509 extension is absent or unparseable.
    #[error("certificate is missing a valid {0} extension")]
    MissingExtension(&'static str),

    /// The leaf certificate sets the CA flag.
    #[error("leaf certificate must not have CA flag set to true")]
    LeafHasCaFlag,

    /// The leaf certificate lacks the `digitalSignature` key usage.
    #[error("leaf certificate must have 'digitalSignature' set as key usage")]
    LeafMissingDigitalSignature,

    /// The leaf certificate sets the `cRLSign` key usage.
    #[error("leaf certificate must not have 'cRLSign' set as key usage")]
    LeafHasCrlSign,

    /// The leaf certificate sets the `keyCertSign` key usage.
    #[error("leaf certificate must not have 'keyCertSign' set as key usage")]
    LeafHasKeyCertSign,

    /// A signing certificate does not set the CA flag.
    #[error("signing certificate must have CA flag set to true")]
    SigningMissingCaFlag,

    /// A signing certificate lacks the `keyCertSign` key usage.
    #[error("signing certificate must have 'keyCertSign' set as key usage")]
    SigningMissingKeyCertSign,

    /// Certificate parsing or SPIFFE ID extraction failed.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Private key decoding failed.
    #[error(transparent)]
    PrivateKey(#[from] PrivateKeyError),
}

impl X509Svid {
    /// Parses an X509-SVID from a concatenated DER certificate chain and a
    /// DER PKCS#8 private key.
    ///
    /// Validates the SPIFFE X509-SVID profile: the leaf must carry exactly
    /// one SPIFFE ID in its URI SAN, must not be a CA, and must have the
    /// `digitalSignature` key usage without `cRLSign`/`keyCertSign`;
    /// remaining chain entries must be CAs with `keyCertSign`.
    ///
    /// # Errors
    ///
    /// Returns an [`X509SvidError`] naming the first violated rule.
    pub fn parse_from_der(
        cert_chain_der: &[u8],
        private_key_der: &[u8],
    ) -> Result<Self, X509SvidError> {
        Self::parse_from_der_with_hint(cert_chain_der, private_key_der, None)
    }

    /// Like [`X509Svid::parse_from_der`], attaching the hint the Workload API
    /// reported alongside the SVID.
    ///
    /// # Errors
    ///
    /// Returns an [`X509SvidError`] naming the first violated rule.
    pub fn parse_from_der_with_hint(
        cert_chain_der: &[u8],
        private_key_der: &[u8],
        hint: Option<Arc<str>>,
    ) -> Result<Self, X509SvidError> {
        let cert_chain = split_der_certificates(cert_chain_der)?;
        let Some(leaf) = cert_chain.first() else {
            return Err(X509SvidError::EmptyChain);
        };

        let parsed_leaf = parse_x509(leaf.as_bytes())?;
        validate_leaf(&parsed_leaf)?;
        let spiffe_id = uri_san_spiffe_id(&parsed_leaf)?;

        for signing in &cert_chain[1..] {
            let parsed = parse_x509(signing.as_bytes())?;
            validate_signing(&parsed)?;
        }

        let private_key = PrivateKey::try_from(private_key_der)?;

        Ok(Self {
            spiffe_id,
            cert_chain,
            private_key,
            hint,
        })
    }

    /// The SPIFFE ID asserted by the leaf certificate's URI SAN.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[Certificate] {
        &self.cert_chain
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.cert_chain[0]
    }

    /// The private key matching the leaf certificate.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// The hint reported by the Workload API, if any.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

fn validate_leaf(cert: &X509Certificate<'_>) -> Result<(), X509SvidError> {
    let key_usage = cert
        .key_usage()
        .ok()
        .flatten()
        .ok_or(X509SvidError::MissingExtension("KeyUsage"))?;
    if !key_usage.value.digital_signature() {
        return Err(X509SvidError::LeafMissingDigitalSignature);
    }
    if key_usage.value.crl_sign() {
        return Err(X509SvidError::LeafHasCrlSign);
    }
    if key_usage.value.key_cert_sign() {
        return Err(X509SvidError::LeafHasKeyCertSign);
    }

    let constraints = cert
        .basic_constraints()
        .ok()
        .flatten()
        .ok_or(X509SvidError::MissingExtension("BasicConstraints"))?;
    if constraints.value.ca {
        return Err(X509SvidError::LeafHasCaFlag);
    }
    Ok(())
}

fn validate_signing(cert: &X509Certificate<'_>) -> Result<(), X509SvidError> {
    let constraints = cert
        .basic_constraints()
        .ok()
        .flatten()
        .ok_or(X509SvidError::MissingExtension("BasicConstraints"))?;
    if !constraints.value.ca {
        return Err(X509SvidError::SigningMissingCaFlag);
    }

    let key_usage = cert
        .key_usage()
        .ok()
        .flatten()
        .ok_or(X509SvidError::MissingExtension("KeyUsage"))?;
    if !key_usage.value.key_cert_sign() {
        return Err(X509SvidError::SigningMissingKeyCertSign);
    }
    Ok(())
}
