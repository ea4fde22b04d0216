//! X.509 trust bundles.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use crate::bundle::BundleSource;
use crate::cert::{split_der_certificates, Certificate, CertificateError};
use crate::spiffe_id::TrustDomain;

/// Trusted X.509 authorities for one [`TrustDomain`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct X509Bundle {
    trust_domain: TrustDomain,
    authorities: Vec<Certificate>,
}

/// A set of [`X509Bundle`] keyed by [`TrustDomain`].
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct X509BundleSet {
    bundles: HashMap<TrustDomain, Arc<X509Bundle>>,
}

/// Errors parsing an [`X509Bundle`] out of DER-encoded authorities.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum X509BundleError {
    /// A certificate in the bundle could not be parsed.
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

impl X509Bundle {
    /// Creates an empty bundle for the given trust domain.
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            authorities: Vec::new(),
        }
    }

    /// Parses a bundle from a concatenated list of ASN.1 DER certificates,
    /// the form in which the Workload API delivers X.509 authorities.
    ///
    /// # Errors
    ///
    /// Returns an [`X509BundleError`] if any certificate in the input fails
    /// to parse.
    pub fn parse_from_der(
        trust_domain: TrustDomain,
        bundle_der: &[u8],
    ) -> Result<Self, X509BundleError> {
        let authorities = split_der_certificates(bundle_der)?;
        Ok(Self {
            trust_domain,
            authorities,
        })
    }

    /// Builds a bundle from individually DER-encoded certificates.
    ///
    /// # Errors
    ///
    /// Returns an [`X509BundleError`] if any certificate fails to parse.
    pub fn from_authorities(
        trust_domain: TrustDomain,
        authorities: &[&[u8]],
    ) -> Result<Self, X509BundleError> {
        let authorities = authorities
            .iter()
            .map(|der| Certificate::try_from(*der))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            trust_domain,
            authorities,
        })
    }

    /// Adds one DER-encoded X.509 authority, verifying that it parses.
    ///
    /// # Errors
    ///
    /// Returns an [`X509BundleError`] if the bytes are not a valid
    /// certificate.
    pub fn add_authority(&mut self, authority_der: &[u8]) -> Result<(), X509BundleError> {
        self.authorities.push(Certificate::try_from(authority_der)?);
        Ok(())
    }

    /// The trust domain this bundle serves.
    pub const fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The X.509 authorities in the bundle.
    pub fn authorities(&self) -> &[Certificate] {
        &self.authorities
    }
}

impl X509BundleSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            bundles: HashMap::new(),
        }
    }

    /// Inserts a bundle, replacing any existing bundle for the same trust
    /// domain.
    pub fn add_bundle(&mut self, bundle: X509Bundle) {
        let trust_domain = bundle.trust_domain().clone();
        self.bundles.insert(trust_domain, Arc::new(bundle));
    }

    /// Returns the bundle for the given trust domain.
    pub fn get(&self, trust_domain: &TrustDomain) -> Option<Arc<X509Bundle>> {
        self.bundles.get(trust_domain).cloned()
    }

    /// The number of bundles in the set.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Whether the set holds no bundles.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Iterates over `(TrustDomain, X509Bundle)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&TrustDomain, &Arc<X509Bundle>)> {
        self.bundles.iter()
    }
}

impl BundleSource for X509BundleSet {
    type Item = X509Bundle;
    type Error = Infallible;

    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error> {
        Ok(self.get(trust_domain))
    }
}
