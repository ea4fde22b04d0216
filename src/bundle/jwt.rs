//! JWT trust bundles: RFC 7517 JWKS documents broken into per-key
//! authorities.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::bundle::BundleSource;
use crate::spiffe_id::TrustDomain;

/// One JWT authority: a JWK kept as raw JSON, plus its extracted key ID.
///
/// The key material is not interpreted here; it is handed to the JWT
/// validation layer as-is when a token's `kid` header matches.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JwtAuthority {
    kid: Arc<str>,
    jwk_json: Arc<[u8]>,
}

/// Trusted JWT authorities for one [`TrustDomain`], keyed by `kid`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JwtBundle {
    trust_domain: TrustDomain,
    authorities: HashMap<String, Arc<JwtAuthority>>,
}

/// A set of [`JwtBundle`] keyed by [`TrustDomain`].
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct JwtBundleSet {
    bundles: BTreeMap<TrustDomain, Arc<JwtBundle>>,
}

/// Errors building a [`JwtBundle`] from JWKS bytes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JwtBundleError {
    /// A key in the document has no `kid` to identify it by.
    #[error("jwk has no 'kid' field")]
    MissingKeyId,

    /// The document has no top-level `keys` array.
    #[error("jwks document has no 'keys' array")]
    MissingKeys,

    /// The bytes are not valid JSON.
    #[error("cannot deserialize jwks document")]
    Deserialize(#[from] serde_json::Error),
}

impl JwtAuthority {
    /// Parses a single JWK object. The `kid` field is required; it is how
    /// bundles are indexed and how token headers refer to signing keys.
    ///
    /// # Errors
    ///
    /// Returns a [`JwtBundleError`] if the bytes are not valid JSON or the
    /// JWK carries no string `kid`.
    pub fn from_jwk_json(jwk_json: &[u8]) -> Result<Self, JwtBundleError> {
        let value: Value = serde_json::from_slice(jwk_json)?;

        let kid = value
            .get("kid")
            .and_then(Value::as_str)
            .ok_or(JwtBundleError::MissingKeyId)?;

        Ok(Self {
            kid: Arc::from(kid),
            jwk_json: Arc::from(jwk_json.to_vec()),
        })
    }

    /// The key ID (`kid`) of this authority.
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    /// The JWK as JSON bytes.
    pub fn jwk_json(&self) -> &[u8] {
        &self.jwk_json
    }
}

impl JwtBundle {
    /// Creates an empty bundle for the given trust domain.
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            authorities: HashMap::new(),
        }
    }

    /// Parses an RFC 7517 JWKS document, the form in which the Workload API
    /// delivers JWT authorities. Every key in the document must carry a
    /// `kid`.
    ///
    /// # Errors
    ///
    /// Returns a [`JwtBundleError`] if the bytes are not valid JSON, the
    /// document has no `keys` array, or any key lacks a `kid`.
    pub fn from_jwks(trust_domain: TrustDomain, jwks: &[u8]) -> Result<Self, JwtBundleError> {
        let value: Value = serde_json::from_slice(jwks)?;

        let keys = value
            .get("keys")
            .and_then(Value::as_array)
            .ok_or(JwtBundleError::MissingKeys)?;

        let mut authorities = HashMap::with_capacity(keys.len());
        for key in keys {
            let authority = JwtAuthority::from_jwk_json(&serde_json::to_vec(key)?)?;
            authorities.insert(authority.key_id().to_owned(), Arc::new(authority));
        }

        Ok(Self {
            trust_domain,
            authorities,
        })
    }

    /// The trust domain this bundle serves.
    pub const fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Returns the authority whose key ID matches a token's `kid` header.
    pub fn find_authority(&self, key_id: &str) -> Option<&Arc<JwtAuthority>> {
        self.authorities.get(key_id)
    }

    /// Inserts an authority, replacing any existing one with the same `kid`.
    pub fn add_authority(&mut self, authority: JwtAuthority) {
        self.authorities
            .insert(authority.key_id().to_owned(), Arc::new(authority));
    }

    /// Iterates over the authorities in the bundle.
    pub fn authorities(&self) -> impl Iterator<Item = &Arc<JwtAuthority>> {
        self.authorities.values()
    }
}

impl JwtBundleSet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self {
            bundles: BTreeMap::new(),
        }
    }

    /// Inserts a bundle, replacing any existing bundle for the same trust
    /// domain.
    pub fn add_bundle(&mut self, bundle: JwtBundle) {
        let trust_domain = bundle.trust_domain().clone();
        self.bundles.insert(trust_domain, Arc::new(bundle));
    }

    /// Returns the bundle for the given trust domain.
    pub fn get(&self, trust_domain: &TrustDomain) -> Option<Arc<JwtBundle>> {
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

    /// Iterates over `(TrustDomain, JwtBundle)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&TrustDomain, &Arc<JwtBundle>)> {
        self.bundles.iter()
    }
}

impl BundleSource for JwtBundleSet {
    type Item = JwtBundle;
    type Error = Infallible;

    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error> {
        Ok(self.get(trust_domain))
    }
}
