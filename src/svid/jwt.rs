//! JWT-SVID parsing and offline validation.
//!
//! Tokens fetched from the Workload API are trusted by construction and go
//! through [`JwtSvid::from_workload_api_token`], which checks structure only.
//! Tokens received from peers go through [`JwtSvid::parse_and_validate`],
//! which also verifies the signature against a JWT bundle source and checks
//! audience and expiry.

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use jsonwebtoken::{DecodingKey, Validation};
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use zeroize::Zeroize;

use crate::bundle::jwt::{JwtAuthority, JwtBundle};
use crate::bundle::BundleSource;
use crate::spiffe_id::{SpiffeId, SpiffeIdError, TrustDomain};

/// Signature algorithms permitted by the SPIFFE JWT-SVID profile.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum JwtAlg {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    PS256,
    PS384,
    PS512,
}

impl JwtAlg {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "RS256" => Self::RS256,
            "RS384" => Self::RS384,
            "RS512" => Self::RS512,
            "ES256" => Self::ES256,
            "ES384" => Self::ES384,
            "PS256" => Self::PS256,
            "PS384" => Self::PS384,
            "PS512" => Self::PS512,
            _ => return None,
        })
    }

    const fn to_jsonwebtoken(self) -> jsonwebtoken::Algorithm {
        match self {
            Self::RS256 => jsonwebtoken::Algorithm::RS256,
            Self::RS384 => jsonwebtoken::Algorithm::RS384,
            Self::RS512 => jsonwebtoken::Algorithm::RS512,
            Self::ES256 => jsonwebtoken::Algorithm::ES256,
            Self::ES384 => jsonwebtoken::Algorithm::ES384,
            Self::PS256 => jsonwebtoken::Algorithm::PS256,
            Self::PS384 => jsonwebtoken::Algorithm::PS384,
            Self::PS512 => jsonwebtoken::Algorithm::PS512,
        }
    }
}

/// A SPIFFE JWT-SVID: a signed token whose `sub` claim is a SPIFFE ID.
///
/// The serialized token is zeroized on drop. The `spiffe_id` accessor and
/// the `sub` claim always agree; the claim is validated during parsing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JwtSvid {
    spiffe_id: SpiffeId,
    hint: Option<Arc<str>>,
    expiry: OffsetDateTime,
    issued_at: Option<OffsetDateTime>,
    claims: Claims,
    kid: String,
    token: Token,
    alg: JwtAlg,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
struct Header {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    typ: Option<String>,
    alg: String,
}

/// Errors parsing a [`JwtSvid`] from a token, or validating its signature
/// and audience.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JwtSvidError {
    /// The `sub` claim is not a valid SPIFFE ID.
    #[error("token 'sub' claim is not a valid SPIFFE ID")]
    InvalidSubject(#[from] SpiffeIdError),

    /// The header carries no `kid`.
    #[error("token header has no 'kid'")]
    MissingKeyId,

    /// The header `typ` is present but neither `JWT` nor `JOSE`.
    #[error("token header 'typ' must be 'JWT' or 'JOSE'")]
    InvalidTyp,

    /// The `exp` claim is not a representable timestamp.
    #[error("token 'exp' claim is out of range")]
    InvalidExpiration,

    /// The `iat` claim is present but not a representable timestamp.
    #[error("token 'iat' claim is out of range")]
    InvalidIssuedAt,

    /// The `alg` header names an algorithm outside the JWT-SVID profile.
    #[error("token 'alg' header is not a supported JWT-SVID algorithm")]
    UnsupportedAlgorithm,

    /// The token does not have three dot-separated parts.
    #[error("malformed token: expected 3 dot-separated parts")]
    InvalidJwtFormat,

    /// A token segment is not valid base64url.
    #[error("malformed token: invalid base64url segment")]
    InvalidBase64,

    /// The header or claims segment is not valid JSON.
    #[error("malformed token: invalid json")]
    InvalidJson(#[source] serde_json::Error),

    /// No JWT bundle is available for the token's trust domain.
    #[error("no JWT bundle for trust domain {0}")]
    BundleNotFound(TrustDomain),

    /// The bundle has no authority matching the token's `kid`.
    #[error("no JWT authority for key id {0:?}")]
    AuthorityNotFound(String),

    /// The bundle source failed while looking up the bundle.
    #[error("bundle source error")]
    BundleSource(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The stored authority JWK could not be parsed.
    #[error("cannot parse authority JWK")]
    InvalidAuthorityJwk(#[from] serde_json::Error),

    /// Signature, expiry, or audience validation failed.
    #[error("token validation failed")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

impl From<Infallible> for JwtSvidError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
struct Token {
    inner: String,
}

impl From<&str> for Token {
    fn from(token: &str) -> Self {
        Self {
            inner: token.to_owned(),
        }
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        self.inner.as_ref()
    }
}

/// The registered claims a JWT-SVID carries: `sub`, `aud`, `exp`, and
/// optionally `iat`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    sub: String,
    #[serde(deserialize_with = "string_or_seq_string")]
    aud: Vec<String>,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
}

impl Claims {
    /// The `sub` claim (the SPIFFE ID).
    pub fn sub(&self) -> &str {
        &self.sub
    }

    /// The `aud` claim.
    pub fn aud(&self) -> &[String] {
        &self.aud
    }

    /// The `exp` claim as a unix timestamp.
    pub const fn exp(&self) -> i64 {
        self.exp
    }

    /// The `iat` claim as a unix timestamp, when the token carries one.
    pub const fn iat(&self) -> Option<i64> {
        self.iat
    }
}

impl JwtSvid {
    /// Parses a token obtained from the SPIFFE Workload API.
    ///
    /// Performs no signature verification; the agent already validated the
    /// token. For tokens from any other origin use
    /// [`JwtSvid::parse_and_validate`].
    ///
    /// # Errors
    ///
    /// See [`JwtSvid::parse_insecure`].
    pub fn from_workload_api_token(token: &str) -> Result<Self, JwtSvidError> {
        Self::parse_insecure(token)
    }

    /// Parses a token checking structure only: three base64url segments,
    /// required headers (`kid`, supported `alg`, optional well-formed
    /// `typ`), and required claims (`sub` as a SPIFFE ID, `aud`, `exp`).
    ///
    /// # Errors
    ///
    /// Returns a [`JwtSvidError`] describing the first malformed part.
    pub fn parse_insecure(token: &str) -> Result<Self, JwtSvidError> {
        Self::from_str(token)
    }

    /// Parses and validates a token from an untrusted source: verifies the
    /// signature against the authority the bundle source holds for the
    /// token's trust domain and `kid`, then checks expiry (no leeway) and
    /// that the `aud` claim matches one of `expected_audience`.
    ///
    /// The `iat`, `nbf`, and `iss` claims are not checked; trust flows from
    /// the `sub` claim's trust domain.
    ///
    /// # Errors
    ///
    /// Returns a [`JwtSvidError`] if the token is malformed, the bundle or
    /// authority cannot be found, the signature does not verify, the token
    /// is expired, or the audience does not match.
    pub fn parse_and_validate<B, T>(
        token: &str,
        bundle_source: &B,
        expected_audience: &[T],
    ) -> Result<Self, JwtSvidError>
    where
        B: BundleSource<Item = JwtBundle>,
        B::Error: std::error::Error + Send + Sync + 'static,
        T: AsRef<str>,
    {
        use jsonwebtoken::jwk::Jwk;

        // Structural parse first: cheap, and it bounds the audience list
        // before any signature work happens.
        let untrusted = Self::parse_insecure(token)?;

        let authority = authority_for(
            bundle_source,
            untrusted.spiffe_id.trust_domain(),
            &untrusted.kid,
        )?;

        let mut validation = Validation::new(untrusted.alg.to_jsonwebtoken());
        validation.validate_exp = true;
        validation.leeway = 0;

        let audience: Vec<&str> = expected_audience.iter().map(AsRef::as_ref).collect();
        validation.set_audience(&audience);

        let jwk: Jwk = serde_json::from_slice(authority.jwk_json())?;
        let decoding_key = DecodingKey::from_jwk(&jwk)?;
        jsonwebtoken::decode::<Claims>(token, &decoding_key, &validation)?;

        Ok(untrusted)
    }

    /// Returns this JWT-SVID with the given Workload API hint attached.
    ///
    /// The hint is response metadata, not part of the token.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<Arc<str>>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// The serialized token.
    pub fn token(&self) -> &str {
        self.token.as_ref()
    }

    /// The SPIFFE ID from the `sub` claim.
    pub const fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The audience from the `aud` claim.
    pub fn audience(&self) -> &[String] {
        &self.claims.aud
    }

    /// The expiry from the `exp` claim.
    pub const fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    /// The issue time from the `iat` claim, when the token carries one.
    pub const fn issued_at(&self) -> Option<OffsetDateTime> {
        self.issued_at
    }

    /// The `kid` header, naming the authority that signed the token.
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    /// The parsed claims. Trustworthy only after
    /// [`JwtSvid::parse_and_validate`], or when the token came from the
    /// Workload API.
    pub const fn claims(&self) -> &Claims {
        &self.claims
    }

    /// The Workload API hint, when the response carried one.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

impl FromStr for JwtSvid {
    type Err = JwtSvidError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(JwtSvidError::InvalidJwtFormat)?;
        let claims_b64 = parts.next().ok_or(JwtSvidError::InvalidJwtFormat)?;
        let _signature_b64 = parts.next().ok_or(JwtSvidError::InvalidJwtFormat)?;
        if parts.next().is_some() {
            return Err(JwtSvidError::InvalidJwtFormat);
        }

        let header: Header =
            serde_json::from_slice(&decode_segment(header_b64)?).map_err(JwtSvidError::InvalidJson)?;
        let claims: Claims =
            serde_json::from_slice(&decode_segment(claims_b64)?).map_err(JwtSvidError::InvalidJson)?;

        if let Some(typ) = header.typ.as_deref() {
            if typ != "JWT" && typ != "JOSE" {
                return Err(JwtSvidError::InvalidTyp);
            }
        }

        let alg = JwtAlg::parse(&header.alg).ok_or(JwtSvidError::UnsupportedAlgorithm)?;
        let kid = header.kid.ok_or(JwtSvidError::MissingKeyId)?;
        let spiffe_id = SpiffeId::from_str(&claims.sub)?;

        let expiry = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| JwtSvidError::InvalidExpiration)?;
        let issued_at = claims
            .iat
            .map(OffsetDateTime::from_unix_timestamp)
            .transpose()
            .map_err(|_| JwtSvidError::InvalidIssuedAt)?;

        Ok(Self {
            spiffe_id,
            hint: None,
            expiry,
            issued_at,
            claims,
            kid,
            token: Token::from(token),
            alg,
        })
    }
}

fn authority_for<B>(
    bundle_source: &B,
    trust_domain: &TrustDomain,
    key_id: &str,
) -> Result<Arc<JwtAuthority>, JwtSvidError>
where
    B: BundleSource<Item = JwtBundle>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let bundle = bundle_source
        .bundle_for_trust_domain(trust_domain)
        .map_err(|e| JwtSvidError::BundleSource(Box::new(e)))?
        .ok_or_else(|| JwtSvidError::BundleNotFound(trust_domain.clone()))?;

    bundle
        .find_authority(key_id)
        .cloned()
        .ok_or_else(|| JwtSvidError::AuthorityNotFound(key_id.to_owned()))
}

/// Cap on `aud` claim entries. A real JWT-SVID has one to three; the bound
/// keeps adversarial tokens from forcing large allocations.
const MAX_AUDIENCE_VALUES: usize = 32;

// Accepts the `aud` claim as either one string or an array of strings,
// bounded by MAX_AUDIENCE_VALUES.
fn string_or_seq_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec(PhantomData<Vec<String>>);

    impl<'de> de::Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("string or sequence of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_owned()])
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut values = Vec::new();
            while let Some(value) = seq.next_element::<String>()? {
                if values.len() >= MAX_AUDIENCE_VALUES {
                    return Err(de::Error::custom(format!(
                        "'aud' claim has too many entries (max {MAX_AUDIENCE_VALUES})"
                    )));
                }
                values.push(value);
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(StringOrVec(PhantomData))
}

/// Cap on a decoded header or claims segment. 64 KiB is far beyond any
/// legitimate JWT-SVID.
const MAX_SEGMENT_LEN: usize = 64 * 1024;

fn decode_segment(segment: &str) -> Result<Vec<u8>, JwtSvidError> {
    use base64ct::{Base64UrlUnpadded, Encoding as _};

    // The encoded form is ~4/3 of the decoded size, so this bounds the
    // decoded segment at MAX_SEGMENT_LEN.
    if segment.len() > MAX_SEGMENT_LEN * 4 / 3 {
        return Err(JwtSvidError::InvalidBase64);
    }

    let mut buf = vec![0u8; segment.len()];
    let decoded = Base64UrlUnpadded::decode(segment, &mut buf)
        .map_err(|_| JwtSvidError::InvalidBase64)?
        .len();
    buf.truncate(decoded);
    Ok(buf)
}
