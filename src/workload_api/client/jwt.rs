//! JWT fetch, validate, and stream calls, plus their response conversions.

use std::str::FromStr as _;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt as _};

use crate::bundle::jwt::{JwtBundle, JwtBundleSet};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::jwt::JwtSvid;
use crate::workload_api::client::{dedup_by_hint, WorkloadApiClient};
use crate::workload_api::error::{ResourceKind, WorkloadApiError};
use crate::workload_api::pb::workload::{
    JwtBundlesRequest, JwtBundlesResponse, Jwtsvid, JwtsvidRequest, JwtsvidResponse,
    ValidateJwtsvidRequest,
};

impl WorkloadApiClient {
    /// Fetches a JWT-SVID for the given audience, targeting `spiffe_id` or,
    /// when `None`, the default identity.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the request fails, the response
    /// carries no SVIDs, or the returned token cannot be parsed.
    pub async fn fetch_jwt_svid<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<JwtSvid, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let response = self.fetch_jwt(audience, spiffe_id).await?;
        let entry = response
            .svids
            .first()
            .ok_or(WorkloadApiError::EmptyResponse(ResourceKind::JwtSvid))?;
        Self::parse_jwt_svid(entry)
    }

    /// Fetches all JWT-SVIDs for the given audience, deduplicated by hint.
    ///
    /// The Workload API can return more than one JWT-SVID; each may carry a
    /// hint (see [`JwtSvid::hint`]) that distinguishes the identities.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the request fails, the response
    /// carries no SVIDs, or any returned token cannot be parsed.
    pub async fn fetch_all_jwt_svids<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<Vec<JwtSvid>, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let response = self.fetch_jwt(audience, spiffe_id).await?;
        Self::parse_jwt_svid_list(response)
    }

    /// Fetches the JWT-SVID whose Workload API hint matches `hint`.
    ///
    /// The hint is not part of the token; it is transport metadata the agent
    /// attaches so workloads can pick one identity out of several.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::HintNotFound`] if no returned SVID
    /// carries the hint, and any [`WorkloadApiClient::fetch_all_jwt_svids`]
    /// error otherwise.
    pub async fn fetch_jwt_svid_by_hint<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
        hint: impl AsRef<str>,
    ) -> Result<JwtSvid, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let hint = hint.as_ref();
        let all = self.fetch_all_jwt_svids(audience, spiffe_id).await?;
        all.into_iter()
            .find(|svid| svid.hint() == Some(hint))
            .ok_or_else(|| WorkloadApiError::HintNotFound(hint.to_owned()))
    }

    /// Fetches a JWT-SVID token string for the given audience, without
    /// parsing it.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the request fails or the response
    /// carries no SVIDs.
    pub async fn fetch_jwt_token<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<String, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let response = self.fetch_jwt(audience, spiffe_id).await?;
        response
            .svids
            .first()
            .map(|entry| entry.svid.clone())
            .ok_or(WorkloadApiError::EmptyResponse(ResourceKind::JwtSvid))
    }

    /// Validates a JWT-SVID for the given audience and returns the parsed
    /// [`JwtSvid`].
    ///
    /// Validation is performed by the agent via the Workload API; the local
    /// parse afterwards is structural only and exists to give callers typed
    /// access to the claims.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the agent rejects the token or the
    /// token cannot be parsed.
    pub async fn validate_jwt_svid(
        &self,
        audience: &str,
        token: &str,
    ) -> Result<JwtSvid, WorkloadApiError> {
        self.assert_open()?;

        let request = ValidateJwtsvidRequest {
            audience: audience.to_owned(),
            svid: token.to_owned(),
        };

        let mut client = self.stub();
        let _response = client.validate_jwtsvid(request).await?.into_inner();

        Ok(JwtSvid::parse_insecure(token)?)
    }

    /// Fetches the current set of JWT bundles.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the request fails, the stream ends
    /// before the first message, or a bundle fails to parse.
    pub async fn fetch_jwt_bundles(&self) -> Result<JwtBundleSet, WorkloadApiError> {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_jwt_bundles(JwtBundlesRequest::default()).await?;

        let response =
            Self::first_message(response.into_inner(), ResourceKind::JwtBundles).await?;
        Self::parse_jwt_bundle_set(response)
    }

    /// Streams JWT bundle set updates from the Workload API.
    ///
    /// The stream ends when the server closes the connection and does not
    /// reconnect on its own; for resilience use
    /// [`WorkloadApiClient::watch_jwt_bundles`] or [`crate::JwtSource`].
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the stream cannot be established.
    pub async fn stream_jwt_bundles(
        &self,
    ) -> Result<
        impl Stream<Item = Result<JwtBundleSet, WorkloadApiError>> + Send + 'static + use<>,
        WorkloadApiError,
    > {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_jwt_bundles(JwtBundlesRequest::default()).await?;

        let stream = response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(Self::parse_jwt_bundle_set)
        });
        Ok(Box::pin(stream))
    }
}

impl WorkloadApiClient {
    async fn fetch_jwt<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<JwtsvidResponse, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.assert_open()?;

        let request = JwtsvidRequest {
            spiffe_id: spiffe_id.map(ToString::to_string).unwrap_or_default(),
            audience: audience
                .into_iter()
                .map(|audience| audience.as_ref().to_owned())
                .collect(),
        };

        let mut client = self.stub();
        Ok(client.fetch_jwtsvid(request).await?.into_inner())
    }

    /// Parses one response entry, enforcing that the SPIFFE ID the server
    /// asserted matches the token's `sub` claim.
    fn parse_jwt_svid(entry: &Jwtsvid) -> Result<JwtSvid, WorkloadApiError> {
        let mut svid = JwtSvid::from_workload_api_token(&entry.svid)?;
        if !entry.hint.is_empty() {
            svid = svid.with_hint(Arc::<str>::from(entry.hint.as_str()));
        }

        if !entry.spiffe_id.is_empty() {
            let asserted = SpiffeId::from_str(&entry.spiffe_id)?;
            if asserted != *svid.spiffe_id() {
                return Err(WorkloadApiError::IdentityMismatch {
                    asserted,
                    found: svid.spiffe_id().clone(),
                });
            }
        }

        Ok(svid)
    }

    fn parse_jwt_svid_list(response: JwtsvidResponse) -> Result<Vec<JwtSvid>, WorkloadApiError> {
        let mut entries = response.svids;
        if entries.is_empty() {
            return Err(WorkloadApiError::EmptyResponse(ResourceKind::JwtSvid));
        }
        dedup_by_hint(&mut entries, |entry| entry.hint.as_str());

        entries.iter().map(Self::parse_jwt_svid).collect()
    }

    fn parse_jwt_bundle_set(
        response: JwtBundlesResponse,
    ) -> Result<JwtBundleSet, WorkloadApiError> {
        let mut bundle_set = JwtBundleSet::new();
        for (name, jwks) in response.bundles {
            let trust_domain = TrustDomain::new(&name)?;
            let bundle = JwtBundle::from_jwks(trust_domain, jwks.as_ref())?;
            bundle_set.add_bundle(bundle);
        }
        Ok(bundle_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64ct::{Base64UrlUnpadded, Encoding as _};
    use std::collections::HashMap;

    fn token_for(sub: &str) -> String {
        let header = Base64UrlUnpadded::encode_string(br#"{"alg":"ES256","kid":"k1"}"#);
        let claims = Base64UrlUnpadded::encode_string(
            format!(r#"{{"sub":"{sub}","aud":"aud1","exp":4294967295}}"#).as_bytes(),
        );
        format!("{header}.{claims}.sig")
    }

    fn pb_svid(sub: &str, asserted: &str, hint: &str) -> Jwtsvid {
        Jwtsvid {
            spiffe_id: asserted.to_owned(),
            svid: token_for(sub),
            hint: hint.to_owned(),
        }
    }

    const JWKS: &[u8] = br#"{
        "keys": [
            {
                "kty": "EC",
                "kid": "C6vs25welZOx6WksNYfbMfiw9l96pMnD",
                "crv": "P-256",
                "x": "ngLYQnlfF6GsojUwqtcEE3WgTNG2RUlsGhK73RNEl5k",
                "y": "tKbiDSUSsQ3F1P7wteeHNXIcU-cx6CgSbroeQrQHTLM"
            }
        ]
    }"#;

    #[test]
    fn svid_list_dedups_by_hint() {
        let id = "spiffe://example.org/service";
        let response = JwtsvidResponse {
            svids: vec![
                pb_svid(id, "", ""),
                pb_svid(id, "", ""),
                pb_svid(id, "", "hintX"),
                pb_svid(id, "", "hintX"),
                pb_svid(id, "", "hintY"),
            ],
        };

        let svids = WorkloadApiClient::parse_jwt_svid_list(response).unwrap();
        assert_eq!(svids.len(), 4);

        let hints: Vec<Option<&str>> = svids.iter().map(|svid| svid.hint()).collect();
        assert_eq!(hints, [None, None, Some("hintX"), Some("hintY")]);
    }

    #[test]
    fn empty_svid_list_is_an_error() {
        let response = JwtsvidResponse { svids: Vec::new() };

        let err = WorkloadApiClient::parse_jwt_svid_list(response).unwrap_err();
        assert!(matches!(
            err,
            WorkloadApiError::EmptyResponse(ResourceKind::JwtSvid)
        ));
    }

    #[test]
    fn rejects_asserted_identity_that_does_not_match_the_token() {
        let entry = pb_svid(
            "spiffe://example.org/service",
            "spiffe://example.org/other",
            "",
        );

        let err = WorkloadApiClient::parse_jwt_svid(&entry).unwrap_err();
        match err {
            WorkloadApiError::IdentityMismatch { asserted, found } => {
                assert_eq!(asserted.to_string(), "spiffe://example.org/other");
                assert_eq!(found.to_string(), "spiffe://example.org/service");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_matching_or_absent_asserted_identity() {
        let id = "spiffe://example.org/service";

        let matching = pb_svid(id, id, "token-a");
        let svid = WorkloadApiClient::parse_jwt_svid(&matching).unwrap();
        assert_eq!(svid.spiffe_id().to_string(), id);
        assert_eq!(svid.hint(), Some("token-a"));

        let absent = pb_svid(id, "", "");
        assert!(WorkloadApiClient::parse_jwt_svid(&absent).is_ok());
    }

    #[test]
    fn bundle_map_keys_may_be_spiffe_ids_or_bare_names() {
        let response = JwtBundlesResponse {
            bundles: HashMap::from([
                ("spiffe://example.org".to_owned(), JWKS.to_vec().into()),
                ("other.org".to_owned(), JWKS.to_vec().into()),
            ]),
        };

        let set = WorkloadApiClient::parse_jwt_bundle_set(response).unwrap();
        assert_eq!(set.len(), 2);

        let bundle = set.get(&TrustDomain::new("example.org").unwrap()).unwrap();
        assert!(bundle
            .find_authority("C6vs25welZOx6WksNYfbMfiw9l96pMnD")
            .is_some());
    }

    #[test]
    fn malformed_jwks_is_a_bundle_error() {
        let response = JwtBundlesResponse {
            bundles: HashMap::from([("example.org".to_owned(), b"not json".to_vec().into())]),
        };

        let err = WorkloadApiClient::parse_jwt_bundle_set(response).unwrap_err();
        assert!(matches!(err, WorkloadApiError::JwtBundle(_)));
    }
}
