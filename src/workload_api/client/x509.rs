//! X.509 fetch and stream calls, plus the response conversions they share.

use std::str::FromStr as _;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt as _};

use crate::bundle::x509::{X509Bundle, X509BundleSet};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::x509::X509Svid;
use crate::workload_api::client::{dedup_by_hint, WorkloadApiClient};
use crate::workload_api::error::{ResourceKind, WorkloadApiError};
use crate::workload_api::pb::workload::{
    X509BundlesRequest, X509BundlesResponse, X509svid, X509svidRequest, X509svidResponse,
};
use crate::workload_api::x509_context::X509Context;

impl WorkloadApiClient {
    /// Fetches the default X.509 SVID for the calling workload: the first
    /// one the Workload API returns.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the gRPC request fails, the
    /// response carries no SVIDs, or the received material is invalid.
    pub async fn fetch_x509_svid(&self) -> Result<X509Svid, WorkloadApiError> {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;

        let response =
            Self::first_message(response.into_inner(), ResourceKind::X509Context).await?;
        Self::parse_default_x509_svid(&response)
    }

    /// Fetches all X.509 SVIDs available to the calling workload,
    /// deduplicated by hint.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the gRPC request fails, the
    /// response carries no SVIDs, or any SVID fails to parse.
    pub async fn fetch_all_x509_svids(&self) -> Result<Vec<X509Svid>, WorkloadApiError> {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;

        let response =
            Self::first_message(response.into_inner(), ResourceKind::X509Context).await?;
        Self::parse_x509_svid_list(response)
    }

    /// Fetches the current X.509 context: all SVIDs (deduplicated by hint)
    /// together with the trust bundles of their own and any federated trust
    /// domains.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the gRPC request fails, the
    /// response carries no SVIDs, or any part of it fails to parse.
    pub async fn fetch_x509_context(&self) -> Result<X509Context, WorkloadApiError> {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;

        let response =
            Self::first_message(response.into_inner(), ResourceKind::X509Context).await?;
        Self::parse_x509_context(response)
    }

    /// Fetches the current X.509 bundle set, for workloads that only
    /// validate peers and need no SVID of their own.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the gRPC request fails, the stream
    /// ends before the first message, or a bundle fails to parse.
    pub async fn fetch_x509_bundles(&self) -> Result<X509BundleSet, WorkloadApiError> {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_x509_bundles(X509BundlesRequest::default()).await?;

        let response =
            Self::first_message(response.into_inner(), ResourceKind::X509Bundles).await?;
        Self::parse_x509_bundle_set(response)
    }

    /// Streams X.509 context updates from the Workload API.
    ///
    /// The stream ends when the server closes the connection and does not
    /// reconnect on its own; for resilience use
    /// [`WorkloadApiClient::watch_x509_contexts`] or [`crate::X509Source`].
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the stream cannot be established.
    pub async fn stream_x509_contexts(
        &self,
    ) -> Result<
        impl Stream<Item = Result<X509Context, WorkloadApiError>> + Send + 'static + use<>,
        WorkloadApiError,
    > {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;

        let stream = response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(Self::parse_x509_context)
        });
        Ok(Box::pin(stream))
    }

    /// Streams default X.509 SVID updates from the Workload API.
    ///
    /// The stream ends when the server closes the connection and does not
    /// reconnect on its own.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the stream cannot be established.
    pub async fn stream_x509_svids(
        &self,
    ) -> Result<
        impl Stream<Item = Result<X509Svid, WorkloadApiError>> + Send + 'static + use<>,
        WorkloadApiError,
    > {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;

        let stream = response.into_inner().map(|message| {
            let response = message.map_err(WorkloadApiError::from)?;
            Self::parse_default_x509_svid(&response)
        });
        Ok(Box::pin(stream))
    }

    /// Streams X.509 bundle set updates from the Workload API.
    ///
    /// The stream ends when the server closes the connection and does not
    /// reconnect on its own; for resilience use
    /// [`WorkloadApiClient::watch_x509_bundles`].
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the stream cannot be established.
    pub async fn stream_x509_bundles(
        &self,
    ) -> Result<
        impl Stream<Item = Result<X509BundleSet, WorkloadApiError>> + Send + 'static + use<>,
        WorkloadApiError,
    > {
        self.assert_open()?;

        let mut client = self.stub();
        let response = client.fetch_x509_bundles(X509BundlesRequest::default()).await?;

        let stream = response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(Self::parse_x509_bundle_set)
        });
        Ok(Box::pin(stream))
    }
}

impl WorkloadApiClient {
    fn parse_default_x509_svid(response: &X509svidResponse) -> Result<X509Svid, WorkloadApiError> {
        let entry = response
            .svids
            .first()
            .ok_or(WorkloadApiError::EmptyResponse(ResourceKind::X509Context))?;
        Self::parse_x509_svid(entry)
    }

    /// Parses one response entry, enforcing that the SPIFFE ID the server
    /// asserted matches the one inside the leaf certificate.
    fn parse_x509_svid(entry: &X509svid) -> Result<X509Svid, WorkloadApiError> {
        let hint = (!entry.hint.is_empty()).then(|| Arc::<str>::from(entry.hint.as_str()));

        let svid = X509Svid::parse_from_der_with_hint(
            entry.x509_svid.as_ref(),
            entry.x509_svid_key.as_ref(),
            hint,
        )?;

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

    fn parse_x509_svid_list(
        response: X509svidResponse,
    ) -> Result<Vec<X509Svid>, WorkloadApiError> {
        let mut entries = response.svids;
        if entries.is_empty() {
            return Err(WorkloadApiError::EmptyResponse(ResourceKind::X509Context));
        }
        dedup_by_hint(&mut entries, |entry| entry.hint.as_str());

        entries.iter().map(Self::parse_x509_svid).collect()
    }

    fn parse_x509_context(response: X509svidResponse) -> Result<X509Context, WorkloadApiError> {
        let mut entries = response.svids;
        if entries.is_empty() {
            return Err(WorkloadApiError::EmptyResponse(ResourceKind::X509Context));
        }
        dedup_by_hint(&mut entries, |entry| entry.hint.as_str());

        let mut svids: Vec<Arc<X509Svid>> = Vec::with_capacity(entries.len());
        let mut bundle_set = X509BundleSet::new();

        for entry in &entries {
            let svid = Self::parse_x509_svid(entry)?;
            let trust_domain = svid.spiffe_id().trust_domain().clone();
            svids.push(Arc::new(svid));

            let bundle = X509Bundle::parse_from_der(trust_domain, entry.bundle.as_ref())?;
            bundle_set.add_bundle(bundle);
        }

        for (name, bundle_der) in response.federated_bundles {
            let trust_domain = TrustDomain::new(&name)?;
            let bundle = X509Bundle::parse_from_der(trust_domain, bundle_der.as_ref())?;
            bundle_set.add_bundle(bundle);
        }

        Ok(X509Context::new(svids, bundle_set))
    }

    fn parse_x509_bundle_set(
        response: X509BundlesResponse,
    ) -> Result<X509BundleSet, WorkloadApiError> {
        let mut bundle_set = X509BundleSet::new();
        for (name, bundle_der) in response.bundles {
            let trust_domain = TrustDomain::new(&name)?;
            let bundle = X509Bundle::parse_from_der(trust_domain, bundle_der.as_ref())?;
            bundle_set.add_bundle(bundle);
        }
        Ok(bundle_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_certs::{ca_der, CertChain};
    use std::collections::HashMap;

    fn pb_svid(spiffe_id: &str, asserted: &str, hint: &str) -> X509svid {
        let chain = CertChain::single(spiffe_id);
        X509svid {
            spiffe_id: asserted.to_owned(),
            x509_svid: chain.chain_der().into(),
            x509_svid_key: chain.key_der().into(),
            bundle: ca_der().into(),
            hint: hint.to_owned(),
        }
    }

    #[test]
    fn context_dedups_svids_by_hint() {
        let id = "spiffe://example.org/workload";
        let response = X509svidResponse {
            svids: vec![
                pb_svid(id, "", ""),
                pb_svid(id, "", ""),
                pb_svid(id, "", "hintX"),
                pb_svid(id, "", "hintX"),
                pb_svid(id, "", "hintY"),
            ],
            crl: Vec::new(),
            federated_bundles: HashMap::new(),
        };

        let context = WorkloadApiClient::parse_x509_context(response).unwrap();
        assert_eq!(context.svids().len(), 4);

        let hints: Vec<Option<&str>> = context.svids().iter().map(|svid| svid.hint()).collect();
        assert_eq!(hints, [None, None, Some("hintX"), Some("hintY")]);
    }

    #[test]
    fn svid_list_dedups_by_hint() {
        let id = "spiffe://example.org/workload";
        let response = X509svidResponse {
            svids: vec![
                pb_svid(id, "", "shared"),
                pb_svid(id, "", "shared"),
                pb_svid(id, "", ""),
            ],
            crl: Vec::new(),
            federated_bundles: HashMap::new(),
        };

        let svids = WorkloadApiClient::parse_x509_svid_list(response).unwrap();
        assert_eq!(svids.len(), 2);
    }

    #[test]
    fn empty_svid_list_is_an_error() {
        let response = X509svidResponse {
            svids: Vec::new(),
            crl: Vec::new(),
            federated_bundles: HashMap::new(),
        };

        let err = WorkloadApiClient::parse_x509_context(response).unwrap_err();
        assert!(matches!(
            err,
            WorkloadApiError::EmptyResponse(ResourceKind::X509Context)
        ));
    }

    #[test]
    fn rejects_asserted_identity_that_does_not_match_the_leaf() {
        let entry = pb_svid(
            "spiffe://example.org/workload",
            "spiffe://example.org/other",
            "",
        );

        let err = WorkloadApiClient::parse_x509_svid(&entry).unwrap_err();
        match err {
            WorkloadApiError::IdentityMismatch { asserted, found } => {
                assert_eq!(asserted.to_string(), "spiffe://example.org/other");
                assert_eq!(found.to_string(), "spiffe://example.org/workload");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_matching_or_absent_asserted_identity() {
        let id = "spiffe://example.org/workload";

        let matching = pb_svid(id, id, "");
        assert_eq!(
            WorkloadApiClient::parse_x509_svid(&matching)
                .unwrap()
                .spiffe_id()
                .to_string(),
            id
        );

        let absent = pb_svid(id, "", "");
        assert!(WorkloadApiClient::parse_x509_svid(&absent).is_ok());
    }

    #[test]
    fn context_collects_own_and_federated_bundles() {
        let response = X509svidResponse {
            svids: vec![pb_svid("spiffe://example.org/workload", "", "")],
            crl: Vec::new(),
            federated_bundles: HashMap::from([(
                "spiffe://other.org".to_owned(),
                ca_der().into(),
            )]),
        };

        let context = WorkloadApiClient::parse_x509_context(response).unwrap();
        let bundles = context.bundle_set();

        let own = TrustDomain::new("example.org").unwrap();
        let federated = TrustDomain::new("other.org").unwrap();
        assert!(bundles.get(&own).is_some());
        assert!(bundles.get(&federated).is_some());
    }

    #[test]
    fn bundle_map_keys_may_be_spiffe_ids_or_bare_names() {
        let response = X509BundlesResponse {
            crl: Vec::new(),
            bundles: HashMap::from([
                ("spiffe://example.org".to_owned(), ca_der().into()),
                ("other.org".to_owned(), ca_der().into()),
            ]),
        };

        let set = WorkloadApiClient::parse_x509_bundle_set(response).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get(&TrustDomain::new("example.org").unwrap()).is_some());
        assert!(set.get(&TrustDomain::new("other.org").unwrap()).is_some());
    }
}
