//! Integration tests for `WorkloadApiClient`.
//!
//! These tests require a running SPIRE server and agent with two workload
//! entries registered for this process: `spiffe://example.org/myservice` and
//! `spiffe://example.org/myservice2`, with hints `myservice` and
//! `myservice2`.

#[cfg(feature = "integration-tests")]
mod integration_workload_api_client {
    use std::sync::LazyLock;
    use std::time::Duration;

    use tokio_stream::StreamExt as _;
    use workload_identity::{SpiffeId, TrustDomain, WorkloadApiClient, WorkloadApiError};

    static SPIFFE_ID_1: LazyLock<SpiffeId> =
        LazyLock::new(|| SpiffeId::new("spiffe://example.org/myservice").unwrap());

    static SPIFFE_ID_2: LazyLock<SpiffeId> =
        LazyLock::new(|| SpiffeId::new("spiffe://example.org/myservice2").unwrap());

    static TRUST_DOMAIN: LazyLock<TrustDomain> =
        LazyLock::new(|| TrustDomain::new("example.org").unwrap());

    async fn get_client() -> WorkloadApiClient {
        WorkloadApiClient::connect_env()
            .await
            .expect("Failed to create client")
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn fetch_x509_svid() {
        let client = get_client().await;
        let svid = client
            .fetch_x509_svid()
            .await
            .expect("Failed to fetch X.509 SVID");

        let expected_ids = [&*SPIFFE_ID_1, &*SPIFFE_ID_2];
        assert!(
            expected_ids.contains(&svid.spiffe_id()),
            "Unexpected SPIFFE ID: {:?}",
            svid.spiffe_id()
        );
        assert!(!svid.cert_chain().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn fetch_all_x509_svids_includes_hints() {
        let client = get_client().await;
        let svids = client
            .fetch_all_x509_svids()
            .await
            .expect("Failed to fetch X.509 SVIDs");

        assert!(svids.len() >= 2, "Expected at least two X509-SVIDs");

        let hints: Vec<_> = svids.iter().filter_map(|svid| svid.hint()).collect();
        assert!(hints.contains(&"myservice"));
        assert!(hints.contains(&"myservice2"));
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn fetch_x509_context() {
        let client = get_client().await;
        let context = client
            .fetch_x509_context()
            .await
            .expect("Failed to fetch X.509 context");

        let svid = context.default_svid().expect("Context carries no SVID");
        assert!(
            [&*SPIFFE_ID_1, &*SPIFFE_ID_2].contains(&svid.spiffe_id()),
            "Unexpected SPIFFE ID"
        );

        let bundle = context
            .bundle_set()
            .get(&TRUST_DOMAIN)
            .expect("No bundle for the trust domain");
        assert_eq!(bundle.trust_domain(), &*TRUST_DOMAIN);
        assert!(!bundle.authorities().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn fetch_x509_bundles() {
        let client = get_client().await;
        let bundles = client
            .fetch_x509_bundles()
            .await
            .expect("Failed to fetch X.509 bundles");

        let bundle = bundles
            .get(&TRUST_DOMAIN)
            .expect("No bundle for the trust domain");
        assert!(!bundle.authorities().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn fetch_jwt_svid() {
        let client = get_client().await;
        let svid = client
            .fetch_jwt_svid(["my_audience"], None)
            .await
            .expect("Failed to fetch JWT SVID");
        assert_eq!(svid.audience(), &["my_audience"]);
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn fetch_and_validate_jwt_token() {
        let client = get_client().await;

        let token = client
            .fetch_jwt_token(["my_audience"], Some(&*SPIFFE_ID_1))
            .await
            .expect("Failed to fetch JWT token");
        let svid = client
            .validate_jwt_svid("my_audience", &token)
            .await
            .expect("Agent rejected its own token");

        assert_eq!(svid.spiffe_id(), &*SPIFFE_ID_1);
        assert!(svid.audience().contains(&"my_audience".to_owned()));
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn validate_rejects_a_garbage_token() {
        let client = get_client().await;
        let result = client
            .validate_jwt_svid("my_audience", "not-a-jwt")
            .await;
        assert!(result.is_err(), "Garbage token should not validate");
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn fetch_jwt_svid_by_hint_selects_the_right_identity() {
        let client = get_client().await;
        let svid = client
            .fetch_jwt_svid_by_hint(["my_audience"], None, "myservice2")
            .await
            .expect("Failed to fetch JWT SVID by hint");

        assert_eq!(svid.hint(), Some("myservice2"));
        assert_eq!(svid.spiffe_id(), &*SPIFFE_ID_2);
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn fetch_jwt_bundles_cover_the_fetched_token() {
        let client = get_client().await;
        let bundles = client
            .fetch_jwt_bundles()
            .await
            .expect("Failed to fetch JWT bundles");

        let bundle = bundles
            .get(&TRUST_DOMAIN)
            .expect("No JWT bundle for the trust domain");

        let svid = client
            .fetch_jwt_svid(["my_audience"], None)
            .await
            .expect("Failed to fetch JWT SVID");
        assert!(
            bundle.find_authority(svid.key_id()).is_some(),
            "Bundle should hold the authority that signed the fetched token"
        );
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn stream_x509_contexts_delivers_updates() {
        let client = get_client().await;

        let result = tokio::time::timeout(Duration::from_secs(60), async {
            let mut stream = client
                .stream_x509_contexts()
                .await
                .expect("Failed to open stream");

            let mut updates = 0;
            while let Some(update) = stream.next().await {
                let context = update.expect("Stream yielded an error");
                assert!(context.default_svid().is_some());
                assert!(context.bundle_set().get(&TRUST_DOMAIN).is_some());

                updates += 1;
                if updates == 3 {
                    break;
                }
            }
            assert_eq!(updates, 3, "Expected 3 updates from the stream");
        })
        .await;

        assert!(result.is_ok(), "Stream did not deliver 3 updates in time");
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn stream_jwt_bundles_delivers_the_current_set() {
        let client = get_client().await;

        let result = tokio::time::timeout(Duration::from_secs(60), async {
            let mut stream = client
                .stream_jwt_bundles()
                .await
                .expect("Failed to open stream");

            let bundles = stream
                .next()
                .await
                .expect("Stream ended without an update")
                .expect("Stream yielded an error");
            assert!(bundles.get(&TRUST_DOMAIN).is_some());
        })
        .await;

        assert!(result.is_ok(), "Stream did not deliver a bundle set in time");
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn a_closed_client_fails_further_calls() {
        let client = get_client().await;
        client.close();

        let err = client
            .fetch_x509_svid()
            .await
            .expect_err("Calls after close should fail");
        assert!(matches!(err, WorkloadApiError::Closed));
    }
}
