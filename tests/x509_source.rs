//! Integration tests for `X509Source`.
//!
//! These tests require a running SPIRE server and agent with two workload
//! entries registered for this process (see `tests/workload_api_client.rs`
//! for the expected registrations).

#[cfg(feature = "integration-tests")]
mod integration_x509_source {
    use std::sync::Arc;
    use std::sync::LazyLock;
    use std::time::Duration;

    use workload_identity::{
        BundleSource as _, ClientFactory, SpiffeId, SvidPicker, TrustDomain, WorkloadApiClient,
        WorkloadApiError, X509Source, X509Svid,
    };

    static SPIFFE_ID_1: LazyLock<SpiffeId> =
        LazyLock::new(|| SpiffeId::new("spiffe://example.org/myservice").unwrap());

    static SPIFFE_ID_2: LazyLock<SpiffeId> =
        LazyLock::new(|| SpiffeId::new("spiffe://example.org/myservice2").unwrap());

    static TRUST_DOMAIN: LazyLock<TrustDomain> =
        LazyLock::new(|| TrustDomain::new("example.org").unwrap());

    #[derive(Debug)]
    struct SecondSvidPicker;

    impl SvidPicker for SecondSvidPicker {
        fn pick_svid(&self, svids: &[Arc<X509Svid>]) -> Option<usize> {
            (svids.len() > 1).then_some(1)
        }
    }

    async fn get_source() -> X509Source {
        X509Source::new()
            .await
            .expect("Failed to create X509Source")
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn the_source_serves_an_svid() {
        let source = get_source().await;
        let svid = source.svid().expect("Failed to get SVID");

        assert!(
            [&*SPIFFE_ID_1, &*SPIFFE_ID_2].contains(&svid.spiffe_id()),
            "Unexpected SPIFFE ID: {:?}",
            svid.spiffe_id()
        );
        assert!(!svid.cert_chain().is_empty());
        source.close().await;
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn bundles_are_served_per_trust_domain() {
        let source = get_source().await;

        let bundle = source
            .bundle_for_trust_domain(&TRUST_DOMAIN)
            .expect("Failed to query bundle")
            .expect("No bundle for the trust domain");
        assert_eq!(bundle.trust_domain(), &*TRUST_DOMAIN);
        assert!(!bundle.authorities().is_empty());

        let context = source.x509_context().expect("Failed to get context");
        assert!(!context.svids().is_empty());
        source.close().await;
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn a_custom_picker_and_client_factory_are_honored() {
        let factory: ClientFactory =
            Arc::new(|| Box::pin(async { WorkloadApiClient::connect_env().await }));

        let source = X509Source::builder()
            .client_factory(factory)
            .picker(SecondSvidPicker)
            .build()
            .await
            .expect("Failed to build source");

        let svid = source.svid().expect("Failed to get SVID");
        assert!(
            [&*SPIFFE_ID_1, &*SPIFFE_ID_2].contains(&svid.spiffe_id()),
            "Picker should select one of the registered SVIDs"
        );
        source.close().await;
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn rotation_wakes_update_subscribers() {
        let source = get_source().await;
        let mut updates = source.updates();

        let seen = updates.last();
        assert!(seen >= 1, "Building the source stores a first update");

        // SPIRE rotates test SVIDs frequently; the next rotation must wake
        // the subscription.
        let next = tokio::time::timeout(Duration::from_secs(60), updates.changed())
            .await
            .expect("No rotation within 60s")
            .expect("Update channel closed");
        assert!(next > seen, "Sequence numbers are monotonic");
        source.close().await;
    }

    #[tokio::test]
    #[ignore = "requires running SPIFFE Workload API"]
    async fn close_is_idempotent_and_fails_reads() {
        let source = get_source().await;

        source.close().await;
        source.close().await;
        assert!(source.is_closed());

        assert!(matches!(source.svid(), Err(WorkloadApiError::Closed)));
        assert!(matches!(
            source.x509_context(),
            Err(WorkloadApiError::Closed)
        ));
    }
}
