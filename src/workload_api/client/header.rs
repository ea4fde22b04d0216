//! The `workload.spiffe.io` metadata header every Workload API call carries.

use std::sync::LazyLock;

use tonic::metadata::{Ascii, MetadataKey, MetadataValue};

const SPIFFE_HEADER_KEY: &str = "workload.spiffe.io";
const SPIFFE_HEADER_VALUE: &str = "true";

// Both constants are fixed lowercase ASCII; `from_static` panics at first
// use if either is ever changed to something invalid.
static HEADER_KEY: LazyLock<MetadataKey<Ascii>> =
    LazyLock::new(|| MetadataKey::from_static(SPIFFE_HEADER_KEY));

static HEADER_VALUE: LazyLock<MetadataValue<Ascii>> =
    LazyLock::new(|| MetadataValue::from_static(SPIFFE_HEADER_VALUE));

/// Tonic interceptor that adds the metadata header the Workload API requires
/// on every request.
#[derive(Clone)]
pub(super) struct MetadataAdder;

impl tonic::service::Interceptor for MetadataAdder {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> Result<tonic::Request<()>, tonic::Status> {
        // insert() takes owned values; the LazyLock parses them only once.
        request
            .metadata_mut()
            .insert(HEADER_KEY.clone(), HEADER_VALUE.clone());
        Ok(request)
    }
}
