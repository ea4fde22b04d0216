//! gRPC channel construction for Workload API addresses.

use std::net::IpAddr;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use thiserror::Error;
#[cfg(unix)]
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tower::service_fn;

use crate::address::Address;
use crate::prelude::*;

// tonic requires a URI even when a custom connector dials the socket.
const TONIC_DUMMY_URI: &str = "http://[::]:50051";

/// Errors building a channel to the Workload API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The address transport is unsupported on the current platform.
    #[error("unsupported endpoint transport: {scheme}")]
    UnsupportedTransport {
        /// The unsupported transport scheme.
        scheme: &'static str,
    },

    /// The underlying connection could not be established.
    #[error(transparent)]
    Connect(#[from] tonic::transport::Error),
}

/// Connects to a Workload API endpoint and returns a gRPC channel.
///
/// # Errors
///
/// Returns a [`TransportError`] if the transport is unsupported on this
/// platform or the connection fails.
pub async fn connect(address: &Address) -> Result<Channel, TransportError> {
    debug!("connecting to workload api endpoint {address}");

    match address {
        Address::Unix(path) => connect_unix(path).await,
        Address::Tcp { host, port } => {
            let uri = match host {
                IpAddr::V6(ip) => format!("http://[{ip}]:{port}"),
                IpAddr::V4(ip) => format!("http://{ip}:{port}"),
            };
            Ok(TonicEndpoint::try_from(uri)?.connect().await?)
        }
    }
}

async fn connect_unix(path: &std::path::Path) -> Result<Channel, TransportError> {
    #[cfg(not(unix))]
    {
        let _ = path;
        Err(TransportError::UnsupportedTransport { scheme: "unix" })
    }

    #[cfg(unix)]
    {
        let path: Arc<std::path::PathBuf> = Arc::new(path.to_path_buf());

        let channel = TonicEndpoint::try_from(TONIC_DUMMY_URI)?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = Arc::clone(&path);
                async move {
                    let stream = UnixStream::connect(path.as_path()).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await?;

        Ok(channel)
    }
}
