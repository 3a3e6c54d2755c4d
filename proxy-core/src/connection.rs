use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::error::{ProxyError, Result};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Dial the backend over plaintext HTTP/2. TLS to the backend is an explicit
/// non-goal; the proxy terminates whatever security the frontend route needs
/// at the message layer instead (see `crypto`/`envelope`).
pub async fn dial_backend(address: &str) -> Result<Channel> {
    let uri = format!("http://{address}");
    let endpoint: Endpoint = Channel::from_shared(uri)
        .map_err(|e| ProxyError::Config(format!("invalid backend address '{address}': {e}")))?
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS));

    endpoint
        .connect()
        .await
        .map_err(|e| ProxyError::Other(format!("failed to connect to backend {address}: {e}").into()))
}
