use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use url::Url;
use crate::agent::{AgentError, DeliveryError};
use crate::delivery::{EncodedBatch, Transport};

/// Posts batches as JSON to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Result<Self, AgentError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AgentError::validation("endpoint", e.to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
        })
    }

    /// Uses a preconfigured client (proxies, TLS roots, default headers).
    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, batch: &EncodedBatch) -> Result<(), DeliveryError> {
        let res = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(batch.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Transient(e.to_string())
                }
            })?;

        classify_status(res.status())
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn send<'a>(&'a self, batch: &'a EncodedBatch) -> BoxFuture<'a, Result<(), DeliveryError>> {
        self.post(batch).boxed()
    }
}

/// Maps a collector response status to a delivery outcome. Timeouts, rate
/// limiting and server errors are worth retrying; any other non-success status
/// means the payload itself was refused.
pub fn classify_status(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }

    let reason = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Err(DeliveryError::Transient(reason)),
        s if s.is_server_error() => Err(DeliveryError::Transient(reason)),
        _ => Err(DeliveryError::Permanent(reason)),
    }
}
