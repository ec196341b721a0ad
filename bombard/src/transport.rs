use std::time::Duration;

use async_trait::async_trait;

use crate::template::Request;

/// Status reported when the request never produced an HTTP response
/// (connection refused, timeout, invalid URL...).
pub const TRANSPORT_FAILURE: u16 = 0;

/// Result of one round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub status: u16,
    /// Response body, or the error text when `status` is [`TRANSPORT_FAILURE`].
    pub body: String,
}

impl Exchange {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::new(TRANSPORT_FAILURE, reason)
    }

    pub fn is_failure(&self) -> bool {
        self.status == TRANSPORT_FAILURE
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Sends requests over the network.
///
/// Implementations report every failure in-band through
/// [`Exchange::failure`]; the engine never sees a second error channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(&self, request: &Request, timeout: Duration) -> Exchange;
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use reqwest::{Client, Method};

    /// [`Transport`] backed by a shared `reqwest` client.
    #[derive(Debug, Clone, Default)]
    pub struct HttpTransport {
        client: Client,
    }

    impl HttpTransport {
        pub fn new(client: Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn dispatch(&self, request: &Request, timeout: Duration) -> Exchange {
            let method = match Method::from_bytes(request.method.to_uppercase().as_bytes()) {
                Ok(m) => m,
                Err(e) => return Exchange::failure(format!("bad method {}: {e}", request.method)),
            };

            let mut builder = self
                .client
                .request(method, &request.url)
                .timeout(timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body_text() {
                builder = builder.body(body);
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => return Exchange::failure(e.to_string()),
            };
            let status = response.status().as_u16();
            match response.text().await {
                Ok(body) => Exchange::new(status, body),
                Err(e) => Exchange::failure(e.to_string()),
            }
        }
    }
}
