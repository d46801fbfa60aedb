//! Transport trait for abstracting what actually sends a request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Request, Response};

use crate::config::TransportConfig;
use crate::error::Result;

/// Something that sends an admitted request and returns its response.
///
/// Retries, if any, are the transport's business; the dispatcher forwards
/// each request exactly once and returns whatever comes back.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request.
    async fn send(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl Transport for Client {
    async fn send(&self, request: Request) -> Result<Response> {
        Ok(self.execute(request).await?)
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: Request) -> Result<Response> {
        (**self).send(request).await
    }
}

/// Build the default HTTP client.
///
/// Proxies are taken from the environment. HTTP/2 is used when the server
/// negotiates it.
pub fn build_client(config: &TransportConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .tcp_keepalive(Duration::from_secs(config.tcp_keepalive_secs))
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host);

    if let Some(secs) = config.request_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    Ok(builder.build()?)
}
