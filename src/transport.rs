use async_trait::async_trait;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use std::{future::Future, sync::RwLock, time::Duration};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{GraphQLResponse, ServiceConfig, SubgraphRequest};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected HTTP status: {0}")]
    UnexpectedStatus(StatusCode),
    #[error("invalid response body: {0}")]
    InvalidBody(serde_json::Error),
    #[error("request cancelled")]
    Cancelled,
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("transport is closed")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    cancellation: CancellationToken,
    timeout: Option<Duration>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        RequestContext {
            cancellation: CancellationToken::new(),
            timeout: None,
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Drives `future` unless the request is cancelled or its deadline passes first.
    pub async fn guard<F, T>(&self, future: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let bounded = async {
            match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, future)
                    .await
                    .map_err(|_| TransportError::DeadlineExceeded(timeout))?,
                None => future.await,
            }
        };

        tokio::select! {
            _ = self.cancellation.cancelled() => Err(TransportError::Cancelled),
            result = bounded => result,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &SubgraphRequest,
        ctx: &RequestContext,
    ) -> Result<GraphQLResponse, TransportError>;

    /// Releases the connection pool. Later calls fail with [`TransportError::Closed`].
    fn close(&self);
}

pub struct HttpTransport {
    url: String,
    client: RwLock<Option<reqwest::Client>>,
    permits: Option<Semaphore>,
}

impl HttpTransport {
    pub fn new(config: &ServiceConfig) -> Result<Self, TransportError> {
        let keep_alive = Duration::from_millis(config.keep_alive_msecs);

        let client = reqwest::Client::builder()
            .tcp_keepalive(keep_alive)
            .pool_idle_timeout(keep_alive)
            .pool_max_idle_per_host(config.max_free_sockets)
            .danger_accept_invalid_certs(!config.reject_unauthorized)
            .build()
            .map_err(TransportError::Client)?;

        Ok(HttpTransport {
            url: config.url.clone(),
            client: RwLock::new(Some(client)),
            permits: config
                .max_sockets
                .filter(|max| *max > 0)
                .map(|max| Semaphore::new(max.min(Semaphore::MAX_PERMITS))),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.client().is_none()
    }

    fn client(&self) -> Option<reqwest::Client> {
        self.client.read().ok().and_then(|client| (*client).clone())
    }

    async fn send(&self, request: &SubgraphRequest) -> Result<GraphQLResponse, TransportError> {
        let _permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .acquire()
                    .await
                    .map_err(|_| TransportError::Closed)?,
            ),
            None => None,
        };
        let client = self.client().ok_or(TransportError::Closed)?;

        let response = client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TransportError::UnexpectedStatus(status));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(TransportError::InvalidBody)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &SubgraphRequest,
        ctx: &RequestContext,
    ) -> Result<GraphQLResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        ctx.guard(self.send(request)).await
    }

    fn close(&self) {
        let dropped = match self.client.write() {
            Ok(mut client) => client.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(dropped);
        if let Some(permits) = &self.permits {
            permits.close();
        }
        tracing::debug!(url = %self.url, "transport closed");
    }
}
