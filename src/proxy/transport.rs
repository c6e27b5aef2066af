//! Transport contract shared by every upstream provider
//!
//! A transport turns a leased proxy plus a target URL into either
//! [`ConnectionArgs`] for a plain request, or a raw CONNECT tunnel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{Result, RotaError};
use crate::models::{ConnectorProxyRefreshed, ConnectorToRefresh, ProxyToConnect, ProxyToRefresh};
use crate::proxy::headers::HeaderSet;
use crate::proxy::sockets::SocketRegistry;
use crate::proxy::tunnel::{self, Hop, TunnelRequest};
use crate::proxy::url::UrlOptions;

/// Trait for proxied connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Stream handed back to callers once a connection is usable
pub type ProxyStream = Box<dyn ProxyConnection>;

/// Provider specific connection logic.
///
/// Implementations only supply provider deltas (hop address, credentials,
/// certificates); CONNECT handling lives in [`crate::proxy::tunnel`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Registry key, unique per process
    fn transport_type(&self) -> &str;

    /// Merge connector and credential settings into a proxy's config.
    ///
    /// Must be idempotent and must only touch `proxy`.
    fn complete_proxy_config(
        &self,
        proxy: &mut ConnectorProxyRefreshed,
        connector: &ConnectorToRefresh,
    ) -> Result<()>;

    /// Connection parameters for a request to `url` through `proxy`
    #[allow(clippy::too_many_arguments)]
    fn build_request_args(
        &self,
        method: Method,
        url: &UrlOptions,
        headers: HeaderSet,
        headers_connect: HeaderSet,
        proxy: &ProxyToConnect,
        sockets: &SocketRegistry,
        timeout: Duration,
    ) -> Result<ConnectionArgs>;

    /// Same as [`Transport::build_request_args`], for fingerprint probes
    #[allow(clippy::too_many_arguments)]
    fn build_fingerprint_request_args(
        &self,
        method: Method,
        url: &UrlOptions,
        headers: HeaderSet,
        headers_connect: HeaderSet,
        proxy: &ProxyToRefresh,
        sockets: &SocketRegistry,
        timeout: Duration,
    ) -> Result<ConnectionArgs> {
        self.build_request_args(
            method,
            url,
            headers,
            headers_connect,
            &proxy.to_connect(),
            sockets,
            timeout,
        )
    }

    /// Open a raw CONNECT tunnel to `target` (`host:port`) through `proxy`
    async fn connect(
        &self,
        target: &str,
        headers: HeaderSet,
        proxy: &ProxyToConnect,
        sockets: &SocketRegistry,
        timeout: Duration,
    ) -> Result<ProxyStream>;
}

/// Creates the socket a request is written to
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn create(&self, sockets: &SocketRegistry) -> Result<ProxyStream>;
}

/// Dials the hop itself; the request is written straight to the proxy
#[derive(Debug, Clone)]
pub struct DirectSocketFactory {
    origin: &'static str,
    hop: Hop,
    idle_timeout: Duration,
}

impl DirectSocketFactory {
    pub fn new(origin: &'static str, hop: Hop, idle_timeout: Duration) -> Self {
        Self {
            origin,
            hop,
            idle_timeout,
        }
    }
}

#[async_trait]
impl SocketFactory for DirectSocketFactory {
    async fn create(&self, sockets: &SocketRegistry) -> Result<ProxyStream> {
        self.hop.dial(sockets, self.origin, self.idle_timeout).await
    }
}

/// Opens a CONNECT tunnel and hands back the tunneled (possibly TLS) stream
#[derive(Debug, Clone)]
pub struct TunnelSocketFactory {
    request: TunnelRequest,
}

impl TunnelSocketFactory {
    pub fn new(request: TunnelRequest) -> Self {
        Self { request }
    }
}

#[async_trait]
impl SocketFactory for TunnelSocketFactory {
    async fn create(&self, sockets: &SocketRegistry) -> Result<ProxyStream> {
        tunnel::establish(&self.request, sockets).await
    }
}

/// Parameters for one outbound request, ready for an HTTP/1.1 client
pub struct ConnectionArgs {
    pub method: Method,
    /// Upstream proxy the connection is opened to
    pub hostname: String,
    pub port: u16,
    /// Request target: absolute form for forward proxies, origin form otherwise
    pub path: String,
    pub headers: HeaderSet,
    pub timeout: Duration,
    factory: Arc<dyn SocketFactory>,
    sockets: SocketRegistry,
    cancel: CancellationToken,
}

impl ConnectionArgs {
    pub fn new(
        method: Method,
        hop: &Hop,
        path: String,
        headers: HeaderSet,
        timeout: Duration,
        factory: Arc<dyn SocketFactory>,
        sockets: &SocketRegistry,
    ) -> Self {
        Self {
            method,
            hostname: hop.hostname.clone(),
            port: hop.port,
            path,
            headers,
            timeout,
            factory,
            sockets: sockets.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token aborting [`ConnectionArgs::create_connection`]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sockets(&self) -> &SocketRegistry {
        &self.sockets
    }

    /// Run the socket factory under the timeout and the cancellation token.
    ///
    /// On timeout or cancellation every socket opened so far is destroyed.
    #[instrument(skip(self), fields(hostname = %self.hostname, port = self.port, path = %self.path))]
    pub async fn create_connection(&self) -> Result<ProxyStream> {
        let attempt = with_deadline(self.timeout, self.factory.create(&self.sockets));

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("Connection attempt cancelled");
                Err(RotaError::Cancelled)
            }
            res = attempt => res,
        }
    }
}

impl std::fmt::Debug for ConnectionArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionArgs")
            .field("method", &self.method)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("headers", &self.headers.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Bound `fut` by `timeout`; a zero timeout means no deadline
pub async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }

    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RotaError::Timeout)?
}
