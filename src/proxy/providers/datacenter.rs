//! Transport for proxy instances provisioned on datacenter VMs
//!
//! Every hop to an instance is mutual TLS pinned to the connector
//! certificate, and every request goes through a CONNECT tunnel.

use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use tracing::{debug, instrument};

use super::{connect_authority, target_tls, tunneled_args, TRANSPORT_DATACENTER_TYPE};
use crate::error::{Result, RotaError};
use crate::models::{
    ConnectorProxyRefreshed, ConnectorToRefresh, DatacenterProxyConfig, ProxyToConnect,
    ProxyToRefresh,
};
use crate::proxy::headers::{HeaderSet, HEADER_METRICS, HEADER_PROXY_ERROR, METRICS_IGNORE};
use crate::proxy::sockets::SocketRegistry;
use crate::proxy::tls::{pinned_client_config, TargetServerName};
use crate::proxy::transport::{with_deadline, ConnectionArgs, ProxyStream, Transport};
use crate::proxy::tunnel::{self, Hop, HopTls, ReasonSource, TunnelRequest};
use crate::proxy::url::UrlOptions;

const ERROR_HEADERS: &[&str] = &[HEADER_PROXY_ERROR];

/// Datacenter proxy transport.
///
/// Shared by every cloud connector; each registers it under its own type.
#[derive(Debug, Clone)]
pub struct DatacenterTransport {
    transport_type: String,
}

impl DatacenterTransport {
    pub fn new(transport_type: impl Into<String>) -> Self {
        Self {
            transport_type: transport_type.into(),
        }
    }
}

impl Default for DatacenterTransport {
    fn default() -> Self {
        Self::new(TRANSPORT_DATACENTER_TYPE)
    }
}

/// Mutual TLS hop to the proxy instance
fn instance_hop(config: &DatacenterProxyConfig) -> Result<Hop> {
    let certificate = config.certificate.as_ref().ok_or_else(|| {
        RotaError::InvalidConfig(format!("proxy {} has no certificate", config.address))
    })?;

    let tls = HopTls {
        config: pinned_client_config(certificate)?,
        server_name: TargetServerName::for_host(&config.address.hostname)?,
    };

    Ok(Hop::plain(config.address.hostname.clone(), config.address.port).with_tls(tls))
}

#[async_trait]
impl Transport for DatacenterTransport {
    fn transport_type(&self) -> &str {
        &self.transport_type
    }

    fn complete_proxy_config(
        &self,
        proxy: &mut ConnectorProxyRefreshed,
        connector: &ConnectorToRefresh,
    ) -> Result<()> {
        let certificate = connector.certificate()?.clone();
        proxy.config.as_datacenter_mut()?.certificate = Some(certificate);
        Ok(())
    }

    #[instrument(skip_all, fields(proxy_id = %proxy.id, target = %url.authority()))]
    fn build_request_args(
        &self,
        method: Method,
        url: &UrlOptions,
        headers: HeaderSet,
        headers_connect: HeaderSet,
        proxy: &ProxyToConnect,
        sockets: &SocketRegistry,
        timeout: Duration,
    ) -> Result<ConnectionArgs> {
        let target_tls = target_tls(url)?;
        let config = proxy.config.as_datacenter()?;

        let request = TunnelRequest {
            origin: "datacenter:request",
            hop: instance_hop(config)?,
            authority: connect_authority(&headers_connect, url)?,
            headers: headers_connect,
            error_headers: ERROR_HEADERS,
            reason: ReasonSource::Body,
            target_tls,
            idle_timeout: timeout,
        };
        debug!(hop = %request.hop.authority(), authority = %request.authority, "Built datacenter tunnel");

        Ok(tunneled_args(method, url, headers, request, sockets, timeout))
    }

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
            headers_connect.with(HEADER_METRICS, METRICS_IGNORE),
            &proxy.to_connect(),
            sockets,
            timeout,
        )
    }

    #[instrument(skip(self, headers, proxy, sockets), fields(proxy_id = %proxy.id))]
    async fn connect(
        &self,
        target: &str,
        headers: HeaderSet,
        proxy: &ProxyToConnect,
        sockets: &SocketRegistry,
        timeout: Duration,
    ) -> Result<ProxyStream> {
        let config = proxy.config.as_datacenter()?;

        let request = TunnelRequest {
            origin: "datacenter:connect",
            hop: instance_hop(config)?,
            authority: target.to_string(),
            headers,
            error_headers: ERROR_HEADERS,
            reason: ReasonSource::Header,
            target_tls: None,
            idle_timeout: timeout,
        };

        with_deadline(timeout, tunnel::establish(&request, sockets)).await
    }
}
