//! Fingerprint probes for upstream proxies
//!
//! Sends one request through a proxy with its transport's fingerprint
//! arguments, so upstreams keep the probe out of user metrics.

use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use http::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::FingerprintConfig;
use crate::error::Result;
use crate::models::ProxyToRefresh;
use crate::proxy::client::send_request;
use crate::proxy::headers::HeaderSet;
use crate::proxy::registry::TransportRegistry;
use crate::proxy::sockets::SocketRegistry;
use crate::proxy::transport::with_deadline;
use crate::proxy::url::UrlOptions;

const USER_AGENT: &str = concat!("rota-transport/", env!("CARGO_PKG_VERSION"));

/// Fingerprint checker configuration
#[derive(Debug, Clone)]
pub struct FingerprintCheckerConfig {
    /// URL requested through each proxy
    pub url: String,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Bound on each connection stage of a probe: dialing, CONNECT and TLS,
    /// then the exchange itself
    pub connect_timeout: Duration,
    /// Maximum probes in flight
    pub workers: usize,
}

impl Default for FingerprintCheckerConfig {
    fn default() -> Self {
        Self {
            url: "http://www.google.com/".to_string(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            workers: 8,
        }
    }
}

impl From<&FingerprintConfig> for FingerprintCheckerConfig {
    fn from(config: &FingerprintConfig) -> Self {
        Self {
            url: config.url.clone(),
            timeout: config.timeout(),
            connect_timeout: Duration::from_secs(10),
            workers: config.workers.max(1),
        }
    }
}

impl FingerprintCheckerConfig {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Outcome of probing one proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintResult {
    pub proxy_id: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Probes proxies through their registered transports
pub struct FingerprintChecker {
    registry: TransportRegistry,
    config: FingerprintCheckerConfig,
    sockets: SocketRegistry,
}

impl FingerprintChecker {
    pub fn new(registry: TransportRegistry, config: FingerprintCheckerConfig) -> Self {
        Self {
            registry,
            config,
            sockets: SocketRegistry::new(),
        }
    }

    /// Sockets opened by probes still in flight
    pub fn sockets(&self) -> &SocketRegistry {
        &self.sockets
    }

    /// Probe every proxy, at most `workers` at a time
    pub async fn check_all(&self, proxies: Vec<ProxyToRefresh>) -> Vec<FingerprintResult> {
        info!("Checking fingerprint of {} proxies", proxies.len());

        let results = futures::stream::iter(proxies)
            .map(|proxy| async move { self.check(&proxy).await })
            .buffer_unordered(self.config.workers.max(1))
            .collect::<Vec<FingerprintResult>>()
            .await;

        let healthy_count = results.iter().filter(|r| r.success).count();
        info!(
            "Fingerprint check complete: {} healthy, {} unhealthy",
            healthy_count,
            results.len().saturating_sub(healthy_count)
        );

        results
    }

    /// Probe a single proxy
    #[instrument(skip(self), fields(proxy_id = %proxy.id, transport_type = %proxy.transport_type))]
    pub async fn check(&self, proxy: &ProxyToRefresh) -> FingerprintResult {
        let started = Instant::now();
        let outcome = self.probe(proxy).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (success, status_code, error) = match outcome {
            Ok(status) if (200..300).contains(&status) => {
                debug!(status, latency_ms, "Proxy {} is healthy", proxy.id);
                (true, Some(status), None)
            }
            Ok(status) => {
                let msg = format!("unexpected status {}", status);
                warn!("Proxy {} is unhealthy: {}", proxy.id, msg);
                (false, Some(status), Some(msg))
            }
            Err(e) => {
                let status = e.as_transport_error().map(|t| t.status_code);
                warn!("Proxy {} is unhealthy: {}", proxy.id, e);
                (false, status, Some(e.to_string()))
            }
        };

        FingerprintResult {
            proxy_id: proxy.id.clone(),
            success,
            status_code,
            latency_ms,
            error,
            checked_at: Utc::now(),
        }
    }

    async fn probe(&self, proxy: &ProxyToRefresh) -> Result<u16> {
        let url = UrlOptions::parse(&self.config.url)?;
        let transport = self.registry.get(&proxy.transport_type)?;

        let headers = HeaderSet::new()
            .with("User-Agent", USER_AGENT)
            .with("Accept", "*/*");
        let args = transport.build_fingerprint_request_args(
            Method::GET,
            &url,
            headers,
            HeaderSet::new(),
            proxy,
            &self.sockets,
            self.config.connect_timeout,
        )?;

        let response =
            with_deadline(self.config.timeout, send_request(&args, Bytes::new())).await?;

        Ok(response.status().as_u16())
    }
}
