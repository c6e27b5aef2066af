use serde::{Deserialize, Serialize};

use crate::error::{Result, RotaError};

/// Network address of a provisioned proxy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAddress {
    pub hostname: String,
    pub port: u16,
}

impl ProxyAddress {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl std::fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// PEM encoded certificate and private key shared by a connector's instances
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub cert: String,
    #[serde(default, skip_serializing)]
    pub key: String,
}

impl std::fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterProxyConfig {
    pub address: ProxyAddress,
    #[serde(default)]
    pub certificate: Option<CertificateInfo>,
}

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZyteProxyConfig {
    #[serde(default, skip_serializing)]
    pub token: String,
    #[serde(default = "default_region")]
    pub region: String,
}

impl std::fmt::Debug for ZyteProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZyteProxyConfig")
            .field("token", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrightdataProxyConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "default_region")]
    pub country: String,
}

impl std::fmt::Debug for BrightdataProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrightdataProxyConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("country", &self.country)
            .finish()
    }
}

fn default_region() -> String {
    "all".to_string()
}

/// Provider specific part of a proxy's configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyConfig {
    Datacenter(DatacenterProxyConfig),
    Zyte(ZyteProxyConfig),
    Brightdata(BrightdataProxyConfig),
}

impl ProxyConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyConfig::Datacenter(_) => "datacenter",
            ProxyConfig::Zyte(_) => "zyte",
            ProxyConfig::Brightdata(_) => "brightdata",
        }
    }

    pub fn as_datacenter(&self) -> Result<&DatacenterProxyConfig> {
        match self {
            ProxyConfig::Datacenter(c) => Ok(c),
            other => Err(mismatch("datacenter", other)),
        }
    }

    pub fn as_datacenter_mut(&mut self) -> Result<&mut DatacenterProxyConfig> {
        match self {
            ProxyConfig::Datacenter(c) => Ok(c),
            other => Err(mismatch("datacenter", other)),
        }
    }

    pub fn as_zyte(&self) -> Result<&ZyteProxyConfig> {
        match self {
            ProxyConfig::Zyte(c) => Ok(c),
            other => Err(mismatch("zyte", other)),
        }
    }

    pub fn as_zyte_mut(&mut self) -> Result<&mut ZyteProxyConfig> {
        match self {
            ProxyConfig::Zyte(c) => Ok(c),
            other => Err(mismatch("zyte", other)),
        }
    }

    pub fn as_brightdata(&self) -> Result<&BrightdataProxyConfig> {
        match self {
            ProxyConfig::Brightdata(c) => Ok(c),
            other => Err(mismatch("brightdata", other)),
        }
    }

    pub fn as_brightdata_mut(&mut self) -> Result<&mut BrightdataProxyConfig> {
        match self {
            ProxyConfig::Brightdata(c) => Ok(c),
            other => Err(mismatch("brightdata", other)),
        }
    }
}

fn mismatch(expected: &str, found: &ProxyConfig) -> RotaError {
    RotaError::InvalidConfig(format!(
        "expected {} proxy config, found {}",
        expected,
        found.kind()
    ))
}

/// A leased upstream proxy, as handed to a transport for one outbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyToConnect {
    pub id: String,
    /// Registry key of the transport that serves this proxy
    pub transport_type: String,
    pub connector_id: String,
    /// Session key for providers that pin sessions to an exit node
    pub key: String,
    pub config: ProxyConfig,
}

/// A proxy targeted by a fingerprint/health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyToRefresh {
    pub id: String,
    pub transport_type: String,
    pub connector_id: String,
    pub key: String,
    pub config: ProxyConfig,
}

impl ProxyToRefresh {
    /// Connect view of the probed proxy
    pub fn to_connect(&self) -> ProxyToConnect {
        ProxyToConnect {
            id: self.id.clone(),
            transport_type: self.transport_type.clone(),
            connector_id: self.connector_id.clone(),
            key: self.key.clone(),
            config: self.config.clone(),
        }
    }
}

impl From<ProxyToRefresh> for ProxyToConnect {
    fn from(proxy: ProxyToRefresh) -> Self {
        ProxyToConnect {
            id: proxy.id,
            transport_type: proxy.transport_type,
            connector_id: proxy.connector_id,
            key: proxy.key,
            config: proxy.config,
        }
    }
}
