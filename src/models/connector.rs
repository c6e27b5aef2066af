use serde::{Deserialize, Serialize};

use super::proxy::{CertificateInfo, ProxyConfig};
use crate::error::{Result, RotaError};

/// Credential scoped settings (one provider account)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CredentialConfig {
    Datacenter,
    Zyte {
        #[serde(default, skip_serializing)]
        token: String,
    },
    Brightdata {
        username: String,
        #[serde(default, skip_serializing)]
        password: String,
    },
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialConfig::Datacenter => f.write_str("Datacenter"),
            CredentialConfig::Zyte { .. } => f.write_str("Zyte { token: <redacted> }"),
            CredentialConfig::Brightdata { username, .. } => f
                .debug_struct("Brightdata")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Connector scoped settings (shared by every proxy of one connector)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectorConfig {
    Datacenter {
        #[serde(default)]
        region: Option<String>,
    },
    Zyte {
        region: String,
    },
    Brightdata {
        country: String,
    },
}

/// Connector and credential settings to merge into its proxies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorToRefresh {
    pub id: String,
    pub transport_type: String,
    pub credential_config: CredentialConfig,
    pub connector_config: ConnectorConfig,
    #[serde(default)]
    pub certificate: Option<CertificateInfo>,
}

impl ConnectorToRefresh {
    pub fn zyte_token(&self) -> Result<&str> {
        match &self.credential_config {
            CredentialConfig::Zyte { token } => Ok(token),
            _ => Err(self.mismatch("zyte credential")),
        }
    }

    pub fn zyte_region(&self) -> Result<&str> {
        match &self.connector_config {
            ConnectorConfig::Zyte { region } => Ok(region),
            _ => Err(self.mismatch("zyte connector config")),
        }
    }

    pub fn brightdata_credential(&self) -> Result<(&str, &str)> {
        match &self.credential_config {
            CredentialConfig::Brightdata { username, password } => Ok((username, password)),
            _ => Err(self.mismatch("brightdata credential")),
        }
    }

    pub fn brightdata_country(&self) -> Result<&str> {
        match &self.connector_config {
            ConnectorConfig::Brightdata { country } => Ok(country),
            _ => Err(self.mismatch("brightdata connector config")),
        }
    }

    pub fn certificate(&self) -> Result<&CertificateInfo> {
        self.certificate.as_ref().ok_or_else(|| {
            RotaError::InvalidConfig(format!("connector {} has no certificate", self.id))
        })
    }

    fn mismatch(&self, expected: &str) -> RotaError {
        RotaError::InvalidConfig(format!("connector {} has no {}", self.id, expected))
    }
}

/// A proxy as reported by its connector, before it is handed out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorProxyRefreshed {
    pub id: String,
    pub transport_type: String,
    pub key: String,
    pub name: String,
    pub config: ProxyConfig,
}
