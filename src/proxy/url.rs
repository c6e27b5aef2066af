//! Target URL decomposition helpers

use std::net::IpAddr;

use url::Url;

use crate::error::{Result, RotaError};

/// Scheme of an outbound target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
}

impl TargetScheme {
    pub fn is_tls(&self) -> bool {
        matches!(self, TargetScheme::Https)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TargetScheme::Http => 80,
            TargetScheme::Https => 443,
        }
    }
}

/// Decomposed target URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlOptions {
    /// Scheme with trailing colon, e.g. `https:`
    pub protocol: String,
    /// Host without IPv6 brackets
    pub hostname: String,
    pub port: u16,
    pub pathname: String,
    /// Query string including the leading `?`
    pub search: Option<String>,
}

impl UrlOptions {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;

        let host = url
            .host_str()
            .ok_or_else(|| RotaError::InvalidUrl(format!("missing host in {}", raw)))?;
        let hostname = strip_brackets(host).to_string();
        let protocol = format!("{}:", url.scheme());

        // http and https always resolve a port, so only foreign schemes land here
        let port = match url.port_or_known_default() {
            Some(port) => port,
            None => return Err(RotaError::UnsupportedProtocol(protocol)),
        };

        let pathname = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        Ok(Self {
            protocol,
            hostname,
            port,
            pathname,
            search: url.query().map(|q| format!("?{}", q)),
        })
    }

    /// Validated scheme; anything but `http:`/`https:` is a configuration error
    pub fn scheme(&self) -> Result<TargetScheme> {
        match self.protocol.as_str() {
            "http:" => Ok(TargetScheme::Http),
            "https:" => Ok(TargetScheme::Https),
            other => Err(RotaError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// `host:port`, as used in a CONNECT request line and its Host header
    pub fn authority(&self) -> String {
        format_authority(&self.hostname, self.port)
    }

    /// Value for an origin `Host` header; the port only appears when non-default
    pub fn host_header(&self) -> String {
        let default_port = self.scheme().map(|s| s.default_port()).ok();
        if default_port == Some(self.port) {
            if self.hostname.contains(':') {
                format!("[{}]", self.hostname)
            } else {
                self.hostname.clone()
            }
        } else {
            self.authority()
        }
    }

    /// Path and query, e.g. `/search?q=1`
    pub fn path_and_query(&self) -> String {
        match &self.search {
            Some(search) => format!("{}{}", self.pathname, search),
            None => self.pathname.clone(),
        }
    }

    /// Render the request target.
    ///
    /// `absolute` selects the absolute form used when talking to a forward
    /// proxy; otherwise only the origin form (path and query) is produced.
    /// Default ports are omitted from the absolute form.
    pub fn to_url(&self, absolute: bool) -> String {
        if !absolute {
            return self.path_and_query();
        }

        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };

        let default_port = self.scheme().map(|s| s.default_port()).ok();
        if default_port == Some(self.port) {
            format!("{}//{}{}", self.protocol, host, self.path_and_query())
        } else {
            format!(
                "{}//{}:{}{}",
                self.protocol,
                host,
                self.port,
                self.path_and_query()
            )
        }
    }
}

/// True when `hostname` is a DNS name rather than a literal IP address
pub fn is_dns_name(hostname: &str) -> bool {
    let host = strip_brackets(hostname);
    !host.is_empty() && host.parse::<IpAddr>().is_err()
}

pub(crate) fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

pub(crate) fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
