//! Header sets and the project's custom header conventions

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Result, RotaError, TransportError};

/// Prefix for every header this project defines
pub const HEADER_PREFIX: &str = "X-Rota";
pub const HEADER_PREFIX_LC: &str = "x-rota";

/// Marks fingerprint traffic so upstream proxies keep it out of user metrics
pub const HEADER_METRICS: &str = "X-Rota-Metrics";
pub const METRICS_IGNORE: &str = "ignore";

/// Reason header set by datacenter proxies on refused tunnels
pub const HEADER_PROXY_ERROR: &str = "x-rota-proxyerror";

/// Ordered, case preserving header list.
///
/// Names compare case-insensitively. The casing given on insert is what goes
/// on the wire in a CONNECT frame, where several upstreams match header names
/// byte for byte. Requests sent through [`crate::proxy::client`] go through
/// hyper instead, which writes every name in title case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name`, replacing any existing value regardless of case
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => *entry = (name, value),
            None => self.entries.push((name, value)),
        }
        self
    }

    /// Set `name` only when it is not present yet
    pub fn with_default(self, name: &str, value: impl Into<String>) -> Self {
        if self.contains(name) {
            self
        } else {
            self.with(name, value)
        }
    }

    pub fn without(mut self, name: &str) -> Self {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    /// Overlay `other` on top of `self`
    pub fn merge(self, other: &HeaderSet) -> Self {
        other
            .entries
            .iter()
            .fold(self, |acc, (n, v)| acc.with(n.clone(), v.clone()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as `Name: value\r\n` lines.
    ///
    /// Fails without writing anything if a name or value would break the
    /// line framing.
    pub fn write_to(&self, out: &mut String) -> Result<()> {
        for (name, value) in &self.entries {
            validate_entry(name, value)?;
        }
        for (name, value) in &self.entries {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        Ok(())
    }

    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            let (name, value) = validate_entry(name, value)?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

fn validate_entry(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RotaError::InvalidHeader(format!("{:?}: {}", name, e)))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|e| RotaError::InvalidHeader(format!("{}: {}", name, e)))?;
    Ok((header_name, header_value))
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(HeaderSet::new(), |acc, (n, v)| acc.with(n, v))
    }
}

/// Status line and headers of an upstream's answer to CONNECT
#[derive(Debug, Clone)]
pub struct ConnectResponseHead {
    pub status_code: u16,
    pub reason: String,
    pub headers: HeaderSet,
}

impl ConnectResponseHead {
    /// Parse a complete response head (terminated by an empty line)
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut raw_headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut raw_headers);
        match response.parse(buf) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(RotaError::MalformedResponse(
                    "incomplete response head".to_string(),
                ))
            }
            Err(e) => return Err(RotaError::MalformedResponse(e.to_string())),
        }

        let status_code = response
            .code
            .ok_or_else(|| RotaError::MalformedResponse("missing status code".to_string()))?;

        let headers = response
            .headers
            .iter()
            .map(|h| (h.name, String::from_utf8_lossy(h.value).trim().to_string()))
            .collect();

        Ok(Self {
            status_code,
            reason: response.reason.unwrap_or_default().to_string(),
            headers,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Body uses chunked transfer coding; takes precedence over Content-Length
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .and_then(|v| v.rsplit(',').next())
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    /// First non-empty value among `names`
    pub fn error_header(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|n| self.headers.get(n))
            .map(|v| v.trim_matches('"'))
            .find(|v| !v.is_empty())
    }

    /// Rejection built from an error header, falling back to the status text
    pub fn to_transport_error(&self, error_headers: &[&str]) -> TransportError {
        let reason = self
            .error_header(error_headers)
            .unwrap_or(self.reason.as_str())
            .to_string();
        TransportError::new(self.status_code, reason)
    }
}

/// Extract a rejection reason from a drained error body.
///
/// Precedence: error header, then a JSON `message`/`error` field, then the body
/// text, then the status text.
pub fn parse_body_error(
    head: &ConnectResponseHead,
    body: &[u8],
    error_headers: &[&str],
) -> TransportError {
    if let Some(reason) = head.error_header(error_headers) {
        return TransportError::new(head.status_code, reason);
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();

    let from_json = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });

    let reason = match from_json {
        Some(message) if !message.is_empty() => message,
        _ if !text.is_empty() => text.to_string(),
        _ => head.reason.clone(),
    };

    TransportError::new(head.status_code, reason)
}
