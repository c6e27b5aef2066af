use crate::error::{Result, RotaError};
use http::uri::Authority;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::proxy::url::{format_authority, strip_brackets};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection establishment settings
    pub transport: TransportConfig,
    /// Fixed endpoints of commercial proxy providers
    pub providers: ProvidersConfig,
    /// Fingerprint probe settings
    pub fingerprint: FingerprintConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in milliseconds, 0 disables it (default: 10000)
    pub connect_timeout_ms: u64,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// `host:port` of an upstream proxy service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoint {
    pub hostname: String,
    pub port: u16,
}

impl UpstreamEndpoint {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Parse `host:port`; IPv6 hosts must be bracketed
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.contains('@') {
            return Err(RotaError::InvalidConfig(format!(
                "endpoint must be host:port, got {}",
                raw
            )));
        }

        let authority = raw
            .parse::<Authority>()
            .map_err(|e| RotaError::InvalidConfig(format!("invalid endpoint {}: {}", raw, e)))?;
        let port = authority
            .port_u16()
            .ok_or_else(|| RotaError::InvalidConfig(format!("endpoint {} has no port", raw)))?;

        Ok(Self::new(strip_brackets(authority.host()), port))
    }

    pub fn zyte() -> Self {
        Self::new("proxy.crawlera.com", 8011)
    }

    pub fn brightdata() -> Self {
        Self::new("brd.superproxy.io", 33335)
    }
}

impl std::fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_authority(&self.hostname, self.port))
    }
}

#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub zyte: UpstreamEndpoint,
    pub brightdata: UpstreamEndpoint,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            zyte: UpstreamEndpoint::zyte(),
            brightdata: UpstreamEndpoint::brightdata(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintConfig {
    /// URL requested through each proxy
    pub url: String,
    /// Probe timeout in milliseconds
    pub timeout_ms: u64,
    /// Maximum concurrent probes
    pub workers: usize,
    /// JSON file listing the proxies to probe
    pub proxies_file: Option<PathBuf>,
}

impl FingerprintConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            transport: TransportConfig {
                connect_timeout_ms: get_env_or("ROTA_CONNECT_TIMEOUT_MS", "10000")
                    .parse()
                    .map_err(|_| {
                        RotaError::InvalidConfig(
                            "ROTA_CONNECT_TIMEOUT_MS must be a valid number".into(),
                        )
                    })?,
            },
            providers: ProvidersConfig {
                zyte: parse_endpoint("ROTA_ZYTE_ENDPOINT", UpstreamEndpoint::zyte())?,
                brightdata: parse_endpoint(
                    "ROTA_BRIGHTDATA_ENDPOINT",
                    UpstreamEndpoint::brightdata(),
                )?,
            },
            fingerprint: FingerprintConfig {
                url: parse_fingerprint_url()?,
                timeout_ms: get_env_or("ROTA_FINGERPRINT_TIMEOUT_MS", "10000")
                    .parse()
                    .map_err(|_| {
                        RotaError::InvalidConfig(
                            "ROTA_FINGERPRINT_TIMEOUT_MS must be a valid number".into(),
                        )
                    })?,
                workers: get_env_or("ROTA_FINGERPRINT_WORKERS", "8")
                    .parse::<usize>()
                    .map(|w| w.max(1))
                    .map_err(|_| {
                        RotaError::InvalidConfig(
                            "ROTA_FINGERPRINT_WORKERS must be a valid number".into(),
                        )
                    })?,
                proxies_file: env::var("ROTA_PROXIES_FILE")
                    .ok()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }
}

fn parse_endpoint(key: &str, default: UpstreamEndpoint) -> Result<UpstreamEndpoint> {
    let raw = env::var(key).unwrap_or_default();
    if raw.trim().is_empty() {
        return Ok(default);
    }

    UpstreamEndpoint::parse(&raw)
        .map_err(|e| RotaError::InvalidConfig(format!("{} is invalid: {}", key, e)))
}

fn parse_fingerprint_url() -> Result<String> {
    let raw = get_env_or("ROTA_FINGERPRINT_URL", "http://www.google.com/");
    let url = Url::parse(raw.trim()).map_err(|e| {
        RotaError::InvalidConfig(format!("ROTA_FINGERPRINT_URL must be a valid URL: {}", e))
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(RotaError::InvalidConfig(format!(
            "ROTA_FINGERPRINT_URL has unsupported scheme: {}",
            other
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "ROTA_CONNECT_TIMEOUT_MS",
        "ROTA_ZYTE_ENDPOINT",
        "ROTA_BRIGHTDATA_ENDPOINT",
        "ROTA_FINGERPRINT_URL",
        "ROTA_FINGERPRINT_TIMEOUT_MS",
        "ROTA_FINGERPRINT_WORKERS",
        "ROTA_PROXIES_FILE",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.transport.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.providers.zyte, UpstreamEndpoint::zyte());
        assert_eq!(config.providers.zyte.to_string(), "proxy.crawlera.com:8011");
        assert_eq!(
            config.providers.brightdata.to_string(),
            "brd.superproxy.io:33335"
        );
        assert_eq!(config.fingerprint.url, "http://www.google.com/");
        assert_eq!(config.fingerprint.workers, 8);
        assert!(config.fingerprint.proxies_file.is_none());
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTA_CONNECT_TIMEOUT_MS", "0");
        env::set_var("ROTA_ZYTE_ENDPOINT", "127.0.0.1:18011");
        env::set_var("ROTA_BRIGHTDATA_ENDPOINT", "[::1]:22225");
        env::set_var("ROTA_FINGERPRINT_URL", "https://fingerprint.example/json");
        env::set_var("ROTA_FINGERPRINT_WORKERS", "0");
        env::set_var("ROTA_PROXIES_FILE", "/tmp/proxies.json");
        env::set_var("LOG_FORMAT", "pretty");

        let config = Config::from_env().unwrap();

        assert!(config.transport.connect_timeout().is_zero());
        assert_eq!(
            config.providers.zyte,
            UpstreamEndpoint::new("127.0.0.1", 18011)
        );
        assert_eq!(
            config.providers.brightdata,
            UpstreamEndpoint::new("::1", 22225)
        );
        assert_eq!(config.providers.brightdata.to_string(), "[::1]:22225");
        assert_eq!(config.fingerprint.url, "https://fingerprint.example/json");
        assert_eq!(config.fingerprint.workers, 1);
        assert_eq!(
            config.fingerprint.proxies_file,
            Some(PathBuf::from("/tmp/proxies.json"))
        );
        assert_eq!(config.log.format, "pretty");
    }

    #[test]
    fn test_config_from_env_invalid_timeout() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTA_CONNECT_TIMEOUT_MS", "soon");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_endpoint() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTA_ZYTE_ENDPOINT", "proxy.example");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_rejects_non_http_fingerprint_url() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTA_FINGERPRINT_URL", "ftp://fingerprint.example/");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_upstream_endpoint_parse() {
        assert_eq!(
            UpstreamEndpoint::parse("proxy.example:8011").unwrap(),
            UpstreamEndpoint::new("proxy.example", 8011)
        );
        assert!(UpstreamEndpoint::parse("proxy.example:8011/path").is_err());
        assert!(UpstreamEndpoint::parse("user@proxy.example:8011").is_err());
    }
}
