//! Proxy and service configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Transport a proxy relays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One listen/upstream pair.
///
/// `listen` and `upstream` are `host:port` strings. A listen port of 0 asks
/// for an ephemeral port; once the proxy runs, its config reports the bound
/// port instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub listen: String,
    pub upstream: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub protocol: Protocol,
}

impl ProxyConfig {
    /// An enabled TCP proxy.
    pub fn new(
        name: impl Into<String>,
        listen: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            upstream: upstream.into(),
            enabled: true,
            protocol: Protocol::Tcp,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Reject records with empty required fields.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::MissingField("name"));
        }
        if self.listen.trim().is_empty() {
            return Err(ProxyError::MissingField("listen"));
        }
        if self.upstream.trim().is_empty() {
            return Err(ProxyError::MissingField("upstream"));
        }
        Ok(())
    }
}

/// How a UDP proxy treats virtual connections that go quiet.
///
/// UDP carries no close signal, so by default a virtual connection lives
/// until its proxy stops. Setting `idle_timeout` evicts virtual connections
/// that have not received a datagram from their client for that long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpSessionPolicy {
    pub idle_timeout: Option<Duration>,
}

impl UdpSessionPolicy {
    /// Never evict (the default).
    pub fn never_evict() -> Self {
        Self::default()
    }

    /// Evict after `idle_timeout` without client traffic.
    pub fn evict_after(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(idle_timeout),
        }
    }
}

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON file holding an array of proxy configs to create at startup.
    pub proxies_file: Option<PathBuf>,

    /// Idle eviction for UDP virtual connections (none by default).
    pub udp_idle_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let proxies_file = lookup("FAULTLINE_CONFIG")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let udp_idle_timeout_ms: Option<u64> = lookup("FAULTLINE_UDP_IDLE_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("FAULTLINE_UDP_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?;
        let udp_idle_timeout = udp_idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let log_level = lookup("FAULTLINE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            proxies_file,
            udp_idle_timeout,
            log_level,
        })
    }

    pub fn udp_policy(&self) -> UdpSessionPolicy {
        UdpSessionPolicy {
            idle_timeout: self.udp_idle_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_proxy_config_defaults() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{"name": "redis", "listen": "127.0.0.1:0", "upstream": "127.0.0.1:6379"}"#,
        )
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_proxy_config_udp() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{"name": "dns", "listen": "127.0.0.1:0", "upstream": "127.0.0.1:53", "enabled": false, "protocol": "udp"}"#,
        )
        .unwrap();

        assert!(!config.enabled);
        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(config.protocol.to_string(), "udp");
    }

    #[test]
    fn test_validate_reports_first_missing_field() {
        let config = ProxyConfig::new("redis", "", "127.0.0.1:6379");
        assert!(matches!(
            config.validate(),
            Err(ProxyError::MissingField("listen"))
        ));

        let config = ProxyConfig::new(" ", "127.0.0.1:0", "");
        assert!(matches!(
            config.validate(),
            Err(ProxyError::MissingField("name"))
        ));

        assert!(ProxyConfig::new("redis", "127.0.0.1:0", "127.0.0.1:6379")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();

        assert!(config.proxies_file.is_none());
        assert_eq!(config.udp_policy(), UdpSessionPolicy::never_evict());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_from_vars() {
        let config = Config::from_lookup(lookup_from(&[
            ("FAULTLINE_CONFIG", "/etc/faultline/proxies.json"),
            ("FAULTLINE_UDP_IDLE_TIMEOUT_MS", "30000"),
            ("FAULTLINE_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(
            config.proxies_file,
            Some(PathBuf::from("/etc/faultline/proxies.json"))
        );
        assert_eq!(
            config.udp_policy(),
            UdpSessionPolicy::evict_after(Duration::from_secs(30))
        );
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_config_rejects_bad_timeout() {
        let err = Config::from_lookup(lookup_from(&[("FAULTLINE_UDP_IDLE_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("FAULTLINE_UDP_IDLE_TIMEOUT_MS"));
    }
}
