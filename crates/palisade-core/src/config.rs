//! Host-facing middleware configuration.

use serde::{Deserialize, Serialize};

/// Client-IP extraction policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpStrategy {
    /// Use the direct connection address; forwarded headers are ignored.
    #[default]
    Direct,
    /// First entry of `X-Forwarded-For`, when the peer is a trusted proxy.
    Xff,
    /// `X-Real-IP`, when the peer is a trusted proxy.
    RealIp,
    /// A configured custom header, when the peer is a trusted proxy.
    Custom,
}

impl IpStrategy {
    /// Wire name of the strategy, as carried in batch metadata.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Xff => "xff",
            Self::RealIp => "real-ip",
            Self::Custom => "custom",
        }
    }
}

/// Configuration supplied by the host proxy when installing the middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Bootstrap credential (JWT). Required.
    pub bootstrap_token: String,

    /// Log verbosity: `trace`, `debug`, `info`, `warn`, or `error`.
    pub log_level: String,

    /// Identifies this process to the control plane; a random 16-byte hex
    /// id is generated when empty.
    pub machine_id: String,

    /// Client-IP extraction policy.
    pub ip_strategy: IpStrategy,

    /// Header to read when `ip_strategy` is `custom`.
    pub trusted_header: String,

    /// Trusted proxy entries: IPs, CIDR prefixes, or the keywords
    /// `loopback` and `private`.
    pub trusted_proxies: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            bootstrap_token: String::new(),
            log_level: "info".to_string(),
            machine_id: String::new(),
            ip_strategy: IpStrategy::default(),
            trusted_header: String::new(),
            trusted_proxies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MiddlewareConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.ip_strategy, IpStrategy::Direct);
        assert!(config.trusted_proxies.is_empty());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: MiddlewareConfig = serde_json::from_str(
            r#"{"bootstrap_token":"tok","ip_strategy":"real-ip",
                "trusted_proxies":["10.0.0.0/8","loopback"]}"#,
        )
        .unwrap();

        assert_eq!(config.bootstrap_token, "tok");
        assert_eq!(config.ip_strategy, IpStrategy::RealIp);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.trusted_proxies.len(), 2);
    }

    #[test]
    fn test_strategy_wire_names() {
        for (strategy, name) in [
            (IpStrategy::Direct, "direct"),
            (IpStrategy::Xff, "xff"),
            (IpStrategy::RealIp, "real-ip"),
            (IpStrategy::Custom, "custom"),
        ] {
            assert_eq!(strategy.as_str(), name);
            let json = format!("\"{name}\"");
            assert_eq!(serde_json::from_str::<IpStrategy>(&json).unwrap(), strategy);
        }
    }
}
