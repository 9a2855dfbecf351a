//! Bus connection settings shared by the controller and worker binaries.

use std::path::PathBuf;

/// Message bus connection settings.
///
/// The client certificate, key and CA are used for mutual TLS against an
/// external bus. The embedded bus ignores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub url: String,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "localhost:4222".to_string(),
            cert: PathBuf::from("/nats/tls/tls.crt"),
            key: PathBuf::from("/nats/tls/tls.key"),
            ca: PathBuf::from("/nats/tls/ca.crt"),
        }
    }
}

impl BusConfig {
    /// Load from `VSCAN_BUS_URL`, `VSCAN_BUS_CERT`, `VSCAN_BUS_KEY` and
    /// `VSCAN_BUS_CA`, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("VSCAN_BUS_URL").unwrap_or(defaults.url),
            cert: std::env::var("VSCAN_BUS_CERT")
                .map(PathBuf::from)
                .unwrap_or(defaults.cert),
            key: std::env::var("VSCAN_BUS_KEY")
                .map(PathBuf::from)
                .unwrap_or(defaults.key),
            ca: std::env::var("VSCAN_BUS_CA")
                .map(PathBuf::from)
                .unwrap_or(defaults.ca),
        }
    }
}
