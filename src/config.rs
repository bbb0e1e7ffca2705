//! Station and manager configuration.
//!
//! Each station gets its own immutable connection parameters. A manager can
//! be bootstrapped from a TOML file listing every station, the same way the
//! rest of the system loads its configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StationError;

fn default_port() -> u16 {
    8883
}

fn default_reconnect_ms() -> u64 {
    5000
}

fn default_keep_alive_secs() -> u64 {
    5
}

/// Transport security for one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// TLS with mutual authentication (the production default).
    #[default]
    Mqtts,
    /// Plain TCP, used against local brokers during development.
    Mqtt,
}

/// Immutable connection parameters for one station.
///
/// Credential paths are assumed valid and readable; certificate contents
/// are validated by the certificate-management subsystem before they reach
/// this config, not here.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StationConfig {
    /// Unique key of this station within a manager.
    pub station_id: String,
    /// Client identifier presented to the broker, unique broker-wide.
    pub client_identity: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// PEM private key path, required for `mqtts`.
    pub key_file: Option<PathBuf>,
    /// PEM client certificate path, required for `mqtts`.
    pub cert_file: Option<PathBuf>,
    /// PEM trust anchor path, required for `mqtts`.
    pub ca_file: Option<PathBuf>,
    /// Delay between transport reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl StationConfig {
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    /// Builds the transport options for this station, reading credential
    /// files when the station uses TLS.
    pub fn mqtt_options(&self) -> Result<MqttOptions, StationError> {
        let mut options = MqttOptions::new(&self.client_identity, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs));

        if self.protocol == TransportProtocol::Mqtts {
            let (ca_file, cert_file, key_file) =
                match (&self.ca_file, &self.cert_file, &self.key_file) {
                    (Some(ca), Some(cert), Some(key)) => (ca, cert, key),
                    _ => return Err(StationError::MissingCredentials(self.station_id.clone())),
                };
            let ca = read_credential(ca_file)?;
            let cert = read_credential(cert_file)?;
            let key = read_credential(key_file)?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            }));
            debug!(station_id = %self.station_id, host = %self.host, "configured mutual-TLS transport");
        }

        Ok(options)
    }
}

fn read_credential(path: &Path) -> Result<Vec<u8>, StationError> {
    fs::read(path).map_err(|source| StationError::Credentials {
        path: path.to_owned(),
        source,
    })
}

/// Top-level configuration for a connection manager: one entry per station.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

impl ManagerConfig {
    /// Loads a manager configuration from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StationError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| StationError::Config(format!("read {}: {e}", path.display())))?;
        let config: ManagerConfig = toml::from_str(&raw)
            .map_err(|e| StationError::Config(format!("parse {}: {e}", path.display())))?;
        debug!(path = %path.display(), stations = config.stations.len(), "loaded manager configuration");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_station(id: &str) -> StationConfig {
        StationConfig {
            station_id: id.to_owned(),
            client_identity: format!("client-{id}"),
            host: "127.0.0.1".to_owned(),
            port: 1883,
            protocol: TransportProtocol::Mqtt,
            key_file: None,
            cert_file: None,
            ca_file: None,
            reconnect_ms: 5000,
            keep_alive_secs: 5,
        }
    }

    #[test]
    fn defaults_are_applied_from_toml() {
        let config: StationConfig = toml::from_str(
            r#"
            station_id = "station-1"
            client_identity = "bridge-station-1"
            host = "broker.example.com"
            key_file = "/etc/stationlink/station-1.key"
            cert_file = "/etc/stationlink/station-1.pem"
            ca_file = "/etc/stationlink/ca.pem"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8883);
        assert_eq!(config.protocol, TransportProtocol::Mqtts);
        assert_eq!(config.reconnect_ms, 5000);
    }

    #[test]
    fn tls_station_without_credentials_is_rejected() {
        let mut config = tcp_station("station-1");
        config.protocol = TransportProtocol::Mqtts;
        assert!(matches!(
            config.mqtt_options(),
            Err(StationError::MissingCredentials(_))
        ));
    }

    #[test]
    fn tcp_station_builds_options_without_credentials() {
        let options = tcp_station("station-1").mqtt_options().unwrap();
        assert_eq!(options.broker_address(), ("127.0.0.1".to_owned(), 1883));
    }
}
