//! Error types for the station connection subsystem.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by station connections and the connection manager.
#[derive(Debug, Error)]
pub enum StationError {
    /// An operation addressed a station id that is not registered.
    #[error("unknown station: {0}")]
    NotFound(String),

    /// The caller-side wait for a connection exceeded the fixed window.
    /// The underlying connect attempt keeps running.
    #[error("connect wait timed out after {}s", .0.as_secs())]
    ConnectTimeout(Duration),

    /// The transport reported an error while a connect wait was pending.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The station has no active transport session.
    #[error("station is disconnected")]
    Disconnected,

    /// A broker-level request (publish/subscribe/unsubscribe) failed.
    #[error("transport request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// A credential file could not be read.
    #[error("could not read credential file {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A TLS station is missing one of its credential file paths.
    #[error("station {0} uses TLS but is missing credential paths")]
    MissingCredentials(String),

    /// An outbound payload could not be encoded to its wire form.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Reading or parsing a configuration file failed.
    #[error("configuration error: {0}")]
    Config(String),
}
