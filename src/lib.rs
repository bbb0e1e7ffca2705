//! # stationlink
//!
//! Multi-station MQTT connection manager: bridges a backend to many
//! independently-secured field devices ("stations") over persistent
//! publish/subscribe sessions, so telemetry can stream in and commands can
//! be pushed out per station.
//!
//! ## Module Architecture
//!
//! ```text
//! src/
//! ├── config.rs   - per-station connection parameters and TOML loading
//! ├── topic.rs    - wildcard topic matching and topic-derived helpers
//! ├── event.rs    - tagged station events, message envelopes, callbacks
//! ├── station.rs  - one connection: state machine + subscription registry
//! ├── manager.rs  - station registry, bulk operations, aggregated events
//! └── error.rs    - error taxonomy
//! ```
//!
//! ## Design Notes
//!
//! - One [`StationConnection`] per station, each with its own TLS identity;
//!   a station's failure never affects its siblings.
//! - The subscription registry outlives transport sessions: disconnects
//!   never prune it, and every successful (re)connect replays each distinct
//!   topic to the broker.
//! - All stations report into one aggregated event sink as tagged
//!   [`StationEvent`] variants; consumers receive them through a single
//!   channel instead of string-keyed listeners.
//! - Persistence and interpretation of delivered telemetry belong to the
//!   caller; this crate only guarantees delivery of structured events to
//!   registered handlers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stationlink::{callback, ConnectionManager, ManagerConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), stationlink::StationError> {
//! let config = ManagerConfig::from_path("stations.toml")?;
//! let (manager, mut events) = ConnectionManager::from_config(&config)?;
//!
//! manager
//!     .subscribe(
//!         "devices/+/data",
//!         callback(|envelope| {
//!             println!("telemetry from {}", envelope.station_id);
//!             Ok(())
//!         }),
//!         None,
//!     )
//!     .await?;
//! manager.connect_all().await;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod station;
pub mod topic;

pub use config::{ManagerConfig, StationConfig, TransportProtocol};
pub use error::StationError;
pub use event::{
    callback, CallbackResult, MessageEnvelope, Payload, SharedCallback, StationEvent, StationId,
};
pub use manager::ConnectionManager;
pub use station::{ConnectionState, PublishOptions, StationConnection, CONNECT_TIMEOUT};
pub use topic::{device_id_from_topic, topic_matches};
