//! Registry of station connections with bulk and single-station operations.
//!
//! The manager owns one [`StationConnection`] per station id and a single
//! aggregated event sink every station reports into. Bulk operations
//! isolate per-station failures: one station failing is logged and
//! swallowed so the rest still complete; callers that care about
//! per-station outcomes listen for [`StationEvent::Error`] on the sink.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{ManagerConfig, StationConfig};
use crate::error::StationError;
use crate::event::{Payload, SharedCallback, StationEvent, StationId};
use crate::station::{PublishOptions, StationConnection};

const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Multi-station connection manager.
///
/// Construct one explicitly and pass it to collaborators; there is no
/// process-wide default instance.
pub struct ConnectionManager {
    stations: HashMap<StationId, StationConnection>,
    events: mpsc::Sender<StationEvent>,
}

impl ConnectionManager {
    /// Creates an empty manager and hands back the receiving end of its
    /// aggregated event sink.
    pub fn new() -> (Self, mpsc::Receiver<StationEvent>) {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(event_capacity: usize) -> (Self, mpsc::Receiver<StationEvent>) {
        let (events, events_rx) = mpsc::channel(event_capacity);
        (
            Self {
                stations: HashMap::new(),
                events,
            },
            events_rx,
        )
    }

    /// Builds a manager with every station from a loaded configuration.
    pub fn from_config(
        config: &ManagerConfig,
    ) -> Result<(Self, mpsc::Receiver<StationEvent>), StationError> {
        let (mut manager, events_rx) = Self::new();
        for station in &config.stations {
            manager.add_station(station.clone())?;
        }
        Ok((manager, events_rx))
    }

    /// Registers a station and opens its transport session. A duplicate id
    /// is a no-op: the existing connection is kept, never replaced.
    pub fn add_station(&mut self, config: StationConfig) -> Result<(), StationError> {
        if self.stations.contains_key(&config.station_id) {
            warn!(
                station_id = %config.station_id,
                "station already registered, keeping existing connection"
            );
            return Ok(());
        }
        let station = StationConnection::new(config, self.events.clone())?;
        info!(station_id = %station.station_id(), "station added");
        self.stations
            .insert(station.station_id().to_owned(), station);
        Ok(())
    }

    /// Forces a non-graceful disconnect and drops the station. Unknown ids
    /// are logged and ignored.
    pub fn remove_station(&mut self, station_id: &str) {
        match self.stations.remove(station_id) {
            Some(station) => {
                station.shutdown();
                info!(station_id, "station removed");
            }
            None => warn!(station_id, "cannot remove unknown station"),
        }
    }

    pub fn contains_station(&self, station_id: &str) -> bool {
        self.stations.contains_key(station_id)
    }

    pub fn station_ids(&self) -> Vec<StationId> {
        self.stations.keys().cloned().collect()
    }

    pub fn station(&self, station_id: &str) -> Option<&StationConnection> {
        self.stations.get(station_id)
    }

    fn station_required(&self, station_id: &str) -> Result<&StationConnection, StationError> {
        self.stations
            .get(station_id)
            .ok_or_else(|| StationError::NotFound(station_id.to_owned()))
    }

    /// Connects one station, rejecting when the id is unknown.
    pub async fn connect(&self, station_id: &str) -> Result<(), StationError> {
        self.station_required(station_id)?.connect().await
    }

    /// Connects every station in parallel. Individual failures are logged
    /// and swallowed; the call resolves once every attempt has settled.
    pub async fn connect_all(&self) {
        let attempts = self.stations.values().map(|station| async move {
            (station.station_id().to_owned(), station.connect().await)
        });
        for (station_id, result) in join_all(attempts).await {
            if let Err(err) = result {
                warn!(%station_id, %err, "station connect failed");
            }
        }
    }

    /// Disconnects one station; a no-op for unknown ids.
    pub async fn disconnect(&self, station_id: &str) {
        match self.stations.get(station_id) {
            Some(station) => station.disconnect().await,
            None => warn!(station_id, "cannot disconnect unknown station"),
        }
    }

    pub async fn disconnect_all(&self) {
        for station in self.stations.values() {
            station.disconnect().await;
        }
    }

    /// Registers a callback on one station, or on every managed station
    /// when no id is given.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: SharedCallback,
        station_id: Option<&str>,
    ) -> Result<(), StationError> {
        match station_id {
            Some(station_id) => {
                self.station_required(station_id)?
                    .subscribe(topic, callback)
                    .await
            }
            None => {
                for station in self.stations.values() {
                    if let Err(err) = station.subscribe(topic, Arc::clone(&callback)).await {
                        warn!(station_id = %station.station_id(), topic, %err, "subscribe failed");
                    }
                }
                Ok(())
            }
        }
    }

    /// Removes a callback (or a whole topic when no callback is given) on
    /// one station or on all of them.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        callback: Option<&SharedCallback>,
        station_id: Option<&str>,
    ) -> Result<(), StationError> {
        match station_id {
            Some(station_id) => {
                self.station_required(station_id)?
                    .unsubscribe(topic, callback)
                    .await
            }
            None => {
                for station in self.stations.values() {
                    if let Err(err) = station.unsubscribe(topic, callback).await {
                        warn!(station_id = %station.station_id(), topic, %err, "unsubscribe failed");
                    }
                }
                Ok(())
            }
        }
    }

    /// Publishes to one station (propagating its failure) or broadcasts to
    /// every station, logging individual failures and resolving once all
    /// attempts have settled.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
        station_id: Option<&str>,
    ) -> Result<(), StationError> {
        match station_id {
            Some(station_id) => {
                self.station_required(station_id)?
                    .publish(topic, payload, options)
                    .await
            }
            None => {
                let attempts = self.stations.values().map(|station| {
                    let payload = payload.clone();
                    async move {
                        (
                            station.station_id().to_owned(),
                            station.publish(topic, payload, options).await,
                        )
                    }
                });
                for (station_id, result) in join_all(attempts).await {
                    if let Err(err) = result {
                        warn!(%station_id, topic, %err, "publish failed");
                    }
                }
                Ok(())
            }
        }
    }

    /// Per-station map of apparent device ids, scoped to one station when
    /// an id is given.
    pub fn connected_devices(
        &self,
        station_id: Option<&str>,
    ) -> Result<HashMap<StationId, HashSet<String>>, StationError> {
        match station_id {
            Some(station_id) => {
                let station = self.station_required(station_id)?;
                Ok(HashMap::from([(
                    station_id.to_owned(),
                    station.connected_devices(),
                )]))
            }
            None => Ok(self
                .stations
                .iter()
                .map(|(station_id, station)| (station_id.clone(), station.connected_devices()))
                .collect()),
        }
    }
}
