/// Telemetry cache keyed by (gateway, sensor serial)
///
/// Readings are immutable `Arc` snapshots replaced wholesale, so readers
/// never block writers for longer than a map insert. Two ways in:
/// - passive: `track` subscribes to `<prefix>/<serial>/<kind>` pushes
/// - active: `take_dynamic_*` send a command and store the result
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::readings::{
    parse_payload, BatteryPayload, BatteryReading, ReadingSource, SensorSerial, TelemetryKind,
    TemperaturePayload, TemperatureReading, VibrationPayload, VibrationReading,
};
use super::spectrum::{axis_spectrum, MagnitudeSpectrum, SpectrumTransform};
use crate::config::TelemetryConfig;
use crate::errors::{GatewayError, ValidationError};
use crate::gateway::{GatewayConnection, GatewayId, JsonValidator};
use crate::logger::{self, LogTag};

type Key = (GatewayId, SensorSerial);

/// Topic layout and pull commands
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    pub topic_prefix: String,
    pub vibration_command: String,
    pub temperature_command: String,
    pub battery_command: String,
    pub reading_timeout: Duration,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}

impl TelemetrySettings {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            topic_prefix: config.topic_prefix.clone(),
            vibration_command: config.vibration_command.clone(),
            temperature_command: config.temperature_command.clone(),
            battery_command: config.battery_command.clone(),
            reading_timeout: Duration::from_millis(config.reading_timeout_ms),
        }
    }

    pub fn topic(&self, serial: SensorSerial, kind: TelemetryKind) -> String {
        format!("{}/{}/{}", self.topic_prefix, serial, kind.as_str())
    }

    pub fn command(&self, kind: TelemetryKind) -> &str {
        match kind {
            TelemetryKind::Vibration => &self.vibration_command,
            TelemetryKind::Temperature => &self.temperature_command,
            TelemetryKind::Battery => &self.battery_command,
        }
    }
}

pub struct TelemetryStore {
    vibration: RwLock<HashMap<Key, Arc<VibrationReading>>>,
    temperature: RwLock<HashMap<Key, Arc<TemperatureReading>>>,
    battery: RwLock<HashMap<Key, Arc<BatteryReading>>>,
    spectrum: Arc<dyn SpectrumTransform>,
    settings: TelemetrySettings,
}

impl TelemetryStore {
    pub fn new(settings: TelemetrySettings) -> Self {
        Self::with_spectrum(settings, Arc::new(MagnitudeSpectrum))
    }

    pub fn with_spectrum(settings: TelemetrySettings, spectrum: Arc<dyn SpectrumTransform>) -> Self {
        Self {
            vibration: RwLock::new(HashMap::new()),
            temperature: RwLock::new(HashMap::new()),
            battery: RwLock::new(HashMap::new()),
            spectrum,
            settings,
        }
    }

    pub fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn vibration(&self, gateway: &GatewayId, serial: SensorSerial) -> Option<Arc<VibrationReading>> {
        self.vibration.read().get(&(gateway.clone(), serial)).cloned()
    }

    pub fn temperature(&self, gateway: &GatewayId, serial: SensorSerial) -> Option<Arc<TemperatureReading>> {
        self.temperature.read().get(&(gateway.clone(), serial)).cloned()
    }

    pub fn battery(&self, gateway: &GatewayId, serial: SensorSerial) -> Option<Arc<BatteryReading>> {
        self.battery.read().get(&(gateway.clone(), serial)).cloned()
    }

    /// Serials with any cached reading on this gateway, ascending
    pub fn sensors(&self, gateway: &GatewayId) -> Vec<SensorSerial> {
        let mut serials = BTreeSet::new();
        serials.extend(self.vibration.read().keys().filter(|(g, _)| g == gateway).map(|(_, s)| *s));
        serials.extend(self.temperature.read().keys().filter(|(g, _)| g == gateway).map(|(_, s)| *s));
        serials.extend(self.battery.read().keys().filter(|(g, _)| g == gateway).map(|(_, s)| *s));
        serials.into_iter().collect()
    }

    pub fn clear_gateway(&self, gateway: &GatewayId) {
        self.vibration.write().retain(|(g, _), _| g != gateway);
        self.temperature.write().retain(|(g, _), _| g != gateway);
        self.battery.write().retain(|(g, _), _| g != gateway);
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    pub fn store_vibration(
        &self,
        gateway: &GatewayId,
        serial: SensorSerial,
        payload: VibrationPayload,
        source: ReadingSource,
    ) -> Result<Arc<VibrationReading>, ValidationError> {
        let (samples, sample_rate_hz, captured_at) = payload.validate(serial)?;
        let spectrum = axis_spectrum(self.spectrum.as_ref(), &samples);
        let reading = Arc::new(VibrationReading {
            serial,
            samples,
            spectrum,
            sample_rate_hz,
            captured_at,
            source,
        });
        self.vibration
            .write()
            .insert((gateway.clone(), serial), reading.clone());
        logger::debug(
            LogTag::Telemetry,
            &format!(
                "Gateway {}: vibration for sensor {} ({} samples @ {} Hz, {:?})",
                gateway,
                serial,
                reading.samples.x.len(),
                sample_rate_hz,
                source
            ),
        );
        Ok(reading)
    }

    pub fn store_temperature(
        &self,
        gateway: &GatewayId,
        serial: SensorSerial,
        payload: TemperaturePayload,
        source: ReadingSource,
    ) -> Result<Arc<TemperatureReading>, ValidationError> {
        let reading = Arc::new(payload.into_reading(serial, source)?);
        self.temperature
            .write()
            .insert((gateway.clone(), serial), reading.clone());
        logger::debug(
            LogTag::Telemetry,
            &format!(
                "Gateway {}: sensor {} at {:.1}°C ({:?})",
                gateway, serial, reading.celsius, source
            ),
        );
        Ok(reading)
    }

    pub fn store_battery(
        &self,
        gateway: &GatewayId,
        serial: SensorSerial,
        payload: BatteryPayload,
        source: ReadingSource,
    ) -> Result<Arc<BatteryReading>, ValidationError> {
        let reading = Arc::new(payload.into_reading(serial, source)?);
        self.battery
            .write()
            .insert((gateway.clone(), serial), reading.clone());
        logger::debug(
            LogTag::Telemetry,
            &format!(
                "Gateway {}: sensor {} battery {:.0}% ({:?})",
                gateway, serial, reading.percent, source
            ),
        );
        Ok(reading)
    }

    /// Decode and store a raw payload of the given kind
    pub fn ingest(
        &self,
        gateway: &GatewayId,
        serial: SensorSerial,
        kind: TelemetryKind,
        payload: &Value,
        source: ReadingSource,
    ) -> Result<(), ValidationError> {
        match kind {
            TelemetryKind::Vibration => self
                .store_vibration(gateway, serial, parse_payload(serial, payload)?, source)
                .map(|_| ()),
            TelemetryKind::Temperature => self
                .store_temperature(gateway, serial, parse_payload(serial, payload)?, source)
                .map(|_| ()),
            TelemetryKind::Battery => self
                .store_battery(gateway, serial, parse_payload(serial, payload)?, source)
                .map(|_| ()),
        }
    }

    // ========================================================================
    // ACTIVE PATH
    // ========================================================================

    async fn pull(&self, conn: &GatewayConnection, serial: SensorSerial, kind: TelemetryKind) -> Result<Value, GatewayError> {
        logger::debug(
            LogTag::Telemetry,
            &format!("Gateway {}: requesting {} from sensor {}", conn.id(), kind.as_str(), serial),
        );
        conn.send_command_with_timeout(
            self.settings.command(kind),
            json!({ "serial": serial }),
            self.settings.reading_timeout,
        )
        .await
    }

    pub async fn take_dynamic_reading(
        &self,
        conn: &GatewayConnection,
        serial: SensorSerial,
    ) -> Result<Arc<VibrationReading>, GatewayError> {
        let result = self.pull(conn, serial, TelemetryKind::Vibration).await?;
        let payload = parse_payload(serial, &result)?;
        Ok(self.store_vibration(conn.id(), serial, payload, ReadingSource::Pull)?)
    }

    pub async fn take_dynamic_temperature(
        &self,
        conn: &GatewayConnection,
        serial: SensorSerial,
    ) -> Result<Arc<TemperatureReading>, GatewayError> {
        let result = self.pull(conn, serial, TelemetryKind::Temperature).await?;
        let payload = parse_payload(serial, &result)?;
        Ok(self.store_temperature(conn.id(), serial, payload, ReadingSource::Pull)?)
    }

    pub async fn take_dynamic_battery(
        &self,
        conn: &GatewayConnection,
        serial: SensorSerial,
    ) -> Result<Arc<BatteryReading>, GatewayError> {
        let result = self.pull(conn, serial, TelemetryKind::Battery).await?;
        let payload = parse_payload(serial, &result)?;
        Ok(self.store_battery(conn.id(), serial, payload, ReadingSource::Pull)?)
    }

    // ========================================================================
    // PASSIVE PATH
    // ========================================================================

    /// Follow pushes for `serials` on this connection until the tracker is dropped
    ///
    /// Subscriptions are made once the connection is authenticated and stay
    /// registered across reconnects.
    pub fn track(self: &Arc<Self>, conn: &GatewayConnection, serials: &[SensorSerial]) -> TelemetryTracker {
        let mut tasks = JoinSet::new();
        for &serial in serials {
            for kind in TelemetryKind::ALL {
                let (store, conn) = (self.clone(), conn.clone());
                tasks.spawn(async move {
                    let gateway = conn.id().clone();
                    let outcome = follow(store, conn, serial, kind).await;
                    if let Err(e) = &outcome {
                        logger::warning(
                            LogTag::Telemetry,
                            &format!(
                                "Gateway {}: stopped following {} of sensor {}: {}",
                                gateway,
                                kind.as_str(),
                                serial,
                                e
                            ),
                        );
                    }
                    outcome
                });
            }
        }
        logger::info(
            LogTag::Telemetry,
            &format!("Gateway {}: tracking {} sensor(s)", conn.id(), serials.len()),
        );
        TelemetryTracker { tasks }
    }
}

async fn follow(
    store: Arc<TelemetryStore>,
    conn: GatewayConnection,
    serial: SensorSerial,
    kind: TelemetryKind,
) -> Result<(), GatewayError> {
    conn.wait_until_authenticated().await?;

    let topic = store.settings.topic(serial, kind);
    let gateway = conn.id().clone();

    match kind {
        TelemetryKind::Vibration => {
            let mut sub = conn.subscribe_json::<VibrationPayload>(&topic).await?;
            while let Some(delivery) = sub.recv().await {
                let stored = delivery.and_then(|event| {
                    store
                        .store_vibration(&gateway, serial, event.payload, ReadingSource::Push)
                        .map(|_| ())
                });
                report_rejected(&gateway, &topic, stored);
            }
        }
        TelemetryKind::Temperature => {
            let mut sub = conn
                .subscribe_with(&topic, JsonValidator::<TemperaturePayload>::new())
                .await?;
            while let Some(delivery) = sub.recv().await {
                let stored = delivery.and_then(|event| {
                    store
                        .store_temperature(&gateway, serial, event.payload, ReadingSource::Push)
                        .map(|_| ())
                });
                report_rejected(&gateway, &topic, stored);
            }
        }
        TelemetryKind::Battery => {
            let mut sub = conn
                .subscribe_with(&topic, JsonValidator::<BatteryPayload>::new())
                .await?;
            while let Some(delivery) = sub.recv().await {
                let stored = delivery.and_then(|event| {
                    store
                        .store_battery(&gateway, serial, event.payload, ReadingSource::Push)
                        .map(|_| ())
                });
                report_rejected(&gateway, &topic, stored);
            }
        }
    }

    logger::debug(
        LogTag::Telemetry,
        &format!("Gateway {}: stream '{}' ended", gateway, topic),
    );
    Ok(())
}

fn report_rejected(gateway: &GatewayId, topic: &str, outcome: Result<(), ValidationError>) {
    if let Err(e) = outcome {
        logger::warning(
            LogTag::Telemetry,
            &format!("Gateway {}: rejected push on '{}': {}", gateway, topic, e),
        );
    }
}

/// Background subscriptions started by `TelemetryStore::track`; dropping it stops them
pub struct TelemetryTracker {
    tasks: JoinSet<Result<(), GatewayError>>,
}

impl TelemetryTracker {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next follower to stop on an error; None once none is left running
    pub async fn next_failure(&mut self) -> Option<GatewayError> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Some(e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    logger::error(LogTag::Telemetry, &format!("Telemetry follower panicked: {}", e));
                }
            }
        }
        None
    }

    pub fn stop(mut self) {
        self.tasks.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::simulator::{SimulatedGateway, SimulatorOptions};
    use crate::gateway::{ConnectionOptions, Credentials, GatewayIdentity};
    use std::time::Instant;

    fn gw() -> GatewayId {
        GatewayId::from("gw-1")
    }

    async fn connected(gateway: &SimulatedGateway) -> GatewayConnection {
        let identity = GatewayIdentity::new("gw-1", "memory://gw-1", Credentials::new("admin", "secret"));
        let conn = GatewayConnection::spawn(identity, Arc::new(gateway.connector()), ConnectionOptions::default());
        conn.connect().await.unwrap();
        conn
    }

    #[test]
    fn test_reads_miss_then_hit() {
        let store = TelemetryStore::new(TelemetrySettings::default());
        assert!(store.temperature(&gw(), 1001).is_none());

        store
            .ingest(&gw(), 1001, TelemetryKind::Temperature, &json!({"temperature": 19.5}), ReadingSource::Push)
            .unwrap();
        let reading = store.temperature(&gw(), 1001).unwrap();
        assert_eq!(reading.celsius, 19.5);
        assert!(store.temperature(&GatewayId::from("gw-2"), 1001).is_none());
        assert!(store.battery(&gw(), 1001).is_none());
    }

    #[test]
    fn test_snapshots_are_replaced_not_mutated() {
        let store = TelemetryStore::new(TelemetrySettings::default());
        store
            .ingest(&gw(), 5, TelemetryKind::Battery, &json!({"battery": 80}), ReadingSource::Push)
            .unwrap();
        let before = store.battery(&gw(), 5).unwrap();
        store
            .ingest(&gw(), 5, TelemetryKind::Battery, &json!({"battery": 79}), ReadingSource::Push)
            .unwrap();

        assert_eq!(before.percent, 80.0);
        assert_eq!(store.battery(&gw(), 5).unwrap().percent, 79.0);
    }

    #[test]
    fn test_invalid_payload_keeps_previous_reading() {
        let store = TelemetryStore::new(TelemetrySettings::default());
        store
            .ingest(&gw(), 5, TelemetryKind::Temperature, &json!({"temperature": 20.0}), ReadingSource::Push)
            .unwrap();
        assert!(store
            .ingest(&gw(), 5, TelemetryKind::Temperature, &json!({"temperature": "warm"}), ReadingSource::Push)
            .is_err());
        assert_eq!(store.temperature(&gw(), 5).unwrap().celsius, 20.0);
    }

    #[test]
    fn test_sensors_and_clear() {
        let store = TelemetryStore::new(TelemetrySettings::default());
        store
            .ingest(&gw(), 9, TelemetryKind::Battery, &json!({"battery": 50}), ReadingSource::Push)
            .unwrap();
        store
            .ingest(&gw(), 3, TelemetryKind::Temperature, &json!({"temperature": 1}), ReadingSource::Push)
            .unwrap();
        store
            .ingest(&GatewayId::from("gw-2"), 4, TelemetryKind::Battery, &json!({"battery": 50}), ReadingSource::Push)
            .unwrap();

        assert_eq!(store.sensors(&gw()), vec![3, 9]);
        store.clear_gateway(&gw());
        assert!(store.sensors(&gw()).is_empty());
        assert_eq!(store.sensors(&GatewayId::from("gw-2")), vec![4]);
    }

    #[test]
    fn test_topics_follow_settings() {
        let settings = TelemetrySettings {
            topic_prefix: "devices".to_string(),
            ..TelemetrySettings::default()
        };
        assert_eq!(settings.topic(1001, TelemetryKind::Vibration), "devices/1001/vibration");
        assert_eq!(settings.command(TelemetryKind::Battery), "take_dynamic_battery");
    }

    #[tokio::test]
    async fn test_active_readings_are_stored() {
        let gateway = SimulatedGateway::start(SimulatorOptions::default());
        let conn = connected(&gateway).await;
        let store = TelemetryStore::new(TelemetrySettings::default());

        let vibration = store.take_dynamic_reading(&conn, 1002).await.unwrap();
        assert_eq!(vibration.source, ReadingSource::Pull);
        assert_eq!(vibration.samples.x.len(), 64);
        assert_eq!(vibration.spectrum.x.len(), 32);
        assert_eq!(store.vibration(&gw(), 1002).unwrap().serial, 1002);

        let temperature = store.take_dynamic_temperature(&conn, 1001).await.unwrap();
        assert!((temperature.celsius - 25.0).abs() <= 0.5);

        let battery = store.take_dynamic_battery(&conn, 1003).await.unwrap();
        assert_eq!(battery.percent, 90.0 - (1003 % 7) as f64);

        let err = store.take_dynamic_battery(&conn, 77).await.unwrap_err();
        assert!(matches!(err, GatewayError::Command { .. }));
        assert!(store.battery(&gw(), 77).is_none());
    }

    #[tokio::test]
    async fn test_track_waits_for_authentication_then_follows_pushes() {
        let gateway = SimulatedGateway::start(SimulatorOptions {
            push_interval: Some(Duration::from_millis(20)),
            ..SimulatorOptions::default()
        });
        let identity = GatewayIdentity::new("gw-1", "memory://gw-1", Credentials::new("admin", "secret"));
        let conn = GatewayConnection::spawn(identity, Arc::new(gateway.connector()), ConnectionOptions::default());
        let store = Arc::new(TelemetryStore::new(TelemetrySettings::default()));

        let tracker = store.track(&conn, &[1001, 1002]);
        assert_eq!(tracker.len(), 6);
        conn.connect().await.unwrap();

        let started = Instant::now();
        while store.sensors(&gw()).len() < 2
            || store.vibration(&gw(), 1002).is_none()
            || store.battery(&gw(), 1001).is_none()
        {
            assert!(started.elapsed() < Duration::from_secs(3), "pushes never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.temperature(&gw(), 1001).unwrap().source, ReadingSource::Push);
        assert!(store.temperature(&gw(), 1003).is_none());
        tracker.stop();
    }

    #[tokio::test]
    async fn test_tracker_reports_followers_that_stop() {
        let gateway = SimulatedGateway::start(SimulatorOptions::default());
        let identity = GatewayIdentity::new("gw-1", "memory://gw-1", Credentials::new("admin", "secret"));
        let conn = GatewayConnection::spawn(identity, Arc::new(gateway.connector()), ConnectionOptions::default());
        let store = Arc::new(TelemetryStore::new(TelemetrySettings::default()));

        let mut tracker = store.track(&conn, &[1001]);
        assert_eq!(tracker.len(), 3);
        conn.shutdown().await;

        let failure = tokio::time::timeout(Duration::from_secs(2), tracker.next_failure())
            .await
            .unwrap();
        assert_eq!(failure, Some(GatewayError::ConnectionClosed));
        assert_eq!(tracker.next_failure().await, Some(GatewayError::ConnectionClosed));
        assert_eq!(tracker.next_failure().await, Some(GatewayError::ConnectionClosed));
        assert_eq!(tracker.next_failure().await, None);
        assert!(tracker.is_empty());
    }
}
