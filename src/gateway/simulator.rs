/// In-process gateway speaking the wire protocol
///
/// Serves sessions opened through a `MemoryConnector`: answers
/// `authenticate`, `ping`, `discover_sensors` and the `take_dynamic_*`
/// commands from a fixed sensor list, and optionally pushes telemetry on
/// `<prefix>/<serial>/<kind>` topics at a fixed interval. Used by the tests
/// and by `--simulate`.
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Interval;

use super::codec::{self, CorrelationId, WireMessage};
use super::transport::{GatewaySession, MemoryConnector, TransportEvent};
use super::{AUTH_COMMAND, PING_COMMAND};
use crate::logger::{self, LogTag};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedSensor {
    pub serial: u64,
    pub part_number: String,
    pub hardware_version: String,
    pub firmware_version: String,
    pub access_point: u32,
    pub read_rate: u32,
    pub read_period: u32,
    pub samples: u32,
    pub g_mode: String,
    pub freq_mode: String,
    pub temperature: f64,
    pub battery: f64,
}

impl SimulatedSensor {
    pub fn new(serial: u64) -> Self {
        Self {
            serial,
            part_number: "VS-3X".to_string(),
            hardware_version: "2.1".to_string(),
            firmware_version: "4.0.7".to_string(),
            access_point: 1,
            read_rate: 3200,
            read_period: 3600,
            samples: 64,
            g_mode: "16g".to_string(),
            freq_mode: "high".to_string(),
            temperature: 24.0 + (serial % 10) as f64,
            battery: 90.0 - (serial % 7) as f64,
        }
    }

    fn discovery_record(&self) -> Value {
        json!({
            "serial": self.serial,
            "partNumber": self.part_number,
            "hardwareVersion": self.hardware_version,
            "firmwareVersion": self.firmware_version,
            "accessPoint": self.access_point,
            "readRate": self.read_rate,
            "readPeriod": self.read_period,
            "samples": self.samples,
            "gMode": self.g_mode,
            "freqMode": self.freq_mode,
            "connected": true,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    pub username: String,
    pub password: String,
    pub sensors: Vec<SimulatedSensor>,
    pub topic_prefix: String,
    /// Push telemetry for every sensor at this interval once authenticated
    pub push_interval: Option<Duration>,
    /// Delay applied before every response
    pub response_delay: Duration,
    /// Raw `discover_sensors` result replacing the one built from `sensors`
    pub discovery_result: Option<Value>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "secret".to_string(),
            sensors: vec![
                SimulatedSensor::new(1001),
                SimulatedSensor::new(1002),
                SimulatedSensor::new(1003),
            ],
            topic_prefix: "sensor".to_string(),
            push_interval: None,
            response_delay: Duration::ZERO,
            discovery_result: None,
        }
    }
}

// ============================================================================
// CONTROL
// ============================================================================

#[derive(Debug, Clone)]
enum ControlMessage {
    Drop(String),
    Push(WireMessage),
}

struct ControlInner {
    connector: MemoryConnector,
    sessions_opened: AtomicU64,
    active_sessions: AtomicUsize,
    control: broadcast::Sender<ControlMessage>,
    commands_seen: Mutex<Vec<String>>,
}

/// Test-side handle to misbehave on demand and inspect traffic
#[derive(Clone)]
pub struct SimulatorControl {
    inner: Arc<ControlInner>,
}

impl SimulatorControl {
    /// Close every live session from the gateway side
    pub fn drop_sessions(&self, reason: &str) {
        let _ = self.inner.control.send(ControlMessage::Drop(reason.to_string()));
    }

    /// Refuse new sockets (host unreachable)
    pub fn set_refusing(&self, refusing: bool) {
        self.inner.connector.set_refusing(refusing);
    }

    /// Push an event to every authenticated session
    pub fn push_event(&self, topic: &str, payload: Value) {
        let _ = self
            .inner
            .control
            .send(ControlMessage::Push(WireMessage::event(topic, payload)));
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::SeqCst)
    }

    /// Names of every command received, in arrival order
    pub fn commands_seen(&self) -> Vec<String> {
        self.inner.commands_seen.lock().clone()
    }
}

// ============================================================================
// GATEWAY
// ============================================================================

pub struct SimulatedGateway {
    control: SimulatorControl,
    acceptor: JoinHandle<()>,
}

impl SimulatedGateway {
    /// Start accepting sessions; must run inside a tokio runtime
    pub fn start(options: SimulatorOptions) -> Self {
        let (connector, mut sessions) = MemoryConnector::new();
        let (control_tx, _) = broadcast::channel(64);
        let control = SimulatorControl {
            inner: Arc::new(ControlInner {
                connector,
                sessions_opened: AtomicU64::new(0),
                active_sessions: AtomicUsize::new(0),
                control: control_tx,
                commands_seen: Mutex::new(Vec::new()),
            }),
        };

        let options = Arc::new(options);
        let acceptor_control = control.clone();
        let acceptor = tokio::spawn(async move {
            while let Some(session) = sessions.recv().await {
                let opened = acceptor_control.inner.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
                logger::debug(
                    LogTag::Simulator,
                    &format!("Session #{} opened for gateway {}", opened, session.gateway_id),
                );
                tokio::spawn(serve_session(
                    session,
                    opened,
                    options.clone(),
                    acceptor_control.clone(),
                ));
            }
        });

        Self { control, acceptor }
    }

    /// Connector whose sockets land on this gateway
    pub fn connector(&self) -> MemoryConnector {
        self.control.inner.connector.clone()
    }

    pub fn control(&self) -> SimulatorControl {
        self.control.clone()
    }
}

impl Drop for SimulatedGateway {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn serve_session(
    session: GatewaySession,
    number: u64,
    options: Arc<SimulatorOptions>,
    control: SimulatorControl,
) {
    let mut control_rx = control.inner.control.subscribe();
    let (sender, mut from_client) = session.split();
    let mut authenticated = false;
    let mut pushes = options.push_interval.map(tokio::time::interval);

    control.inner.active_sessions.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            frame = from_client.recv() => {
                let Some(frame) = frame else { break };
                let message = match codec::decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        logger::warning(LogTag::Simulator, &format!("Session #{}: bad frame: {}", number, e));
                        continue;
                    }
                };
                if let WireMessage::Command { id, name, payload } = message {
                    control.inner.commands_seen.lock().push(name.clone());
                    let reply = respond(&options, &mut authenticated, number, id, &name, &payload);
                    if !options.response_delay.is_zero() {
                        tokio::time::sleep(options.response_delay).await;
                    }
                    if !sender.send_message(&reply) {
                        break;
                    }
                }
            }
            msg = control_rx.recv() => match msg {
                Ok(ControlMessage::Drop(reason)) => {
                    logger::debug(LogTag::Simulator, &format!("Session #{} dropped: {}", number, reason));
                    sender.send_event(TransportEvent::Closed(Some(reason)));
                    break;
                }
                Ok(ControlMessage::Push(event)) => {
                    if authenticated {
                        sender.send_message(&event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tick(&mut pushes), if authenticated => {
                for event in telemetry_events(&options) {
                    if !sender.send_message(&event) {
                        break;
                    }
                }
            }
        }
    }

    control.inner.active_sessions.fetch_sub(1, Ordering::SeqCst);
    logger::debug(LogTag::Simulator, &format!("Session #{} closed", number));
}

// ============================================================================
// COMMANDS
// ============================================================================

fn respond(
    options: &SimulatorOptions,
    authenticated: &mut bool,
    session: u64,
    id: CorrelationId,
    name: &str,
    payload: &Value,
) -> WireMessage {
    if name == AUTH_COMMAND {
        let username = payload.get("username").and_then(Value::as_str);
        let password = payload.get("password").and_then(Value::as_str);
        if username == Some(options.username.as_str()) && password == Some(options.password.as_str()) {
            *authenticated = true;
            return WireMessage::response_ok(id, json!({"session": format!("sim-{}", session)}));
        }
        return WireMessage::response_err(id, Some("E_AUTH"), "invalid credentials");
    }

    if !*authenticated {
        return WireMessage::response_err(id, Some("E_UNAUTHENTICATED"), "authenticate first");
    }

    match name {
        PING_COMMAND => WireMessage::response_ok(id, json!({"pong": true})),
        "discover_sensors" => {
            let result = options.discovery_result.clone().unwrap_or_else(|| {
                Value::Array(options.sensors.iter().map(SimulatedSensor::discovery_record).collect())
            });
            WireMessage::response_ok(id, result)
        }
        "take_dynamic_reading" | "take_dynamic_temperature" | "take_dynamic_battery" => {
            let Some(sensor) = find_sensor(options, payload) else {
                return WireMessage::response_err(id, Some("E_SENSOR"), "sensor not found");
            };
            let result = match name {
                "take_dynamic_reading" => vibration_payload(sensor),
                "take_dynamic_temperature" => temperature_payload(sensor),
                _ => battery_payload(sensor),
            };
            WireMessage::response_ok(id, result)
        }
        other => WireMessage::response_err(
            id,
            Some("E_UNKNOWN_COMMAND"),
            format!("unknown command '{}'", other),
        ),
    }
}

fn find_sensor<'a>(options: &'a SimulatorOptions, payload: &Value) -> Option<&'a SimulatedSensor> {
    let serial = match payload.get("serial")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    options.sensors.iter().find(|s| s.serial == serial)
}

fn telemetry_events(options: &SimulatorOptions) -> Vec<WireMessage> {
    options
        .sensors
        .iter()
        .flat_map(|sensor| {
            let topic = |kind: &str| format!("{}/{}/{}", options.topic_prefix, sensor.serial, kind);
            vec![
                WireMessage::event(topic("temperature"), temperature_payload(sensor)),
                WireMessage::event(topic("battery"), battery_payload(sensor)),
                WireMessage::event(topic("vibration"), vibration_payload(sensor)),
            ]
        })
        .collect()
}

fn temperature_payload(sensor: &SimulatedSensor) -> Value {
    let jitter: f64 = rand::thread_rng().gen_range(-0.5..0.5);
    json!({
        "serial": sensor.serial,
        "temperature": ((sensor.temperature + jitter) * 10.0).round() / 10.0,
    })
}

fn battery_payload(sensor: &SimulatedSensor) -> Value {
    json!({
        "serial": sensor.serial,
        "battery": sensor.battery,
        "voltage": 2.8 + sensor.battery / 100.0,
    })
}

/// Three axes of a noisy sine at a sensor-specific frequency
fn vibration_payload(sensor: &SimulatedSensor) -> Value {
    let mut rng = rand::thread_rng();
    let samples = sensor.samples.max(8) as usize;
    let rate = sensor.read_rate as f64;
    let frequency = 50.0 + (sensor.serial % 5) as f64 * 25.0;

    let mut axis = |amplitude: f64| -> Vec<f64> {
        (0..samples)
            .map(|i| {
                let t = i as f64 / rate;
                amplitude * (2.0 * PI * frequency * t).sin() + rng.gen_range(-0.02..0.02)
            })
            .collect()
    };

    let x = axis(1.0);
    let y = axis(0.6);
    let z = axis(0.3);

    json!({
        "serial": sensor.serial,
        "sampleRate": rate,
        "x": x,
        "y": y,
        "z": z,
    })
}
