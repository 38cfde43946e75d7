/// Configuration sections, each defined once with its defaults
use crate::config_struct;

// ============================================================================
// CONNECTION
// ============================================================================

config_struct! {
    /// Socket and authentication timeouts
    pub struct ConnectionConfig {
        /// Time allowed for the socket to open
        connect_timeout_ms: u64 = 10_000,

        /// Time allowed for the authentication acknowledgement
        auth_timeout_ms: u64 = 10_000,
    }
}

// ============================================================================
// RECONNECT
// ============================================================================

config_struct! {
    /// Reconnection policy applied after an unexpected socket close
    pub struct ReconnectConfig {
        enabled: bool = true,

        /// Delay before the first reattempt
        initial_delay_ms: u64 = 1_000,

        /// Backoff ceiling
        max_delay_ms: u64 = 30_000,

        /// Growth factor between consecutive attempts
        multiplier: f64 = 2.0,

        /// Attempts per reconnection cycle before giving up
        max_attempts: u32 = 10,
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

config_struct! {
    /// Command/response defaults
    pub struct CommandsConfig {
        default_timeout_ms: u64 = 10_000,
        ping_timeout_ms: u64 = 5_000,
    }
}

// ============================================================================
// TELEMETRY
// ============================================================================

config_struct! {
    /// Telemetry topics and pull commands
    pub struct TelemetryConfig {
        /// Topics are `<prefix>/<serial>/<kind>`
        topic_prefix: String = "sensor".to_string(),

        vibration_command: String = "take_dynamic_reading".to_string(),
        temperature_command: String = "take_dynamic_temperature".to_string(),
        battery_command: String = "take_dynamic_battery".to_string(),

        /// Vibration captures take several seconds on the sensor side
        reading_timeout_ms: u64 = 30_000,
    }
}

// ============================================================================
// DISCOVERY
// ============================================================================

config_struct! {
    /// Sensor discovery workflow
    pub struct DiscoveryConfig {
        command: String = "discover_sensors".to_string(),
        timeout_ms: u64 = 60_000,
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

config_struct! {
    /// External REST API that stores gateways, equipment and sensors
    pub struct PersistenceConfig {
        base_url: String = "http://localhost:3000/api".to_string(),
        request_timeout_secs: u64 = 15,
    }
}

// ============================================================================
// ROOT
// ============================================================================

config_struct! {
    /// Root configuration
    pub struct Config {
        connection: ConnectionConfig = ConnectionConfig::default(),
        reconnect: ReconnectConfig = ReconnectConfig::default(),
        commands: CommandsConfig = CommandsConfig::default(),
        telemetry: TelemetryConfig = TelemetryConfig::default(),
        discovery: DiscoveryConfig = DiscoveryConfig::default(),
        persistence: PersistenceConfig = PersistenceConfig::default(),
    }
}

impl Config {
    /// Keys accepted under each top-level section
    pub fn section_fields(section: &str) -> Option<&'static [&'static str]> {
        match section {
            "connection" => Some(ConnectionConfig::FIELD_NAMES),
            "reconnect" => Some(ReconnectConfig::FIELD_NAMES),
            "commands" => Some(CommandsConfig::FIELD_NAMES),
            "telemetry" => Some(TelemetryConfig::FIELD_NAMES),
            "discovery" => Some(DiscoveryConfig::FIELD_NAMES),
            "persistence" => Some(PersistenceConfig::FIELD_NAMES),
            _ => None,
        }
    }
}
