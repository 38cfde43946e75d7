/// Stages, step statuses and the sensor records a discovery run works with
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::persistence::SensorAssociation;
use crate::telemetry::{coerce_serial, SensorSerial};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryStage {
    Connect,
    Discover,
    Associate,
    Confirm,
}

impl DiscoveryStage {
    pub const ALL: [DiscoveryStage; 4] = [
        DiscoveryStage::Connect,
        DiscoveryStage::Discover,
        DiscoveryStage::Associate,
        DiscoveryStage::Confirm,
    ];

    pub fn index(&self) -> usize {
        match self {
            DiscoveryStage::Connect => 0,
            DiscoveryStage::Discover => 1,
            DiscoveryStage::Associate => 2,
            DiscoveryStage::Confirm => 3,
        }
    }

    pub fn previous(&self) -> Option<DiscoveryStage> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStage::Connect => "CONNECT",
            DiscoveryStage::Discover => "DISCOVER",
            DiscoveryStage::Associate => "ASSOCIATE",
            DiscoveryStage::Confirm => "CONFIRM",
        }
    }
}

impl fmt::Display for DiscoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Navigation state of one stage, for gating a UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Locked,
    Available,
    Active,
    Completed,
}

// ============================================================================
// DISCOVERED SENSORS
// ============================================================================

/// Firmware reports some attributes as numbers, others as strings
fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected text, got {}", other))),
    }
}

fn deserialize_text_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!("expected text, got {}", other))),
    }
}

/// Sensor exactly as advertised by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSensor {
    /// Kept as text; a numeric serial is only required at association time
    #[serde(deserialize_with = "deserialize_text")]
    pub serial: String,
    #[serde(default, deserialize_with = "deserialize_text_opt")]
    pub part_number: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text_opt")]
    pub hardware_version: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text_opt")]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub access_point: Option<u32>,
    #[serde(default)]
    pub read_rate: Option<u32>,
    #[serde(default)]
    pub read_period: Option<u32>,
    #[serde(default)]
    pub samples: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_text_opt")]
    pub g_mode: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text_opt")]
    pub freq_mode: Option<String>,
    #[serde(default)]
    pub connected: bool,
}

impl RawSensor {
    /// Positive integer serial, if the advertised one is usable
    pub fn serial_number(&self) -> Option<SensorSerial> {
        coerce_serial(&Value::String(self.serial.clone())).filter(|serial| *serial > 0)
    }
}

/// A raw sensor plus the operator's choices for it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredSensor {
    pub raw: RawSensor,
    pub selected: bool,
    pub suggested_name: String,
    pub custom_name: Option<String>,
    /// Serial already registered in the persistence API
    pub duplicate: bool,
    pub existing_id: Option<String>,
    pub equipment_id: Option<String>,
}

impl DiscoveredSensor {
    pub fn new(raw: RawSensor, existing_id: Option<String>) -> Self {
        let suggested_name = match &raw.part_number {
            Some(part) if !part.trim().is_empty() => format!("{} {}", part.trim(), raw.serial),
            _ => format!("Sensor {}", raw.serial),
        };
        let duplicate = existing_id.is_some();

        Self {
            raw,
            selected: !duplicate,
            suggested_name,
            custom_name: None,
            duplicate,
            existing_id,
            equipment_id: None,
        }
    }

    pub fn serial(&self) -> &str {
        &self.raw.serial
    }

    /// Custom name when one was given, the suggestion otherwise
    pub fn display_name(&self) -> &str {
        match &self.custom_name {
            Some(name) if !name.trim().is_empty() => name.trim(),
            _ => &self.suggested_name,
        }
    }

    pub(crate) fn to_association(&self, serial: SensorSerial, equipment_id: &str, gateway_id: &str) -> SensorAssociation {
        SensorAssociation {
            serial,
            equipment_id: equipment_id.to_string(),
            name: self.display_name().to_string(),
            gateway_id: Some(gateway_id.to_string()),
            part_number: self.raw.part_number.clone(),
            hardware_version: self.raw.hardware_version.clone(),
            firmware_version: self.raw.firmware_version.clone(),
            access_point: self.raw.access_point,
            read_rate: self.raw.read_rate,
            read_period: self.raw.read_period,
            samples: self.raw.samples,
            g_mode: self.raw.g_mode.clone(),
            freq_mode: self.raw.freq_mode.clone(),
        }
    }
}

/// A selected sensor that could not become an association
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociationIssue {
    pub serial: String,
    pub message: String,
}

// ============================================================================
// CONFIRM REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmedSensor {
    pub serial: SensorSerial,
    pub equipment_id: String,
    /// Record id assigned by the persistence API
    pub sensor_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedAssociation {
    pub serial: SensorSerial,
    pub equipment_id: String,
    pub message: String,
}

/// Outcome of one CONFIRM submission
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfirmReport {
    pub succeeded: Vec<ConfirmedSensor>,
    pub failed: Vec<FailedAssociation>,
}

impl ConfirmReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
