/// Sensor reading types and their wire payloads
///
/// Payloads arrive either as topic pushes or as command results. Both use
/// the same camelCase JSON; a few historical field names are accepted as
/// aliases. Serials may come as numbers or numeric strings.
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::ValidationError;

pub type SensorSerial = u64;

/// Parse a serial given as a JSON number or numeric string
pub fn coerce_serial(value: &Value) -> Option<SensorSerial> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn deserialize_serial_opt<'de, D>(deserializer: D) -> Result<Option<SensorSerial>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => coerce_serial(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid serial {}", value))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Vibration,
    Temperature,
    Battery,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 3] = [
        TelemetryKind::Vibration,
        TelemetryKind::Temperature,
        TelemetryKind::Battery,
    ];

    /// Last segment of the push topic
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Vibration => "vibration",
            TelemetryKind::Temperature => "temperature",
            TelemetryKind::Battery => "battery",
        }
    }
}

/// Whether a reading was pushed by the gateway or pulled with a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingSource {
    Push,
    Pull,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisSamples {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl AxisSamples {
    pub fn is_empty(&self) -> bool {
        self.x.is_empty() && self.y.is_empty() && self.z.is_empty()
    }

    /// Root mean square of each axis, (x, y, z)
    pub fn rms(&self) -> (f64, f64, f64) {
        (rms(&self.x), rms(&self.y), rms(&self.z))
    }
}

fn rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|v| v * v).sum::<f64>() / samples.len() as f64).sqrt()
}

// ============================================================================
// READINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VibrationReading {
    pub serial: SensorSerial,
    pub samples: AxisSamples,
    /// Per-axis magnitude spectrum of `samples`
    pub spectrum: AxisSamples,
    pub sample_rate_hz: f64,
    pub captured_at: DateTime<Utc>,
    pub source: ReadingSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub serial: SensorSerial,
    pub celsius: f64,
    pub captured_at: DateTime<Utc>,
    pub source: ReadingSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryReading {
    pub serial: SensorSerial,
    pub percent: f64,
    pub voltage: Option<f64>,
    pub captured_at: DateTime<Utc>,
    pub source: ReadingSource,
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VibrationPayload {
    #[serde(default, deserialize_with = "deserialize_serial_opt")]
    pub serial: Option<SensorSerial>,
    #[serde(alias = "sample_rate", alias = "rate")]
    pub sample_rate: f64,
    #[serde(default)]
    pub x: Vec<f64>,
    #[serde(default)]
    pub y: Vec<f64>,
    #[serde(default)]
    pub z: Vec<f64>,
    #[serde(default, alias = "capturedAt")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperaturePayload {
    #[serde(default, deserialize_with = "deserialize_serial_opt")]
    pub serial: Option<SensorSerial>,
    #[serde(alias = "celsius", alias = "value")]
    pub temperature: f64,
    #[serde(default, alias = "capturedAt")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryPayload {
    #[serde(default, deserialize_with = "deserialize_serial_opt")]
    pub serial: Option<SensorSerial>,
    #[serde(alias = "percent", alias = "level")]
    pub battery: f64,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default, alias = "capturedAt")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Decode a payload, attributing failures to the sensor
pub fn parse_payload<T: de::DeserializeOwned>(serial: SensorSerial, payload: &Value) -> Result<T, ValidationError> {
    T::deserialize(payload).map_err(|e| ValidationError::new(format!("sensor {}", serial), e.to_string()))
}

fn check_serial(expected: SensorSerial, reported: Option<SensorSerial>) -> Result<(), ValidationError> {
    match reported {
        Some(reported) if reported != expected => Err(ValidationError::new(
            format!("sensor {}", expected),
            format!("payload reports serial {}", reported),
        )),
        _ => Ok(()),
    }
}

impl VibrationPayload {
    /// Check the payload and split it into samples plus capture metadata
    pub fn validate(self, serial: SensorSerial) -> Result<(AxisSamples, f64, DateTime<Utc>), ValidationError> {
        check_serial(serial, self.serial)?;
        let subject = format!("sensor {}", serial);

        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ValidationError::new(subject, "sample rate must be positive"));
        }
        let samples = AxisSamples {
            x: self.x,
            y: self.y,
            z: self.z,
        };
        if samples.is_empty() {
            return Err(ValidationError::new(subject, "reading has no samples"));
        }
        if [&samples.x, &samples.y, &samples.z]
            .iter()
            .any(|axis| axis.iter().any(|v| !v.is_finite()))
        {
            return Err(ValidationError::new(subject, "samples must be finite numbers"));
        }

        Ok((samples, self.sample_rate, self.timestamp.unwrap_or_else(Utc::now)))
    }
}

impl TemperaturePayload {
    pub fn into_reading(self, serial: SensorSerial, source: ReadingSource) -> Result<TemperatureReading, ValidationError> {
        check_serial(serial, self.serial)?;
        if !self.temperature.is_finite() {
            return Err(ValidationError::new(format!("sensor {}", serial), "temperature is not a number"));
        }
        Ok(TemperatureReading {
            serial,
            celsius: self.temperature,
            captured_at: self.timestamp.unwrap_or_else(Utc::now),
            source,
        })
    }
}

impl BatteryPayload {
    pub fn into_reading(self, serial: SensorSerial, source: ReadingSource) -> Result<BatteryReading, ValidationError> {
        check_serial(serial, self.serial)?;
        if !(0.0..=100.0).contains(&self.battery) {
            return Err(ValidationError::new(
                format!("sensor {}", serial),
                format!("battery level {} outside 0-100", self.battery),
            ));
        }
        Ok(BatteryReading {
            serial,
            percent: self.battery,
            voltage: self.voltage,
            captured_at: self.timestamp.unwrap_or_else(Utc::now),
            source,
        })
    }
}
