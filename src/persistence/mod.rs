/// Persistence API client
///
/// Gateways and sensors live in an external REST service. The workflow only
/// needs four calls, so they sit behind the `SensorRegistry` trait:
/// - `HttpSensorRegistry`: the real service over reqwest
/// - `InMemoryRegistry`: tests and `--simulate`
pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::GatewayError;
use crate::gateway::{Credentials, GatewayId, GatewayIdentity};
use crate::telemetry::{coerce_serial, SensorSerial};

pub use http::HttpSensorRegistry;
pub use memory::InMemoryRegistry;

#[async_trait]
pub trait SensorRegistry: Send + Sync {
    /// Gateway record holding the connection target and credentials
    async fn gateway(&self, id: &GatewayId) -> Result<GatewayRecord, GatewayError>;

    /// Sensors already registered under a gateway
    async fn sensors(&self, gateway_id: &GatewayId) -> Result<Vec<SensorRecord>, GatewayError>;

    /// Registered sensors carrying any of these serials, whatever gateway they belong to
    async fn sensors_by_serial(&self, serials: &[SensorSerial]) -> Result<Vec<SensorRecord>, GatewayError>;

    /// Register a batch of sensors under one equipment
    async fn discover_sensors(
        &self,
        equipment_id: &str,
        sensors: &[SensorAssociation],
    ) -> Result<DiscoverSensorsResponse, GatewayError>;
}

// ============================================================================
// RECORDS
// ============================================================================

/// Record ids come back as strings or numbers depending on the backend
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("invalid id {}", other))),
    }
}

fn deserialize_serial<'de, D>(deserializer: D) -> Result<SensorSerial, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    coerce_serial(&value).ok_or_else(|| de::Error::custom(format!("invalid serial {}", value)))
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
}

impl GatewayRecord {
    pub fn identity(&self) -> GatewayIdentity {
        GatewayIdentity::new(
            self.id.as_str(),
            self.url.clone(),
            Credentials::new(self.username.clone(), self.password.clone()),
        )
    }
}

impl fmt::Debug for GatewayRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(deserialize_with = "deserialize_serial")]
    pub serial: SensorSerial,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub equipment_id: Option<String>,
    #[serde(default)]
    pub gateway_id: Option<String>,
}

/// Validated sensor ready to be registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorAssociation {
    pub serial: SensorSerial,
    pub equipment_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_point: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub g_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverSensorsRequest<'a> {
    pub sensors: &'a [SensorAssociation],
    pub equipment_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSubmitError {
    #[serde(deserialize_with = "deserialize_serial")]
    pub serial: SensorSerial,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverSensorsResponse {
    #[serde(default)]
    pub created: Vec<SensorRecord>,
    #[serde(default)]
    pub errors: Vec<SensorSubmitError>,
}
