/// In-process registry used by tests and by `--simulate`
///
/// Behaves like the REST service: numeric record ids, duplicate serials are
/// rejected per sensor, and whole-batch or single-serial failures can be
/// injected.
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    DiscoverSensorsResponse, GatewayRecord, SensorAssociation, SensorRecord, SensorRegistry,
    SensorSubmitError,
};
use crate::errors::GatewayError;
use crate::gateway::GatewayId;
use crate::telemetry::SensorSerial;

#[derive(Default)]
pub struct InMemoryRegistry {
    gateways: RwLock<HashMap<GatewayId, GatewayRecord>>,
    sensors: RwLock<Vec<SensorRecord>>,
    next_id: AtomicU64,
    failing_equipment: RwLock<HashSet<String>>,
    rejected_serials: RwLock<HashMap<SensorSerial, String>>,
    submissions: RwLock<Vec<(String, Vec<SensorAssociation>)>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_gateway(&self, record: GatewayRecord) {
        self.gateways
            .write()
            .insert(GatewayId::new(record.id.clone()), record);
    }

    /// Register a sensor directly, bypassing `discover_sensors`
    pub fn insert_sensor(&self, gateway_id: &GatewayId, serial: SensorSerial, name: &str) -> SensorRecord {
        let record = SensorRecord {
            id: self.allocate_id(),
            serial,
            name: Some(name.to_string()),
            equipment_id: None,
            gateway_id: Some(gateway_id.to_string()),
        };
        self.sensors.write().push(record.clone());
        record
    }

    /// Every submission to this equipment fails as a whole
    pub fn fail_equipment(&self, equipment_id: &str) {
        self.failing_equipment.write().insert(equipment_id.to_string());
    }

    pub fn restore_equipment(&self, equipment_id: &str) {
        self.failing_equipment.write().remove(equipment_id);
    }

    /// This serial is reported back in `errors` instead of being created
    pub fn reject_serial(&self, serial: SensorSerial, message: &str) {
        self.rejected_serials.write().insert(serial, message.to_string());
    }

    pub fn accept_serial(&self, serial: SensorSerial) {
        self.rejected_serials.write().remove(&serial);
    }

    pub fn all_sensors(&self) -> Vec<SensorRecord> {
        self.sensors.read().clone()
    }

    /// Batches received, in order, including failed ones
    pub fn submissions(&self) -> Vec<(String, Vec<SensorAssociation>)> {
        self.submissions.read().clone()
    }

    fn allocate_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

#[async_trait]
impl SensorRegistry for InMemoryRegistry {
    async fn gateway(&self, id: &GatewayId) -> Result<GatewayRecord, GatewayError> {
        self.gateways
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::persistence(format!("gateway {} not found", id)))
    }

    async fn sensors(&self, gateway_id: &GatewayId) -> Result<Vec<SensorRecord>, GatewayError> {
        Ok(self
            .sensors
            .read()
            .iter()
            .filter(|s| s.gateway_id.as_deref() == Some(gateway_id.as_str()))
            .cloned()
            .collect())
    }

    async fn sensors_by_serial(&self, serials: &[SensorSerial]) -> Result<Vec<SensorRecord>, GatewayError> {
        Ok(self
            .sensors
            .read()
            .iter()
            .filter(|s| serials.contains(&s.serial))
            .cloned()
            .collect())
    }

    async fn discover_sensors(
        &self,
        equipment_id: &str,
        sensors: &[SensorAssociation],
    ) -> Result<DiscoverSensorsResponse, GatewayError> {
        self.submissions
            .write()
            .push((equipment_id.to_string(), sensors.to_vec()));

        if self.failing_equipment.read().contains(equipment_id) {
            return Err(GatewayError::persistence(format!(
                "equipment {} request failed with status 500 Internal Server Error",
                equipment_id
            )));
        }

        let mut response = DiscoverSensorsResponse::default();
        for association in sensors {
            if let Some(message) = self.rejected_serials.read().get(&association.serial) {
                response.errors.push(SensorSubmitError {
                    serial: association.serial,
                    message: message.clone(),
                });
                continue;
            }

            let exists = self.sensors.read().iter().any(|s| s.serial == association.serial);
            if exists {
                response.errors.push(SensorSubmitError {
                    serial: association.serial,
                    message: "serial already registered".to_string(),
                });
                continue;
            }

            let record = SensorRecord {
                id: self.allocate_id(),
                serial: association.serial,
                name: Some(association.name.clone()),
                equipment_id: Some(equipment_id.to_string()),
                gateway_id: association.gateway_id.clone(),
            };
            self.sensors.write().push(record.clone());
            response.created.push(record);
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn association(serial: SensorSerial, equipment: &str) -> SensorAssociation {
        SensorAssociation {
            serial,
            equipment_id: equipment.into(),
            name: format!("Sensor {}", serial),
            gateway_id: Some("gw-1".into()),
            part_number: None,
            hardware_version: None,
            firmware_version: None,
            access_point: None,
            read_rate: None,
            read_period: None,
            samples: None,
            g_mode: None,
            freq_mode: None,
        }
    }

    #[tokio::test]
    async fn test_discover_creates_and_reports_duplicates() {
        let registry = InMemoryRegistry::new();
        let gw = GatewayId::new("gw-1");
        registry.insert_sensor(&gw, 1001, "existing");

        let result = registry
            .discover_sensors("eq-1", &[association(1001, "eq-1"), association(1002, "eq-1")])
            .await
            .unwrap();
        assert_eq!(result.created.len(), 1);
        assert_eq!(result.created[0].serial, 1002);
        assert_eq!(result.errors[0].serial, 1001);

        let listed = registry.sensors(&gw).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(registry.sensors(&GatewayId::new("gw-2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let registry = InMemoryRegistry::new();
        registry.fail_equipment("eq-bad");
        registry.reject_serial(2002, "part number unknown");

        assert!(matches!(
            registry.discover_sensors("eq-bad", &[association(2001, "eq-bad")]).await,
            Err(GatewayError::Persistence(_))
        ));
        let result = registry
            .discover_sensors("eq-1", &[association(2002, "eq-1")])
            .await
            .unwrap();
        assert_eq!(result.errors[0].message, "part number unknown");
        assert_eq!(registry.submissions().len(), 2);
        assert!(registry.all_sensors().is_empty());
    }

    #[tokio::test]
    async fn test_serial_lookup_ignores_gateway() {
        let registry = InMemoryRegistry::new();
        registry.insert_sensor(&GatewayId::new("gw-1"), 1001, "a");
        registry.insert_sensor(&GatewayId::new("gw-2"), 1002, "b");
        registry.insert_sensor(&GatewayId::new("gw-2"), 1003, "c");

        let found = registry.sensors_by_serial(&[1001, 1002, 4242]).await.unwrap();
        assert_eq!(found.iter().map(|s| s.serial).collect::<Vec<_>>(), vec![1001, 1002]);
        assert!(registry.sensors_by_serial(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_gateway() {
        let registry = InMemoryRegistry::new();
        assert!(registry.gateway(&GatewayId::new("nope")).await.is_err());
    }
}
