/// Discovery workflow: CONNECT → DISCOVER → ASSOCIATE → CONFIRM
///
/// Each stage must complete before the next one can start. A stage that
/// fails goes back to `Available` so it can be retried; re-running a
/// completed stage locks everything after it again.
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::types::{
    AssociationIssue, ConfirmReport, ConfirmedSensor, DiscoveredSensor, DiscoveryStage,
    FailedAssociation, RawSensor, StepStatus,
};
use crate::config::DiscoveryConfig;
use crate::errors::{GatewayError, ValidationError};
use crate::gateway::{ConnectionManager, GatewayConnection, GatewayId, GatewayIdentity};
use crate::logger::{self, LogTag};
use crate::persistence::{SensorAssociation, SensorRegistry};
use crate::telemetry::SensorSerial;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverySettings {
    pub command: String,
    pub timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self::from_config(&DiscoveryConfig::default())
    }
}

impl DiscoverySettings {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

pub struct DiscoveryWorkflow {
    gateway: GatewayIdentity,
    manager: Arc<ConnectionManager>,
    registry: Arc<dyn SensorRegistry>,
    settings: DiscoverySettings,
    steps: [StepStatus; 4],
    connection: Option<GatewayConnection>,
    sensors: Vec<DiscoveredSensor>,
    associations: Vec<SensorAssociation>,
    issues: Vec<AssociationIssue>,
    confirmed: BTreeMap<SensorSerial, ConfirmedSensor>,
}

impl DiscoveryWorkflow {
    pub fn new(
        gateway: GatewayIdentity,
        manager: Arc<ConnectionManager>,
        registry: Arc<dyn SensorRegistry>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            gateway,
            manager,
            registry,
            settings,
            steps: initial_steps(),
            connection: None,
            sensors: Vec::new(),
            associations: Vec::new(),
            issues: Vec::new(),
            confirmed: BTreeMap::new(),
        }
    }

    /// Start a workflow for a gateway known to the persistence API
    pub async fn for_gateway(
        id: &GatewayId,
        manager: Arc<ConnectionManager>,
        registry: Arc<dyn SensorRegistry>,
        settings: DiscoverySettings,
    ) -> Result<Self, GatewayError> {
        let record = registry.gateway(id).await?;
        Ok(Self::new(record.identity(), manager, registry, settings))
    }

    pub fn gateway(&self) -> &GatewayIdentity {
        &self.gateway
    }

    pub fn status(&self, stage: DiscoveryStage) -> StepStatus {
        self.steps[stage.index()]
    }

    pub fn steps(&self) -> Vec<(DiscoveryStage, StepStatus)> {
        DiscoveryStage::ALL
            .iter()
            .map(|stage| (*stage, self.status(*stage)))
            .collect()
    }

    pub fn connection(&self) -> Option<&GatewayConnection> {
        self.connection.as_ref()
    }

    pub fn sensors(&self) -> &[DiscoveredSensor] {
        &self.sensors
    }

    pub fn associations(&self) -> &[SensorAssociation] {
        &self.associations
    }

    /// Problems found by the last `associate` call
    pub fn issues(&self) -> &[AssociationIssue] {
        &self.issues
    }

    /// Every association the persistence API accepted during this run
    pub fn confirmed(&self) -> Vec<ConfirmedSensor> {
        self.confirmed.values().cloned().collect()
    }

    // ========================================================================
    // STAGE CONTROL
    // ========================================================================

    fn begin(&mut self, stage: DiscoveryStage) -> Result<(), GatewayError> {
        match self.status(stage) {
            StepStatus::Locked => {
                let reason = match stage.previous() {
                    Some(previous) => format!("{} is not completed", previous),
                    None => "workflow not started".to_string(),
                };
                return Err(GatewayError::StageLocked {
                    stage: stage.to_string(),
                    reason,
                });
            }
            StepStatus::Active => {
                return Err(GatewayError::StageLocked {
                    stage: stage.to_string(),
                    reason: "stage is already running".to_string(),
                });
            }
            StepStatus::Completed => self.lock_after(stage),
            StepStatus::Available => {}
        }

        self.steps[stage.index()] = StepStatus::Active;
        logger::debug(LogTag::Discovery, &format!("Stage {} started", stage));
        Ok(())
    }

    fn complete(&mut self, stage: DiscoveryStage) {
        self.steps[stage.index()] = StepStatus::Completed;
        if let Some(next) = self.steps.get_mut(stage.index() + 1) {
            if *next == StepStatus::Locked {
                *next = StepStatus::Available;
            }
        }
        logger::info(LogTag::Discovery, &format!("Stage {} completed", stage));
    }

    fn fail(&mut self, stage: DiscoveryStage, error: &GatewayError) {
        self.steps[stage.index()] = StepStatus::Available;
        logger::warning(
            LogTag::Discovery,
            &format!("Stage {} failed: {}", stage, error),
        );
    }

    /// Lock every stage after `stage` and drop what `stage` onwards produced
    fn lock_after(&mut self, stage: DiscoveryStage) {
        for later in &DiscoveryStage::ALL[stage.index() + 1..] {
            self.steps[later.index()] = StepStatus::Locked;
        }
        if stage <= DiscoveryStage::Discover {
            self.sensors.clear();
            self.confirmed.clear();
        }
        if stage <= DiscoveryStage::Associate {
            self.associations.clear();
            self.issues.clear();
        }
    }

    /// Go back to a completed stage so it can be run again
    pub fn reopen(&mut self, stage: DiscoveryStage) -> Result<(), GatewayError> {
        match self.status(stage) {
            StepStatus::Completed | StepStatus::Available => {
                self.lock_after(stage);
                self.steps[stage.index()] = StepStatus::Available;
                logger::debug(LogTag::Discovery, &format!("Stage {} reopened", stage));
                Ok(())
            }
            status => Err(GatewayError::StageLocked {
                stage: stage.to_string(),
                reason: format!("cannot reopen a {:?} stage", status),
            }),
        }
    }

    /// Back to CONNECT; the gateway connection itself stays up
    pub fn reset(&mut self) {
        self.steps = initial_steps();
        self.connection = None;
        self.sensors.clear();
        self.associations.clear();
        self.issues.clear();
        self.confirmed.clear();
        logger::debug(LogTag::Discovery, "Workflow reset");
    }

    // ========================================================================
    // CONNECT
    // ========================================================================

    pub async fn connect(&mut self) -> Result<(), GatewayError> {
        self.begin(DiscoveryStage::Connect)?;

        let guard = ActiveStage::new(&mut self.steps, DiscoveryStage::Connect);
        let result = self.manager.connect(self.gateway.clone()).await;
        guard.finish();

        match result {
            Ok(connection) => {
                self.connection = Some(connection);
                self.complete(DiscoveryStage::Connect);
                Ok(())
            }
            Err(e) => {
                self.fail(DiscoveryStage::Connect, &e);
                Err(e)
            }
        }
    }

    // ========================================================================
    // DISCOVER
    // ========================================================================

    /// Ask the gateway which sensors it sees and flag the ones already registered
    pub async fn discover(&mut self) -> Result<&[DiscoveredSensor], GatewayError> {
        self.begin(DiscoveryStage::Discover)?;

        let guard = ActiveStage::new(&mut self.steps, DiscoveryStage::Discover);
        let result = fetch_sensors(
            self.connection.as_ref(),
            self.registry.as_ref(),
            &self.settings,
        )
        .await;
        guard.finish();

        match result {
            Ok(sensors) => {
                logger::info(
                    LogTag::Discovery,
                    &format!(
                        "Gateway {}: {} sensors discovered, {} already registered",
                        self.gateway.id,
                        sensors.len(),
                        sensors.iter().filter(|s| s.duplicate).count()
                    ),
                );
                self.sensors = sensors;
                self.complete(DiscoveryStage::Discover);
                Ok(&self.sensors)
            }
            Err(e) => {
                self.fail(DiscoveryStage::Discover, &e);
                Err(e)
            }
        }
    }

    // ========================================================================
    // SELECTION
    // ========================================================================

    /// Selection edits need a discovered list and invalidate a finished association
    fn ensure_editable(&mut self) -> Result<(), GatewayError> {
        if self.status(DiscoveryStage::Discover) != StepStatus::Completed {
            return Err(GatewayError::StageLocked {
                stage: DiscoveryStage::Associate.to_string(),
                reason: format!("{} is not completed", DiscoveryStage::Discover),
            });
        }
        if self.status(DiscoveryStage::Associate) == StepStatus::Completed {
            self.steps[DiscoveryStage::Associate.index()] = StepStatus::Available;
            self.steps[DiscoveryStage::Confirm.index()] = StepStatus::Locked;
        }
        Ok(())
    }

    fn sensor_mut(&mut self, serial: &str) -> Result<&mut DiscoveredSensor, GatewayError> {
        self.ensure_editable()?;
        let serial = serial.trim();
        self.sensors
            .iter_mut()
            .find(|s| s.serial() == serial)
            .ok_or_else(|| ValidationError::new("serial", format!("sensor {} was not discovered", serial)).into())
    }

    pub fn select(&mut self, serial: &str, selected: bool) -> Result<(), GatewayError> {
        self.sensor_mut(serial)?.selected = selected;
        Ok(())
    }

    /// Select every sensor not yet registered, or clear the whole selection
    pub fn select_all(&mut self, selected: bool) -> Result<(), GatewayError> {
        self.ensure_editable()?;
        for sensor in &mut self.sensors {
            sensor.selected = selected && !sensor.duplicate;
        }
        Ok(())
    }

    pub fn set_custom_name(&mut self, serial: &str, name: Option<&str>) -> Result<(), GatewayError> {
        self.sensor_mut(serial)?.custom_name = name.map(str::to_string);
        Ok(())
    }

    pub fn set_equipment(&mut self, serial: &str, equipment_id: Option<&str>) -> Result<(), GatewayError> {
        self.sensor_mut(serial)?.equipment_id = equipment_id.map(str::to_string);
        Ok(())
    }

    // ========================================================================
    // ASSOCIATE
    // ========================================================================

    /// Turn the selection into associations
    ///
    /// Sensors without their own equipment id fall back to `default_equipment_id`.
    /// All problems are collected before failing.
    pub fn associate(&mut self, default_equipment_id: Option<&str>) -> Result<&[SensorAssociation], GatewayError> {
        self.begin(DiscoveryStage::Associate)?;

        let (associations, issues) = build_associations(
            &self.sensors,
            default_equipment_id,
            self.gateway.id.as_str(),
        );
        self.issues = issues;

        if associations.is_empty() && self.issues.is_empty() {
            let err: GatewayError = ValidationError::new("associations", "no sensors selected").into();
            self.fail(DiscoveryStage::Associate, &err);
            return Err(err);
        }

        if !self.issues.is_empty() {
            let message = self
                .issues
                .iter()
                .map(|issue| format!("{}: {}", issue.serial, issue.message))
                .collect::<Vec<_>>()
                .join("; ");
            let err: GatewayError = ValidationError::new("associations", message).into();
            self.fail(DiscoveryStage::Associate, &err);
            return Err(err);
        }

        self.associations = associations;
        self.complete(DiscoveryStage::Associate);
        Ok(&self.associations)
    }

    // ========================================================================
    // CONFIRM
    // ========================================================================

    /// Submit associations grouped by equipment
    ///
    /// Associations accepted in an earlier attempt are not sent again, and
    /// nothing accepted is ever rolled back. The stage completes only once
    /// every association has been accepted.
    pub async fn confirm(&mut self) -> Result<ConfirmReport, GatewayError> {
        self.begin(DiscoveryStage::Confirm)?;

        let mut groups: BTreeMap<String, Vec<SensorAssociation>> = BTreeMap::new();
        for association in &self.associations {
            if !self.confirmed.contains_key(&association.serial) {
                groups
                    .entry(association.equipment_id.clone())
                    .or_default()
                    .push(association.clone());
            }
        }

        let guard = ActiveStage::new(&mut self.steps, DiscoveryStage::Confirm);
        let mut report = ConfirmReport::default();
        for (equipment_id, batch) in groups {
            match self.registry.discover_sensors(&equipment_id, &batch).await {
                Ok(response) => {
                    let created: HashMap<SensorSerial, String> = response
                        .created
                        .into_iter()
                        .map(|record| (record.serial, record.id))
                        .collect();
                    let errors: HashMap<SensorSerial, String> = response
                        .errors
                        .into_iter()
                        .map(|error| (error.serial, error.message))
                        .collect();

                    for association in batch {
                        if let Some(sensor_id) = created.get(&association.serial) {
                            report.succeeded.push(ConfirmedSensor {
                                serial: association.serial,
                                equipment_id: equipment_id.clone(),
                                sensor_id: sensor_id.clone(),
                            });
                        } else {
                            let message = errors
                                .get(&association.serial)
                                .cloned()
                                .unwrap_or_else(|| "not acknowledged by the persistence API".to_string());
                            report.failed.push(FailedAssociation {
                                serial: association.serial,
                                equipment_id: equipment_id.clone(),
                                message,
                            });
                        }
                    }
                }
                Err(e) => {
                    logger::error(
                        LogTag::Discovery,
                        &format!("Equipment {}: submission failed: {}", equipment_id, e),
                    );
                    report
                        .failed
                        .extend(batch.into_iter().map(|association| FailedAssociation {
                            serial: association.serial,
                            equipment_id: equipment_id.clone(),
                            message: e.to_string(),
                        }));
                }
            }
        }

        guard.finish();

        for confirmed in &report.succeeded {
            self.confirmed.insert(confirmed.serial, confirmed.clone());
        }

        if report.is_complete() {
            self.complete(DiscoveryStage::Confirm);
        } else {
            self.steps[DiscoveryStage::Confirm.index()] = StepStatus::Available;
            logger::warning(
                LogTag::Discovery,
                &format!(
                    "Stage {}: {} accepted, {} failed",
                    DiscoveryStage::Confirm,
                    report.succeeded.len(),
                    report.failed.len()
                ),
            );
        }

        Ok(report)
    }
}

/// Marks a running stage; dropping it before `finish` puts the stage back to `Available`
struct ActiveStage<'a> {
    steps: &'a mut [StepStatus; 4],
    stage: DiscoveryStage,
    running: bool,
}

impl<'a> ActiveStage<'a> {
    fn new(steps: &'a mut [StepStatus; 4], stage: DiscoveryStage) -> Self {
        Self {
            steps,
            stage,
            running: true,
        }
    }

    fn finish(mut self) {
        self.running = false;
    }
}

impl Drop for ActiveStage<'_> {
    fn drop(&mut self) {
        if self.running {
            self.steps[self.stage.index()] = StepStatus::Available;
            logger::warning(
                LogTag::Discovery,
                &format!("Stage {} cancelled before finishing", self.stage),
            );
        }
    }
}

/// Ask the gateway which sensors it sees and look their serials up across every gateway
async fn fetch_sensors(
    connection: Option<&GatewayConnection>,
    registry: &dyn SensorRegistry,
    settings: &DiscoverySettings,
) -> Result<Vec<DiscoveredSensor>, GatewayError> {
    let connection = connection.ok_or(GatewayError::ConnectionClosed)?;
    let result = connection
        .send_command_with_timeout(&settings.command, serde_json::json!({}), settings.timeout)
        .await?;
    let raw = parse_discovery_result(&result)?;

    let serials: Vec<SensorSerial> = raw.iter().filter_map(RawSensor::serial_number).collect();
    let existing: HashMap<SensorSerial, String> = registry
        .sensors_by_serial(&serials)
        .await?
        .into_iter()
        .map(|record| (record.serial, record.id))
        .collect();

    Ok(raw
        .into_iter()
        .map(|sensor| {
            let existing_id = sensor
                .serial_number()
                .and_then(|serial| existing.get(&serial).cloned());
            DiscoveredSensor::new(sensor, existing_id)
        })
        .collect())
}

fn initial_steps() -> [StepStatus; 4] {
    [
        StepStatus::Available,
        StepStatus::Locked,
        StepStatus::Locked,
        StepStatus::Locked,
    ]
}

/// Accepts a bare array or `{ "sensors": [...] }`; duplicates by serial keep the first entry
fn parse_discovery_result(result: &Value) -> Result<Vec<RawSensor>, GatewayError> {
    let items = match result {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("sensors") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ValidationError::new("discovery result", "missing 'sensors' array").into());
            }
        },
        other => {
            return Err(ValidationError::new(
                "discovery result",
                format!("expected a sensor list, got {}", other),
            )
            .into());
        }
    };

    let mut seen = HashSet::new();
    let mut sensors = Vec::with_capacity(items.len());
    for item in items {
        let sensor = match RawSensor::deserialize(item) {
            Ok(sensor) => sensor,
            Err(e) => {
                logger::warning(
                    LogTag::Discovery,
                    &format!("Skipping unreadable sensor entry {}: {}", item, e),
                );
                continue;
            }
        };
        // Same sensor heard through several access points
        let key = sensor
            .serial_number()
            .map(|serial| serial.to_string())
            .unwrap_or_else(|| sensor.serial.clone());
        if seen.insert(key) {
            sensors.push(sensor);
        } else {
            logger::debug(
                LogTag::Discovery,
                &format!("Ignoring repeated serial {}", sensor.serial),
            );
        }
    }
    Ok(sensors)
}

fn build_associations(
    sensors: &[DiscoveredSensor],
    default_equipment_id: Option<&str>,
    gateway_id: &str,
) -> (Vec<SensorAssociation>, Vec<AssociationIssue>) {
    let default_equipment_id = default_equipment_id.map(str::trim).filter(|id| !id.is_empty());
    let mut associations = Vec::new();
    let mut issues = Vec::new();

    for sensor in sensors.iter().filter(|s| s.selected) {
        let serial = sensor.raw.serial_number();
        let equipment_id = sensor
            .equipment_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or(default_equipment_id);

        let mut problems = Vec::new();
        if serial.is_none() {
            problems.push("serial must be a positive integer");
        }
        if equipment_id.is_none() {
            problems.push("equipment id is required");
        }

        match (serial, equipment_id) {
            (Some(serial), Some(equipment_id)) => {
                associations.push(sensor.to_association(serial, equipment_id, gateway_id));
            }
            _ => issues.push(AssociationIssue {
                serial: sensor.raw.serial.clone(),
                message: problems.join(", "),
            }),
        }
    }

    (associations, issues)
}
