/// Sensor discovery workflow
///
/// Turns the sensors a gateway advertises into persisted equipment
/// associations, one gated stage at a time.
pub mod types;
pub mod workflow;

pub use types::{
    AssociationIssue, ConfirmReport, ConfirmedSensor, DiscoveredSensor, DiscoveryStage,
    FailedAssociation, RawSensor, StepStatus,
};
pub use workflow::{DiscoverySettings, DiscoveryWorkflow};
