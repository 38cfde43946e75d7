/// Sensor telemetry: reading types, spectrum computation and the per-gateway cache
pub mod readings;
pub mod spectrum;
pub mod store;

pub use readings::{
    coerce_serial, AxisSamples, BatteryReading, ReadingSource, SensorSerial, TelemetryKind,
    TemperatureReading, VibrationReading,
};
pub use spectrum::{MagnitudeSpectrum, SpectrumTransform};
pub use store::{TelemetrySettings, TelemetryStore, TelemetryTracker};
