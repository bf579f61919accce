mod core;
mod iio;

pub use crate::sensor::core::{Measurement, Reading, Sensor, SensorError, SensorErrorKind};
pub use crate::sensor::iio::{IIO_DEVICES, IioSensor};

#[cfg(test)]
pub(crate) use crate::sensor::test::ScriptedSensor;
