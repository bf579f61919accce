use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;
use strum_macros::EnumIter;
use thiserror::Error;

/// Quantities measured by a DHT22 sensor
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, EnumIter)]
pub enum Measurement {
    /// Temperature in °C
    Temperature,

    /// Relative humidity in %
    Humidity,
}

impl Measurement {
    /// Name of the measurement, as used in topics and in the state payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::Temperature => "temperature",
            Measurement::Humidity => "humidity",
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One successfully paired temperature and humidity sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Temperature in °C
    pub temperature: f64,

    /// Relative humidity, from 0 to 100
    pub humidity: f64,

    /// When the sample was taken
    pub timestamp: SystemTime,
}

impl Reading {
    pub fn new(temperature: f64, humidity: f64) -> Reading {
        Reading {
            temperature,
            humidity,
            timestamp: SystemTime::now(),
        }
    }

    /// Value of a single measurement of this reading
    pub fn value(&self, measurement: Measurement) -> f64 {
        match measurement {
            Measurement::Temperature => self.temperature,
            Measurement::Humidity => self.humidity,
        }
    }
}

/// Broad categories of sensor errors, used to label log messages
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Initialization,
    Timeout,
    Io,
    Invalid,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Initialization => "initialization",
            SensorErrorKind::Timeout => "timeout",
            SensorErrorKind::Io => "io",
            SensorErrorKind::Invalid => "invalid",
        }
    }
}

/// Error opening or reading a DHT22 sensor
///
/// Read errors are transient: the sensor stays usable and the read can be
/// retried, after a cooldown.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("no DHT sensor found for GPIO pin {pin} under {}", .root.display())]
    NotFound { pin: u8, root: PathBuf },

    #[error("unable to open sensor device {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to read {measurement} from {}: {source}", .path.display())]
    Io {
        measurement: Measurement,
        path: PathBuf,
        source: io::Error,
    },

    #[error("unexpected {measurement} value {raw:?} in {}", .path.display())]
    Parse {
        measurement: Measurement,
        path: PathBuf,
        raw: String,
    },

    #[error("{measurement} value {value} is outside of the sensor range")]
    OutOfRange { measurement: Measurement, value: f64 },
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::NotFound { .. } | SensorError::Open { .. } => {
                SensorErrorKind::Initialization
            }
            SensorError::Io { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                SensorErrorKind::Timeout
            }
            SensorError::Io { .. } => SensorErrorKind::Io,
            SensorError::Parse { .. } | SensorError::OutOfRange { .. } => SensorErrorKind::Invalid,
        }
    }
}

/// Source of temperature and humidity readings
///
/// A read either returns both values from the same measurement or fails as a
/// whole. After a failed read the DHT22 may report stale or invalid values
/// for a few seconds: callers must wait before retrying instead of retrying
/// immediately.
pub trait Sensor {
    fn read(&mut self) -> Result<Reading, SensorError>;
}
