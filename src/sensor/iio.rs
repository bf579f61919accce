use crate::configuration;
use crate::sensor::core::{Measurement, Reading, Sensor, SensorError};
use log::{debug, info};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the kernel exposes industrial I/O devices
pub const IIO_DEVICES: &str = "/sys/bus/iio/devices";

const TEMPERATURE_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";

const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = -40.0..=80.0;
const HUMIDITY_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// DHT22 sensor read through the Linux `dht11` IIO driver
///
/// The driver is enabled on a Raspberry Pi with `dtoverlay=dht11,gpiopin=<pin>`
/// and supports DHT22 sensors as well. It takes care of the single-wire
/// protocol; values are exposed in thousandths of a unit, and a failed
/// transfer surfaces as an I/O error on read.
pub struct IioSensor {
    device: PathBuf,
}

impl IioSensor {
    /// Opens the sensor described by the configuration.
    ///
    /// Uses the configured device directory if any, otherwise looks for the
    /// `dht11@<pin>` device among the IIO devices.
    pub fn open(config: &configuration::Sensor) -> Result<IioSensor, SensorError> {
        let device = match &config.device {
            Some(device) => device.clone(),
            None => Self::find_device(Path::new(IIO_DEVICES), config.pin)?,
        };
        Self::from_device(device)
    }

    /// Uses the given IIO device directory directly
    pub fn from_device(device: PathBuf) -> Result<IioSensor, SensorError> {
        fs::metadata(device.join(TEMPERATURE_FILE)).map_err(|source| SensorError::Open {
            path: device.clone(),
            source,
        })?;

        info!("Using DHT22 sensor at {}", device.display());
        Ok(IioSensor { device })
    }

    /// Finds the IIO device bound to the given BCM GPIO pin.
    ///
    /// The device tree overlay names the node after the pin number in hex.
    pub fn find_device(root: &Path, pin: u8) -> Result<PathBuf, SensorError> {
        let expected = format!("dht11@{pin:x}");
        let not_found = || SensorError::NotFound {
            pin,
            root: root.to_path_buf(),
        };

        let entries = fs::read_dir(root).map_err(|_| not_found())?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(name) = fs::read_to_string(path.join("name")) else {
                continue;
            };
            debug!("Found IIO device {} named {}", path.display(), name.trim());
            if name.trim() == expected {
                return Ok(path);
            }
        }

        Err(not_found())
    }

    fn read_measurement(&self, measurement: Measurement) -> Result<f64, SensorError> {
        let file = match measurement {
            Measurement::Temperature => TEMPERATURE_FILE,
            Measurement::Humidity => HUMIDITY_FILE,
        };
        let path = self.device.join(file);

        let raw = fs::read_to_string(&path).map_err(|source| SensorError::Io {
            measurement,
            path: path.clone(),
            source,
        })?;
        let millis: i64 = raw.trim().parse().map_err(|_| SensorError::Parse {
            measurement,
            path: path.clone(),
            raw: raw.trim().to_string(),
        })?;

        let value = millis as f64 / 1000.0;
        let range = match measurement {
            Measurement::Temperature => TEMPERATURE_RANGE,
            Measurement::Humidity => HUMIDITY_RANGE,
        };
        if !range.contains(&value) {
            return Err(SensorError::OutOfRange { measurement, value });
        }

        Ok(value)
    }
}

impl Sensor for IioSensor {
    fn read(&mut self) -> Result<Reading, SensorError> {
        let temperature = self.read_measurement(Measurement::Temperature)?;
        let humidity = self.read_measurement(Measurement::Humidity)?;
        debug!("Read temperature={temperature} humidity={humidity}");
        Ok(Reading::new(temperature, humidity))
    }
}

impl fmt::Debug for IioSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IioSensor")
            .field("device", &self.device)
            .finish()
    }
}
