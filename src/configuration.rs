use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_inline_default::serde_inline_default;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;

/// Error loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for environment variable {key}")]
    Environment { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Contains the configuration for communicating with the MQTT broker
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Mqtt {
    /// Hostname or IP address. Default: localhost
    #[serde_inline_default(String::from("localhost"))]
    pub host: String,

    /// Port of the connection to the broker. Default: 1883
    #[serde_inline_default(1883)]
    pub port: u16,

    /// Client identifier sent to the broker. Default: machine hostname
    #[serde(default = "hostname")]
    pub client_id: String,

    /// Username for the connection to the broker. Default: none
    pub user: Option<String>,

    /// Password for the connection to the broker. Default: none
    pub password: Option<String>,

    /// Keepalive interval in seconds. Default: 60 seconds
    #[serde_inline_default(60)]
    pub keepalive: u64,

    /// How long to wait for the broker to accept the connection, in seconds. Default: 10 seconds
    #[serde_inline_default(10)]
    pub connect_timeout: u64,

    /// Delay before reconnecting after the connection was lost, in seconds. Default: 5 seconds
    #[serde_inline_default(5)]
    pub reconnect_delay: u64,

    /// Prefix of every published topic. Default: homeassistant
    ///
    /// In discovery mode, this must match the discovery prefix of the MQTT integration in
    /// Home Assistant. See <https://www.home-assistant.io/integrations/mqtt#discovery-options>
    #[serde_inline_default(String::from("homeassistant"))]
    pub base_topic: String,

    /// Name of the sensor in topics and in Home Assistant, lower-cased when used.
    /// Default: `<hostname>_dht22`, with `-` replaced by `_`
    #[serde(default = "sensor_name")]
    pub sensor_name: String,

    /// Enables TLS when present
    pub tls: Option<Tls>,
}

/// TLS settings for the broker connection
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Tls {
    /// CA certificate in PEM format. Default: the system root certificates
    pub ca_cert: Option<PathBuf>,

    /// Client certificate in PEM format, for mutual TLS
    pub client_cert: Option<PathBuf>,

    /// Private key matching `client-cert`, in PEM format
    pub client_key: Option<PathBuf>,
}

/// Contains the configuration of the DHT22 sensor
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Sensor {
    /// BCM GPIO pin number the data line is connected to. Default: 4
    #[serde_inline_default(4)]
    pub pin: u8,

    /// IIO device directory of the sensor. Default: found from the pin number
    pub device: Option<PathBuf>,

    /// Delay before the first read, in seconds. Default: 2 seconds
    #[serde_inline_default(2)]
    pub settle_delay: u64,
}

/// Format of the published readings
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PublishMode {
    /// One JSON state message and Home Assistant discovery messages
    Discovery,

    /// One bare number per measurement, no discovery
    Plain,
}

/// Contains the configuration of the acquisition loop
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Daemon {
    /// Keep reading the sensor. When disabled, exit after one successful reading. Default: true
    #[serde_inline_default(true)]
    pub enabled: bool,

    /// Delay between each reading in seconds. Default: 120 seconds
    #[serde_inline_default(120)]
    pub period: u64,

    /// Number of consecutive failed reads after which the program gives up. Default: 5
    #[serde_inline_default(5)]
    pub max_errors: u32,

    /// Delay after a failed read in seconds. Default: 10 seconds
    ///
    /// The sensor reports wrong values right after an error, so it needs some rest.
    #[serde_inline_default(10)]
    pub error_cooldown: u64,

    /// Format of the published readings. Default: discovery
    #[serde_inline_default(PublishMode::Discovery)]
    pub mode: PublishMode,
}

/// Contains all the configuration for `dht22-mqtt`
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Configuration {
    /// Contains the configuration for communicating with the MQTT broker
    #[serde(default = "default_section")]
    pub mqtt: Mqtt,

    /// Contains the configuration of the sensor
    #[serde(default = "default_section")]
    pub sensor: Sensor,

    /// Contains the configuration of the acquisition loop
    #[serde(default = "default_section")]
    pub daemon: Daemon,

    /// Sets the verbosity of the logs.
    ///  * 1 => Error
    ///  * 2 => Warning
    ///  * 3 => Info
    ///  * 4 => Debug
    ///  * 5 => Trace
    #[serde_inline_default(3)]
    #[serde(rename = "log-verbosity")]
    pub log_verbosity: usize,
}

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| String::from("dht22-mqtt"))
}

fn sensor_name() -> String {
    sensor_name_for(&hostname())
}

fn sensor_name_for(host: &str) -> String {
    format!("{}_dht22", host.replace('-', "_").to_lowercase())
}

/// Builds a section with all its defaults, as if it was empty in the file
fn default_section<T: DeserializeOwned>() -> T {
    toml::from_str("").expect("Every field of a section has a default")
}

impl FromStr for Configuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Configuration = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Configuration {
    /// Load the configuration from a file
    ///
    /// ## Example
    ///
    /// ```
    /// use dht22_mqtt::Configuration;
    ///
    /// let config = Configuration::load("conf/dht22-mqtt.conf").expect("Cannot load configuration");
    ///
    /// assert_eq!(config.mqtt.host, "localhost");
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Configuration, ConfigError> {
        let path = path.as_ref();
        std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .parse()
    }

    /// Applies the supported environment variables on top of the loaded values
    ///
    /// * `DHT22_PIN` => `sensor.pin`
    /// * `DHT22_CHECK_EVERY` => `daemon.period`
    /// * `MQTT_SERVICE_HOST` => `mqtt.host`
    /// * `MQTT_SERVICE_PORT` => `mqtt.port`
    /// * `MQTT_SERVICE_TOPIC` => `mqtt.base-topic`
    ///
    /// Other variables are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "DHT22_PIN" => self.sensor.pin = parse_env(key, value)?,
                "DHT22_CHECK_EVERY" => self.daemon.period = parse_env(key, value)?,
                "MQTT_SERVICE_HOST" => self.mqtt.host = value.to_string(),
                "MQTT_SERVICE_PORT" => self.mqtt.port = parse_env(key, value)?,
                "MQTT_SERVICE_TOPIC" => self.mqtt.base_topic = value.to_string(),
                _ => continue,
            }
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.max_errors == 0 {
            return Err(ConfigError::Invalid("daemon.max-errors must be at least 1"));
        }
        if self.daemon.period == 0 {
            return Err(ConfigError::Invalid("daemon.period must be at least 1"));
        }
        if self.mqtt.base_topic.is_empty() || self.mqtt.sensor_name.is_empty() {
            return Err(ConfigError::Invalid(
                "mqtt.base-topic and mqtt.sensor-name cannot be empty",
            ));
        }
        if let Some(tls) = &self.mqtt.tls
            && tls.client_cert.is_some() != tls.client_key.is_some()
        {
            return Err(ConfigError::Invalid(
                "mqtt.tls.client-cert and mqtt.tls.client-key must be set together",
            ));
        }
        Ok(())
    }
}

/// Keeps the environment entries that are valid UTF-8, for `apply_env`
///
/// ## Example
///
/// ```
/// use dht22_mqtt::configuration::{Configuration, utf8_vars};
///
/// use std::ffi::OsString;
///
/// let vars = [(OsString::from("DHT22_PIN"), OsString::from("17"))];
/// let mut config: Configuration = "".parse().expect("Invalid configuration");
/// config.apply_env(utf8_vars(vars)).expect("Invalid environment");
///
/// assert_eq!(config.sensor.pin, 17);
/// ```
pub fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Environment {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Mqtt {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }
}

impl Sensor {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay)
    }
}

impl Daemon {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    /// Test that we can properly load the default configuration
    #[test]
    fn test_default_config() -> Result<(), Box<dyn Error>> {
        let conf = Configuration::load("conf/dht22-mqtt.conf")?;

        assert_eq!(conf.mqtt.host, String::from("localhost"));
        assert_eq!(conf.mqtt.port, 1883);
        assert_eq!(conf.mqtt.base_topic, String::from("homeassistant"));
        assert!(conf.mqtt.tls.is_none());

        // By default, names are derived from the hostname of the machine
        assert_eq!(conf.mqtt.client_id, hostname());
        assert_eq!(conf.mqtt.sensor_name, sensor_name());

        assert_eq!(conf.sensor.pin, 4);
        assert_eq!(conf.daemon.mode, PublishMode::Discovery);
        assert_eq!(conf.daemon.error_cooldown(), Duration::from_secs(10));

        Ok(())
    }

    #[test]
    fn test_default_sensor_name() {
        assert_eq!(sensor_name_for("pi4b"), "pi4b_dht22");
        assert_eq!(sensor_name_for("RaspberryPi-4"), "raspberrypi_4_dht22");
        assert_eq!(sensor_name_for("living-room-pi"), "living_room_pi_dht22");
    }

    #[test]
    fn test_empty_config() -> Result<(), Box<dyn Error>> {
        let conf: Configuration = "".parse()?;

        assert_eq!(conf.log_verbosity, 3);
        assert_eq!(conf.mqtt.keepalive(), Duration::from_secs(60));
        assert!(conf.mqtt.user.is_none());
        assert_eq!(conf.sensor.device, None);
        assert!(conf.daemon.enabled);
        assert_eq!(conf.daemon.period, 120);
        assert_eq!(conf.daemon.max_errors, 5);

        Ok(())
    }

    #[test]
    fn test_full_config() -> Result<(), Box<dyn Error>> {
        let conf: Configuration = r#"
            log-verbosity = 4

            [mqtt]
            host = "broker.lan"
            port = 8883
            user = "dht"
            password = "secret"
            base-topic = "home/livingroom"
            sensor-name = "Living-Room"

            [mqtt.tls]
            ca-cert = "/etc/ssl/ca.pem"

            [sensor]
            pin = 17
            device = "/sys/bus/iio/devices/iio:device0"

            [daemon]
            enabled = false
            period = 30
            max-errors = 3
            mode = "plain"
        "#
        .parse()?;

        assert_eq!(conf.mqtt.host, "broker.lan");
        assert_eq!(conf.mqtt.user.as_deref(), Some("dht"));
        assert_eq!(conf.mqtt.sensor_name, "Living-Room");
        assert_eq!(
            conf.mqtt.tls.and_then(|t| t.ca_cert),
            Some(PathBuf::from("/etc/ssl/ca.pem"))
        );
        assert_eq!(conf.sensor.pin, 17);
        assert!(!conf.daemon.enabled);
        assert_eq!(conf.daemon.period(), Duration::from_secs(30));
        assert_eq!(conf.daemon.mode, PublishMode::Plain);
        assert_eq!(conf.daemon.mode.to_string(), "plain");

        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        let zero_errors = "[daemon]\nmax-errors = 0".parse::<Configuration>();
        assert!(matches!(zero_errors, Err(ConfigError::Invalid(_))));

        let half_client_auth = "[mqtt.tls]\nclient-cert = \"/tmp/c.pem\"".parse::<Configuration>();
        assert!(matches!(half_client_auth, Err(ConfigError::Invalid(_))));

        let bad_mode = "[daemon]\nmode = \"xml\"".parse::<Configuration>();
        assert!(matches!(bad_mode, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() -> Result<(), Box<dyn Error>> {
        let mut conf: Configuration = "".parse()?;

        conf.apply_env([
            ("DHT22_PIN", "22"),
            ("DHT22_CHECK_EVERY", "15"),
            ("MQTT_SERVICE_HOST", "mosquitto.local"),
            ("MQTT_SERVICE_PORT", "1884"),
            ("MQTT_SERVICE_TOPIC", "home/bedroom"),
            ("PATH", "/usr/bin"),
        ])?;

        assert_eq!(conf.sensor.pin, 22);
        assert_eq!(conf.daemon.period, 15);
        assert_eq!(conf.mqtt.host, "mosquitto.local");
        assert_eq!(conf.mqtt.port, 1884);
        assert_eq!(conf.mqtt.base_topic, "home/bedroom");

        let err = conf.apply_env([("DHT22_PIN", "four")]).unwrap_err();
        assert!(matches!(err, ConfigError::Environment { .. }));

        let err = conf.apply_env([("DHT22_CHECK_EVERY", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        Ok(())
    }

    #[test]
    fn test_env_skips_non_utf8() -> Result<(), Box<dyn Error>> {
        use std::os::unix::ffi::OsStringExt;

        let vars = vec![
            (OsString::from("LANG_BROKEN"), OsString::from_vec(vec![0x66, 0xff])),
            (OsString::from_vec(vec![0xfe, 0x41]), OsString::from("x")),
            (OsString::from("DHT22_PIN"), OsString::from("27")),
        ];

        let kept: Vec<(String, String)> = utf8_vars(vars).collect();
        assert_eq!(kept, vec![("DHT22_PIN".to_string(), "27".to_string())]);

        let mut conf: Configuration = "".parse()?;
        conf.apply_env(kept)?;
        assert_eq!(conf.sensor.pin, 27);

        Ok(())
    }
}
