//! # dht22-mqtt
//!
//! `dht22-mqtt` periodically reads a DHT22 temperature and humidity sensor
//! connected to a Raspberry Pi and publishes the values to an MQTT broker.
//!
//! In `discovery` mode, the readings are published as one JSON state message
//! and the sensor announces itself to Home Assistant through MQTT discovery.
//! In `plain` mode, each measurement is published as a bare number on its own
//! topic.
//!
//! The sensor is read through the Linux `dht11` IIO driver, enabled with
//! `dtoverlay=dht11,gpiopin=<pin>` in `/boot/config.txt`.

pub use self::broker::Broker;
pub use self::broker::MqttBroker;
pub use self::configuration::Configuration;
pub use self::configuration::PublishMode;
pub use self::daemon::Daemon;
pub use self::home_assistant::DiscoveryConfig;
pub use self::home_assistant::Topics;
pub use self::sensor::IioSensor;
pub use self::sensor::Reading;
pub use self::sensor::Sensor;
pub use self::status::StatusMessage;

/// Contains the MQTT connection
pub mod broker;
/// Contains the configuration stuff
pub mod configuration;
/// Contains the acquisition loop
pub mod daemon;
/// Contains Home Assistant discovery data
pub mod home_assistant;
/// Contains the sensor access
pub mod sensor;
/// Contains the status that is sent to MQTT
pub mod status;
