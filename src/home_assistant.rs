use crate::broker::Broker;
use crate::sensor::Measurement;
use log::{error, info};
use rumqttc::QoS;
use serde::Serialize;
use std::fmt;
use strum::IntoEnumIterator;

/// Topics used by a sensor. Everything is lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
    sensor: String,
}

impl Topics {
    /// ## Example
    ///
    /// ```
    /// use dht22_mqtt::Topics;
    ///
    /// let topics = Topics::new("HomeAssistant", "Kitchen_DHT22");
    /// assert_eq!(topics.state_topic(), "homeassistant/sensor/kitchen_dht22/state");
    /// ```
    pub fn new(base_topic: &str, sensor_name: &str) -> Topics {
        Topics {
            base: base_topic.to_lowercase(),
            sensor: sensor_name.to_lowercase(),
        }
    }

    /// Sensor name, lower-cased. Also names the entities in Home Assistant.
    pub fn sensor_name(&self) -> &str {
        &self.sensor
    }

    fn node(&self) -> String {
        format!("{}/sensor/{}", self.base, self.sensor)
    }

    /// Topic of the JSON state message
    pub fn state_topic(&self) -> String {
        format!("{}/state", self.node())
    }

    /// Topic of the discovery message of a measurement
    pub fn discovery_topic(&self, measurement: Measurement) -> String {
        format!("{}/{}_{measurement}/config", self.node(), self.sensor)
    }

    /// Topic of a single measurement in plain mode
    pub fn measurement_topic(&self, measurement: Measurement) -> String {
        format!("{}/{measurement}", self.base)
    }
}

/// Discovery message telling Home Assistant how to read one measurement
///
/// Fields are serialized in declaration order, so the same sensor always
/// produces the same bytes.
#[derive(Serialize, Debug, PartialEq)]
pub struct DiscoveryConfig {
    /// Topic where the readings are published
    state_topic: String,

    /// Unit of the value
    unit_of_measurement: &'static str,

    /// Tells Home Assistant where to find the value in the JSON payload
    value_template: &'static str,

    /// Name of the entity, shown in Home Assistant
    name: String,

    /// Device class helps Home Assistant to know how to interpret the reported values.
    ///
    /// See <https://www.home-assistant.io/integrations/sensor#device-class> for possible values here
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
}

impl DiscoveryConfig {
    pub fn new(measurement: Measurement, topics: &Topics) -> DiscoveryConfig {
        let sensor_name = topics.sensor_name();
        match measurement {
            Measurement::Temperature => DiscoveryConfig {
                state_topic: topics.state_topic(),
                unit_of_measurement: "°C",
                value_template: "{{ value_json.temperature }}",
                name: format!("{sensor_name} Temperature"),
                device_class: Some("temperature"),
            },
            Measurement::Humidity => DiscoveryConfig {
                state_topic: topics.state_topic(),
                unit_of_measurement: "%",
                value_template: "{{ value_json.humidity }}",
                name: format!("{sensor_name} Humidity"),
                device_class: None,
            },
        }
    }
}

impl fmt::Display for DiscoveryConfig {
    /// Formats the message in JSON format
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(config) = serde_json::to_string(&self) else {
            return Err(fmt::Error);
        };
        write!(f, "{config}")
    }
}

/// Publishes the retained discovery messages of every measurement
///
/// Failures are logged and not retried. Returns the number of messages handed
/// over to the broker.
pub fn announce<B: Broker>(broker: &B, topics: &Topics) -> usize {
    info!("Announcing {} for auto-discovery", topics.sensor_name());

    let mut published = 0;
    for measurement in Measurement::iter() {
        let topic = topics.discovery_topic(measurement);
        let payload = DiscoveryConfig::new(measurement, topics).to_string();

        match broker.publish(&topic, payload, QoS::AtLeastOnce, true) {
            Ok(()) => published += 1,
            Err(e) => error!("Cannot announce {measurement} on {topic}: {e}"),
        }
    }

    published
}
