use crate::sensor::Reading;
use serde::Serialize;
use std::fmt;

/// State message sent to the MQTT broker in discovery mode
///
/// Home Assistant extracts each value from it with the `value_template` of the
/// matching discovery message.
#[derive(Serialize, Debug, Default, PartialEq)]
pub struct StatusMessage {
    /// Temperature in °C
    pub temperature: f64,

    /// Relative humidity in %
    pub humidity: f64,
}

impl From<&Reading> for StatusMessage {
    fn from(reading: &Reading) -> StatusMessage {
        StatusMessage {
            temperature: reading.temperature,
            humidity: reading.humidity,
        }
    }
}

impl fmt::Display for StatusMessage {
    /// Formats the message to a JSON string
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(str) = serde_json::to_string(&self) else {
            return Err(fmt::Error);
        };
        write!(f, "{str}")
    }
}
