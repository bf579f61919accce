use crate::broker::Broker;
use crate::configuration::{Configuration, PublishMode};
use crate::home_assistant::{Topics, announce};
use crate::sensor::{Measurement, Reading, Sensor, SensorError};
use crate::status::StatusMessage;
use log::{debug, error, info};
use rumqttc::QoS;
use std::sync::{Arc, Mutex};
use strum::IntoEnumIterator;
use thiserror::Error;
use tokio::task::{self, JoinError};
use tokio::time::sleep;

/// Fatal error of the acquisition loop
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("giving up after {count} consecutive failed reads, last error: {last}")]
    TooManyErrors { count: u32, last: SensorError },

    #[error("sensor read task failed: {0}")]
    Task(#[from] JoinError),

    #[error("sensor is unusable after a previous read panicked")]
    Poisoned,
}

/// Steps of the acquisition loop
#[derive(Debug)]
pub enum State {
    /// Nothing happened yet
    Idle,

    /// About to read the sensor
    Reading,

    /// Got a reading to publish
    Publishing(Reading),

    /// Waiting for the next reading
    Sleeping,

    /// One-shot run completed
    Finished,

    /// Too many consecutive read failures
    Aborted(SensorError),
}

/// Daemon that periodically reads the sensor and publishes to MQTT
pub struct Daemon<S, B> {
    config: Configuration,
    topics: Topics,
    sensor: Arc<Mutex<S>>,
    broker: B,
    errors: u32,
}

impl<S, B> Daemon<S, B>
where
    S: Sensor + Send + 'static,
    B: Broker,
{
    /// Constructs a daemon reading `sensor` and publishing to `broker`
    pub fn new(config: &Configuration, sensor: S, broker: B) -> Daemon<S, B> {
        info!("Daemon for {} starting", config.mqtt.sensor_name);

        Daemon {
            topics: Topics::new(&config.mqtt.base_topic, &config.mqtt.sensor_name),
            config: config.clone(),
            sensor: Arc::new(Mutex::new(sensor)),
            broker,
            errors: 0,
        }
    }

    /// Topics the daemon publishes to
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Number of consecutive failed reads so far
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Gives the broker back, to disconnect it once the loop is over
    pub fn into_broker(self) -> B {
        self.broker
    }

    /// Runs the loop until a one-shot run completes or the sensor keeps failing
    pub async fn run(&mut self) -> Result<(), LoopError> {
        let mut state = State::Idle;

        loop {
            state = match state {
                State::Finished => {
                    info!("Execution finished in non-daemon mode");
                    return Ok(());
                }
                State::Aborted(last) => {
                    return Err(LoopError::TooManyErrors {
                        count: self.errors,
                        last,
                    });
                }
                state => self.step(state).await?,
            };
        }
    }

    /// Performs the work of `state` and returns the next state
    pub async fn step(&mut self, state: State) -> Result<State, LoopError> {
        let next = match state {
            State::Idle => {
                if self.config.daemon.mode == PublishMode::Discovery {
                    announce(&self.broker, &self.topics);
                }
                debug!(
                    "Waiting {:?} for the sensor to settle",
                    self.config.sensor.settle_delay()
                );
                sleep(self.config.sensor.settle_delay()).await;
                State::Reading
            }
            State::Reading => match self.read().await? {
                Ok(reading) => {
                    self.errors = 0;
                    State::Publishing(reading)
                }
                Err(e) => {
                    self.errors += 1;
                    error!(
                        "Error reading DHT22 values ({}, {}/{}): {e}",
                        e.kind().as_label(),
                        self.errors,
                        self.config.daemon.max_errors
                    );

                    if self.errors >= self.config.daemon.max_errors {
                        State::Aborted(e)
                    } else {
                        // Values are wrong right after an error, let the sensor rest
                        sleep(self.config.daemon.error_cooldown()).await;
                        State::Reading
                    }
                }
            },
            State::Publishing(reading) => {
                self.publish(&reading);
                if self.config.daemon.enabled {
                    State::Sleeping
                } else {
                    State::Finished
                }
            }
            State::Sleeping => {
                info!("Sleeping ({} seconds)", self.config.daemon.period);
                sleep(self.config.daemon.period()).await;
                State::Reading
            }
            terminal @ (State::Finished | State::Aborted(_)) => terminal,
        };

        Ok(next)
    }

    /// Reads the sensor on a blocking thread
    async fn read(&self) -> Result<Result<Reading, SensorError>, LoopError> {
        info!("Retrieving data from DHT22 sensor");

        let sensor = self.sensor.clone();
        task::spawn_blocking(move || match sensor.lock() {
            Ok(mut sensor) => Ok(sensor.read()),
            Err(_) => Err(LoopError::Poisoned),
        })
        .await?
    }

    /// Publishes a reading. Failures are logged and otherwise ignored.
    fn publish(&self, reading: &Reading) {
        match self.config.daemon.mode {
            PublishMode::Discovery => {
                let topic = self.topics.state_topic();
                self.publish_message(&topic, StatusMessage::from(reading).to_string());
            }
            PublishMode::Plain => {
                for measurement in Measurement::iter() {
                    let topic = self.topics.measurement_topic(measurement);
                    // Debug keeps the decimal part: 55.0, not 55
                    self.publish_message(&topic, format!("{:?}", reading.value(measurement)));
                }
            }
        }
    }

    fn publish_message(&self, topic: &str, payload: String) {
        info!("Publishing: {payload} --> {topic}");
        if let Err(e) = self
            .broker
            .publish(topic, payload, QoS::AtMostOnce, false)
        {
            error!("An error occurred publishing to {topic}: {e}");
        }
    }
}
