use crate::configuration::{Mqtt, Tls};
use log::{debug, info, trace, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, TlsConfiguration, Transport,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Capacity of the queue between the client and the event loop
const REQUEST_CAPACITY: usize = 16;

/// How long to wait for queued messages to go out when disconnecting
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// State of the session with the broker, as seen by the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the broker to accept the connection
    Connecting,

    /// The broker accepted the connection
    Connected,

    /// The connection was lost or closed
    Disconnected,

    /// The first connection attempt failed. Terminal.
    Failed(String),
}

/// Error establishing the first connection to the broker
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot read TLS file {}: {source}", .path.display())]
    Tls {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("no answer from the broker after {0:?}")]
    Timeout(Duration),
}

/// Error sending a message to the broker. Never fatal.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to the broker ({0:?})")]
    NotConnected(ConnectionState),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Something messages can be published to
pub trait Broker {
    /// Sends one message without waiting for it to be delivered
    fn publish(
        &self,
        topic: &str,
        payload: String,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError>;
}

/// Connection to an MQTT broker
///
/// The network I/O happens in a background task that lives as long as the
/// connection. When an established connection drops, that task waits for the
/// configured delay and reconnects; publishing fails in the meantime.
pub struct MqttBroker {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

/// Builds the MQTT options from the configuration
///
/// ## Example
///
/// ```
/// use dht22_mqtt::Configuration;
/// use dht22_mqtt::broker::mqtt_options;
///
/// let config: Configuration = "[mqtt]\nhost = \"broker.lan\"".parse().expect("Invalid configuration");
/// let options = mqtt_options(&config.mqtt).expect("Cannot build options");
///
/// assert_eq!(options.broker_address(), ("broker.lan".to_string(), 1883));
/// ```
pub fn mqtt_options(config: &Mqtt) -> Result<MqttOptions, ConnectError> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keepalive());

    if config.user.is_some() || config.password.is_some() {
        options.set_credentials(
            config.user.clone().unwrap_or_default(),
            config.password.clone().unwrap_or_default(),
        );
    }

    if let Some(tls) = &config.tls {
        options.set_transport(tls_transport(tls)?);
    }

    Ok(options)
}

fn tls_transport(tls: &Tls) -> Result<Transport, ConnectError> {
    let Some(ca_path) = &tls.ca_cert else {
        if tls.client_cert.is_some() {
            warn!("Client certificate ignored, it needs mqtt.tls.ca-cert to be set");
        }
        return Ok(Transport::tls_with_default_config());
    };

    let client_auth = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        _ => None,
    };

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: read_pem(ca_path)?,
        alpn: None,
        client_auth,
    }))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConnectError> {
    std::fs::read(path).map_err(|source| ConnectError::Tls {
        path: path.to_path_buf(),
        source,
    })
}

impl MqttBroker {
    /// Connects to the broker and waits for the outcome of the first attempt
    ///
    /// A refused or failed first attempt is not retried: at startup it means
    /// the configuration is wrong.
    pub async fn connect(config: &Mqtt) -> Result<MqttBroker, ConnectError> {
        let options = mqtt_options(config)?;

        info!("Connecting to MQTT broker {}:{}", config.host, config.port);

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, mut state) = watch::channel(ConnectionState::Connecting);
        let task = tokio::spawn(drive(event_loop, state_tx, config.reconnect_delay()));

        let first_attempt = timeout(config.connect_timeout(), async {
            state
                .wait_for(|s| *s != ConnectionState::Connecting)
                .await
                .map(|s| s.clone())
        })
        .await;

        let outcome = match first_attempt {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ConnectionState::Disconnected,
            Err(_) => {
                task.abort();
                return Err(ConnectError::Timeout(config.connect_timeout()));
            }
        };

        match outcome {
            ConnectionState::Connected => Ok(MqttBroker {
                client,
                state,
                task,
            }),
            ConnectionState::Failed(reason) => Err(ConnectError::Refused(reason)),
            other => Err(ConnectError::Refused(format!("{other:?}"))),
        }
    }

    /// Current state of the session
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Closes the session once the queued messages are sent
    pub async fn disconnect(self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Cannot request MQTT disconnection: {e}");
        }

        let mut task = self.task;
        if timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err() {
            warn!("MQTT event loop did not stop after {DISCONNECT_TIMEOUT:?}");
            task.abort();
        }
    }
}

impl Broker for MqttBroker {
    fn publish(
        &self,
        topic: &str,
        payload: String,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(PublishError::NotConnected(state));
        }

        debug!("Publishing to topic {topic} : {payload}");
        self.client.try_publish(topic, qos, retain, payload)?;
        Ok(())
    }
}

/// Polls the event loop for the lifetime of the connection
async fn drive(
    mut event_loop: EventLoop,
    state: watch::Sender<ConnectionState>,
    reconnect_delay: Duration,
) {
    let mut established = false;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                info!("MQTT connection established");
                established = true;
                state.send_replace(ConnectionState::Connected);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnection sent");
                state.send_replace(ConnectionState::Disconnected);
                return;
            }
            Ok(notification) => {
                trace!("MQTT notification received: {notification:?}");
            }
            Err(e) if !established => {
                state.send_replace(ConnectionState::Failed(e.to_string()));
                return;
            }
            Err(e) => {
                warn!("MQTT connection lost: {e}, reconnecting in {reconnect_delay:?}");
                state.send_replace(ConnectionState::Disconnected);
                sleep(reconnect_delay).await;
                state.send_replace(ConnectionState::Connecting);
            }
        }
    }
}
