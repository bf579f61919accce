use dht22_mqtt::broker::{Broker, ConnectError, ConnectionState, MqttBroker, PublishError};
use dht22_mqtt::configuration::{Configuration, PublishMode};
use dht22_mqtt::daemon::Daemon;
use dht22_mqtt::sensor::{Reading, Sensor, SensorError};
use rumqttc::QoS;
use std::error::Error;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Sensor that always reads the same values
struct FixedSensor(f64, f64);

impl Sensor for FixedSensor {
    fn read(&mut self) -> Result<Reading, SensorError> {
        Ok(Reading::new(self.0, self.1))
    }
}

/// Accepts one MQTT client and answers its CONNECT with `return_code`
async fn accept_session(listener: &TcpListener, return_code: u8) -> TcpStream {
    let (mut socket, _) = listener.accept().await.expect("No client connected");

    let mut connect = [0u8; 512];
    let read = socket.read(&mut connect).await.expect("No CONNECT packet");
    assert!(read > 0);
    assert_eq!(connect[0], 0x10, "First packet should be CONNECT");

    socket
        .write_all(&[0x20, 0x02, 0x00, return_code])
        .await
        .expect("Cannot send CONNACK");

    socket
}

async fn read_all(mut socket: TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let _ = socket.read_to_end(&mut received).await;
    received
}

/// Accepts one MQTT client, answers its CONNECT with `return_code` and
/// returns everything the client sent afterwards.
async fn fake_broker(return_code: u8) -> Result<(u16, JoinHandle<Vec<u8>>), Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let handle = tokio::spawn(async move {
        let socket = accept_session(&listener, return_code).await;
        read_all(socket).await
    });

    Ok((port, handle))
}

/// Accepts a session and drops it right away, then accepts a second one and
/// returns everything the client sent on it.
async fn flaky_broker() -> Result<(u16, JoinHandle<Vec<u8>>), Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let handle = tokio::spawn(async move {
        drop(accept_session(&listener, 0).await);
        let socket = accept_session(&listener, 0).await;
        read_all(socket).await
    });

    Ok((port, handle))
}

async fn wait_for_state(
    broker: &MqttBroker,
    expected: ConnectionState,
) -> Result<(), Box<dyn Error>> {
    timeout(Duration::from_secs(5), async {
        while broker.state() != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn local_config(port: u16) -> Result<Configuration, Box<dyn Error>> {
    let mut conf = Configuration::load("conf/dht22-mqtt.conf")?;
    conf.mqtt.host = "127.0.0.1".to_string();
    conf.mqtt.port = port;
    conf.mqtt.sensor_name = "IT_DHT22".to_string();
    conf.mqtt.connect_timeout = 5;
    conf.sensor.settle_delay = 0;
    conf.daemon.enabled = false;
    Ok(conf)
}

#[test]
fn test_reference_config() -> Result<(), Box<dyn Error>> {
    let conf = Configuration::load("conf/dht22-mqtt.conf")?;

    assert_eq!(conf.mqtt.base_topic, "homeassistant");
    assert_eq!(conf.mqtt.keepalive, 60);
    assert!(conf.mqtt.sensor_name.ends_with("_dht22"));
    assert_eq!(conf.sensor.pin, 4);
    assert!(conf.daemon.enabled);
    assert_eq!(conf.daemon.period, 120);
    assert_eq!(conf.daemon.max_errors, 5);
    assert_eq!(conf.daemon.mode, PublishMode::Discovery);

    Ok(())
}

#[tokio::test]
async fn test_one_shot_over_mqtt() -> Result<(), Box<dyn Error>> {
    let (port, received) = fake_broker(0).await?;
    let conf = local_config(port)?;

    let broker = MqttBroker::connect(&conf.mqtt).await?;
    assert_eq!(broker.state(), ConnectionState::Connected);

    let mut daemon = Daemon::new(&conf, FixedSensor(21.5, 48.5), broker);
    daemon.run().await?;
    daemon.into_broker().disconnect().await;

    let received = timeout(Duration::from_secs(5), received).await??;

    // Topics and entity names are lower-cased
    assert!(contains(
        &received,
        b"homeassistant/sensor/it_dht22/it_dht22_temperature/config"
    ));
    assert!(contains(
        &received,
        b"homeassistant/sensor/it_dht22/it_dht22_humidity/config"
    ));
    assert!(contains(&received, b"\"name\":\"it_dht22 Temperature\""));
    assert!(contains(&received, b"homeassistant/sensor/it_dht22/state"));
    assert!(contains(
        &received,
        br#"{"temperature":21.5,"humidity":48.5}"#
    ));

    Ok(())
}

#[tokio::test]
async fn test_plain_over_mqtt() -> Result<(), Box<dyn Error>> {
    let (port, received) = fake_broker(0).await?;
    let mut conf = local_config(port)?;
    conf.mqtt.base_topic = "Home/LivingRoom".to_string();
    conf.daemon.mode = PublishMode::Plain;

    let broker = MqttBroker::connect(&conf.mqtt).await?;
    let mut daemon = Daemon::new(&conf, FixedSensor(19.5, 55.5), broker);
    daemon.run().await?;
    daemon.into_broker().disconnect().await;

    let received = timeout(Duration::from_secs(5), received).await??;

    assert!(contains(&received, b"home/livingroom/temperature19.5"));
    assert!(contains(&received, b"home/livingroom/humidity55.5"));
    assert!(!contains(&received, b"/config"));

    Ok(())
}

#[tokio::test]
async fn test_refused_connection() -> Result<(), Box<dyn Error>> {
    // 0x05: not authorized
    let (port, _received) = fake_broker(0x05).await?;
    let conf = local_config(port)?;

    match MqttBroker::connect(&conf.mqtt).await {
        Err(ConnectError::Refused(_)) => Ok(()),
        Err(e) => panic!("Unexpected error: {e}"),
        Ok(_) => panic!("Connection should have been refused"),
    }
}

#[tokio::test]
async fn test_reconnect_after_connection_lost() -> Result<(), Box<dyn Error>> {
    let (port, received) = flaky_broker().await?;
    let mut conf = local_config(port)?;
    conf.mqtt.reconnect_delay = 1;

    let broker = MqttBroker::connect(&conf.mqtt).await?;

    // The first session is closed by the broker
    wait_for_state(&broker, ConnectionState::Disconnected).await?;
    match broker.publish("dht22/test", "lost".to_string(), QoS::AtMostOnce, false) {
        Err(PublishError::NotConnected(ConnectionState::Disconnected)) => {}
        other => panic!("Publishing while disconnected should fail fast, got {other:?}"),
    }

    wait_for_state(&broker, ConnectionState::Connected).await?;
    broker.publish("dht22/test", "delivered".to_string(), QoS::AtMostOnce, false)?;
    broker.disconnect().await;

    let received = timeout(Duration::from_secs(5), received).await??;
    assert!(contains(&received, b"dht22/testdelivered"));
    assert!(!contains(&received, b"lost"));

    Ok(())
}
