use dht22_mqtt::broker::MqttBroker;
use dht22_mqtt::configuration::{Configuration, utf8_vars};
use dht22_mqtt::daemon::Daemon;
use dht22_mqtt::sensor::IioSensor;
use log::{error, info};
use std::process;
use tokio::signal::unix::{self, SignalKind};

const DEFAULT_CONFIG_PATH: &str = "/etc/dht22-mqtt.conf";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => path.as_str(),
        None => DEFAULT_CONFIG_PATH,
    };

    let mut config = Configuration::load(config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration {config_path}: {e}");
        process::exit(2)
    });
    if let Err(e) = config.apply_env(utf8_vars(std::env::vars_os())) {
        eprintln!("Failed to load configuration from the environment: {e}");
        process::exit(2)
    }

    stderrlog::new()
        .module(module_path!())
        .verbosity(config.log_verbosity)
        .init()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(2)
        });

    info!("Initializing DHT22 on GPIO pin {}", config.sensor.pin);
    let sensor = IioSensor::open(&config.sensor).unwrap_or_else(|e| {
        error!("Failed to initialize the sensor: {e}");
        process::exit(1)
    });

    let broker = MqttBroker::connect(&config.mqtt).await.unwrap_or_else(|e| {
        error!(
            "MQTT connection to {}:{} failed, please check the configuration: {e}",
            config.mqtt.host, config.mqtt.port
        );
        process::exit(1)
    });

    let mut daemon = Daemon::new(&config, sensor, broker);

    let result = tokio::select! {
        result = daemon.run() => result,
        _ = shutdown() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    daemon.into_broker().disconnect().await;

    match result {
        Ok(()) => info!("Execution ended"),
        Err(e) => {
            error!("{e}");
            process::exit(1)
        }
    }
}

/// Returns after the first SIGTERM or SIGINT received by this process
async fn shutdown() {
    let terminate = async {
        match unix::signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = terminate => {},
        _ = tokio::signal::ctrl_c() => {},
    }
}
