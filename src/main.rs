use log::{error, info};
use std::env;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use zaehler2mqtt::{api, config, MeterSupervisor, MqttManager, StateStore};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = env::var("Z2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config_path = env::args().nth(1).unwrap_or("config.yaml".to_string());
    let config = match config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {config_path}: {e}");
            std::process::exit(1);
        }
    };

    // Connect to the MQTT broker, no point starting the readers without it
    let (mut mqtt, mqtt_tx) = match MqttManager::connect(&config.mqtt).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("Failed to connect to MQTT broker: {e}");
            std::process::exit(1);
        }
    };

    let store = Arc::new(StateStore::new());

    // The status endpoint comes up before the first reader
    let server = api::status_server(store.clone(), config.httpd.port)?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let mqtt_task = tokio::spawn(async move {
        mqtt.start_thread().await;
    });

    // One reader task per meter, all sharing the shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    for meter_config in config.meters.iter() {
        let supervisor = MeterSupervisor::new(
            meter_config.clone(),
            store.clone(),
            mqtt_tx.clone(),
            shutdown_rx.clone(),
        );
        workers.push(tokio::spawn(supervisor.run()));
    }
    drop(mqtt_tx);
    drop(shutdown_rx);

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

    // The workers held the only senders, so the manager drains what is left
    // and disconnects
    let _ = mqtt_task.await;

    server_handle.stop(true).await;
    let _ = server_task.await;

    info!("Shutdown complete");
    Ok(())
}
