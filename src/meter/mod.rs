pub mod stream;

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;

use crate::config::MeterConfig;
use crate::mqtt::ha_interface::HaDiscovery;
use crate::mqtt::Transmission;
use crate::pipeline;
use crate::sml::SmlDecoder;
use crate::state::StateStore;
use self::stream::{DeviceStream, StreamGuard};

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Owns one meter's connection lifecycle: configure the line, open the
/// device, stream SML telegrams, retry on failure, stop on shutdown. Exactly
/// one supervisor runs per configured meter.
pub struct MeterSupervisor {
    config: MeterConfig,
    store: Arc<StateStore>,
    mqtt: Sender<Transmission>,
    shutdown: watch::Receiver<bool>,
}

impl MeterSupervisor {
    pub fn new(
        config: MeterConfig,
        store: Arc<StateStore>,
        mqtt: Sender<Transmission>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        return MeterSupervisor { config, store, mqtt, shutdown };
    }

    pub async fn run(mut self) {
        info!("[{}] Starting meter reader on {}", self.config.name, self.config.device);
        self.store.register_meter(&self.config.name, &self.config.device);

        loop {
            if self.cancelled() {
                return;
            }

            if let Err(e) = configure_serial(&self.config.device).await {
                warn!("[{}] Failed to configure serial: {e}", self.config.name);
                if self.backoff().await {
                    return;
                }
                continue;
            }

            let guard = match StreamGuard::open(&self.config.device) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("[{}] Failed to open device: {e}", self.config.name);
                    if self.backoff().await {
                        return;
                    }
                    continue;
                }
            };

            let decoder = self.build_decoder();
            self.announce_discovery().await;

            info!("[{}] Reading SML data from {}", self.config.name, self.config.device);

            // The decode call has no cancellation of its own, so a watcher
            // releases the stream the moment shutdown is requested.
            let mut shutdown_rx = self.shutdown.clone();
            let watch_guard = guard.clone();
            let watcher = tokio::spawn(async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                watch_guard.shutdown();
            });

            let read_guard = guard.clone();
            let result =
                tokio::task::spawn_blocking(move || decoder.read(DeviceStream::new(read_guard)))
                    .await;

            watcher.abort();
            guard.shutdown();

            if self.cancelled() {
                info!("[{}] Shutting down", self.config.name);
                return;
            }

            match result {
                Ok(Err(e)) => warn!(
                    "[{}] Read error: {e}, restarting in {}s",
                    self.config.name,
                    RETRY_DELAY.as_secs()
                ),
                Ok(Ok(())) => warn!(
                    "[{}] Stream ended, restarting in {}s",
                    self.config.name,
                    RETRY_DELAY.as_secs()
                ),
                Err(e) => error!("[{}] Decode task failed: {e}", self.config.name),
            }

            if self.backoff().await {
                return;
            }
        }
    }

    fn cancelled(&self) -> bool {
        return *self.shutdown.borrow();
    }

    /// Waits out the retry delay. Returns true when shutdown was requested,
    /// either before or during the wait.
    async fn backoff(&mut self) -> bool {
        let sleep = tokio::time::sleep(RETRY_DELAY);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return self.cancelled(),
                result = self.shutdown.changed() => {
                    if result.is_err() || *self.shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    /// Builds the per-value decode callbacks. A malformed OBIS code skips that
    /// value, its siblings stay registered.
    fn build_decoder(&self) -> SmlDecoder {
        let mut decoder = SmlDecoder::new();

        for value in self.config.values.iter() {
            let obis = match value.obis_bytes() {
                Ok(obis) => obis,
                Err(e) => {
                    warn!("[{}] Invalid OBIS code {}: {e}", self.config.name, value.obis);
                    continue;
                }
            };

            let meter_name = self.config.name.clone();
            let value = value.clone();
            let store = self.store.clone();
            let mqtt = self.mqtt.clone();
            decoder.register(obis, move |entry| {
                let reading = pipeline::scale_entry(&value, entry);
                // A full channel means the broker side is behind, the next
                // reading supersedes this one anyway.
                let _ = mqtt.try_send(Transmission::State {
                    meter: meter_name.clone(),
                    name: value.name.clone(),
                    value: reading.value,
                });
                store.update_value(&meter_name, &value.name, &reading);
            });
        }

        return decoder;
    }

    /// Announces every configured value to Home Assistant. Repeated on each
    /// reconnect, the retained config topics make this idempotent.
    async fn announce_discovery(&self) {
        for value in self.config.values.iter() {
            let sensor_id = format!("zaehler2mqtt_{}_{}", self.config.name, value.name);
            let discovery = HaDiscovery::new(&self.config.name, &sensor_id, value);
            let _ = self.mqtt.send(Transmission::Discovery(discovery)).await;
        }
    }
}

/// Sets the fixed SML line parameters: 9600 baud, 8 data bits, no parity, one
/// stop bit, raw mode.
async fn configure_serial(device: &str) -> std::io::Result<()> {
    let output = Command::new("stty")
        .args(["-F", device, "9600", "cs8", "-cstopb", "-parenb", "raw"])
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("stty exited with {}: {}", output.status, stderr.trim()),
        ));
    }

    return Ok(());
}
