use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("no meters configured")]
    NoMeters,
    #[error("MQTT credentials still set to 'CHANGE_ME', copy config.example.yaml and set real values")]
    PlaceholderCredentials,
    #[error("invalid OBIS code byte \"{token}\" in \"{code}\"")]
    InvalidObis { code: String, token: String },
}

fn mqtt_client_name_default() -> String { return "zaehler2mqtt".to_string() }
fn mqtt_user_default() -> String { return "".to_string() }
fn mqtt_pass_default() -> String { return "".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default="mqtt_user_default")]
    pub user: String,
    #[serde(default="mqtt_pass_default")]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

fn httpd_port_default() -> u16 { return 8080 }

#[derive(Deserialize, Serialize, Clone)]
pub struct HttpdConfig {
    #[serde(default="httpd_port_default")]
    pub port: u16,
}

fn httpd_default() -> HttpdConfig { return HttpdConfig { port: httpd_port_default() } }

fn value_string_default() -> String { return "".to_string() }
fn value_factor_default() -> f64 { return 1.0 }

#[derive(Deserialize, Serialize, Clone)]
pub struct ValueConfig {
    pub obis: String,
    pub name: String,
    #[serde(default="value_string_default")]
    pub device_class: String,
    #[serde(default="value_string_default")]
    pub state_class: String,
    #[serde(default="value_string_default")]
    pub unit: String,
    #[serde(default="value_factor_default")]
    pub factor: f64,
}

impl ValueConfig {
    /// Encodes the dotted OBIS string ("1.0.1.8.0" or a bare "42") into the
    /// byte sequence the decoder matches entries against.
    pub fn obis_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let mut result = Vec::new();
        for part in self.obis.split('.') {
            let byte = part.parse::<u8>().map_err(|_| ConfigError::InvalidObis {
                code: self.obis.clone(),
                token: part.to_string(),
            })?;
            result.push(byte);
        }
        return Ok(result);
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct MeterConfig {
    pub name: String,
    pub device: String,
    pub values: Vec<ValueConfig>,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default="httpd_default")]
    pub httpd: HttpdConfig,
    pub meters: Vec<MeterConfig>,
}

pub fn load(path: &str) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let mut config: Config = serde_yml::from_str(&contents)?;

    if config.mqtt.user == "CHANGE_ME" || config.mqtt.pass == "CHANGE_ME" {
        return Err(ConfigError::PlaceholderCredentials);
    }

    if config.meters.is_empty() {
        return Err(ConfigError::NoMeters);
    }

    for meter in config.meters.iter_mut() {
        for value in meter.values.iter_mut() {
            /* An unset factor deserializes as 0.0 when written out as `factor: 0`,
             * treat it the same as an omitted one. */
            if value.factor == 0.0 {
                value.factor = 1.0;
            }
        }
    }

    return Ok(config);
}
