use serde::Serialize;

use crate::config::ValueConfig;

fn is_none_str(value: &String) -> bool {
    return value.is_empty();
}

#[derive(Serialize)]
pub struct HaDevice {
    identifiers: Vec<String>,
    name: String,
    manufacturer: String,
    model: String,
}

/// Home Assistant MQTT discovery payload for one meter value. Published
/// retained so HA picks sensors up after its own restarts.
#[derive(Serialize)]
pub struct HaDiscovery {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    pub value_template: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub unit_of_measurement: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub state_class: String,
    pub device: HaDevice,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaDiscovery {
    pub fn new(meter_name: &str, sensor_id: &str, value: &ValueConfig) -> Self {
        return HaDiscovery {
            discover_topic: format!("homeassistant/sensor/{sensor_id}/config"),
            name: value.name.clone(),
            unique_id: sensor_id.to_string(),
            state_topic: format!("zaehler2mqtt/{}/{}/state", meter_name, value.name),
            value_template: "{{ value }}".to_string(),
            device_class: value.device_class.clone(),
            unit_of_measurement: value.unit.clone(),
            state_class: value.state_class.clone(),
            device: HaDevice {
                identifiers: vec![format!("zaehler2mqtt_{meter_name}")],
                name: meter_name.to_string(),
                manufacturer: "zaehler2mqtt".to_string(),
                model: "SML Meter Reader".to_string(),
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bezug() -> ValueConfig {
        ValueConfig {
            obis: "1.0.1.8.0".to_string(),
            name: "Bezug".to_string(),
            device_class: "energy".to_string(),
            state_class: "total_increasing".to_string(),
            unit: "kWh".to_string(),
            factor: 1.0,
        }
    }

    #[test]
    fn test_discovery_payload_shape() {
        let discovery = HaDiscovery::new("haus", "zaehler2mqtt_haus_Bezug", &bezug());
        assert_eq!(discovery.discover_topic, "homeassistant/sensor/zaehler2mqtt_haus_Bezug/config");

        let json = serde_json::to_value(&discovery).unwrap();
        assert_eq!(json["name"], "Bezug");
        assert_eq!(json["unique_id"], "zaehler2mqtt_haus_Bezug");
        assert_eq!(json["state_topic"], "zaehler2mqtt/haus/Bezug/state");
        assert_eq!(json["value_template"], "{{ value }}");
        assert_eq!(json["device_class"], "energy");
        assert_eq!(json["state_class"], "total_increasing");
        assert_eq!(json["unit_of_measurement"], "kWh");
        assert_eq!(json["device"]["name"], "haus");
        assert_eq!(json["device"]["manufacturer"], "zaehler2mqtt");
        assert_eq!(json["device"]["model"], "SML Meter Reader");
        assert_eq!(json["device"]["identifiers"][0], "zaehler2mqtt_haus");
        // The publish topic never leaks into the payload
        assert!(json.get("discover_topic").is_none());
    }

    #[test]
    fn test_discovery_skips_empty_optional_fields() {
        let mut value = bezug();
        value.state_class = "".to_string();
        value.device_class = "".to_string();

        let discovery = HaDiscovery::new("haus", "zaehler2mqtt_haus_Bezug", &value);
        let json = serde_json::to_value(&discovery).unwrap();

        assert!(json.get("state_class").is_none());
        assert!(json.get("device_class").is_none());
        assert_eq!(json["unit_of_measurement"], "kWh");
    }
}
