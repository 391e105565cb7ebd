use chrono::{DateTime, Utc};

use crate::config::ValueConfig;
use crate::sml::ListEntry;

/// A scaled, named domain reading as produced from one decoded entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub unit: String,
    pub obis: String,
    pub metered_at: DateTime<Utc>,
}

/// Multiplies the decoded value by the configured factor and carries the
/// configured unit plus the formatted wire address along for diagnostics.
pub fn scale_entry(config: &ValueConfig, entry: &ListEntry) -> Reading {
    return Reading {
        value: entry.float() * config.factor,
        unit: config.unit.clone(),
        obis: entry.object_name(),
        metered_at: Utc::now(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sml::SmlValue;

    fn watt_value(factor: f64) -> ValueConfig {
        ValueConfig {
            obis: "1.0.16.7.0".to_string(),
            name: "Leistung".to_string(),
            device_class: "power".to_string(),
            state_class: "measurement".to_string(),
            unit: "W".to_string(),
            factor,
        }
    }

    #[test]
    fn test_scale_entry_applies_factor() {
        let entry = ListEntry {
            obis: vec![1, 0, 16, 7, 0, 0xFF],
            value: SmlValue::UInt(87824),
            scaler: Some(-1),
            unit: Some(30),
        };

        let reading = scale_entry(&watt_value(0.001), &entry);
        assert!((reading.value - 8.7824).abs() < 1e-9);
        assert_eq!(reading.unit, "W");
        assert_eq!(reading.obis, "1-0:16.7.0");
    }

    #[test]
    fn test_scale_entry_identity_factor() {
        let entry = ListEntry {
            obis: vec![1, 0, 16, 7, 0, 0xFF],
            value: SmlValue::Int(-250),
            scaler: None,
            unit: Some(30),
        };

        let reading = scale_entry(&watt_value(1.0), &entry);
        assert_eq!(reading.value, -250.0);
    }
}
