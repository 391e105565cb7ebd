use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::pipeline::Reading;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MeterValue {
    pub value: f64,
    pub unit: String,
    pub obis: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterState {
    pub device: String,
    pub last_update: Option<DateTime<Utc>>,
    pub values: HashMap<String, MeterValue>,
}

/// Authoritative latest-reading snapshot across all meters, shared between
/// the meter workers (writers) and the status endpoint (reader).
pub struct StateStore {
    meters: RwLock<HashMap<String, MeterState>>,
}

impl StateStore {
    pub fn new() -> Self {
        return StateStore { meters: RwLock::new(HashMap::new()) };
    }

    /// Creates an empty snapshot entry for the meter. Safe to call repeatedly,
    /// an existing entry and its values are left untouched.
    pub fn register_meter(&self, name: &str, device: &str) {
        let mut meters = self.meters.write().unwrap();
        meters.entry(name.to_string()).or_insert_with(|| MeterState {
            device: device.to_string(),
            last_update: None,
            values: HashMap::new(),
        });
    }

    /// Replaces the stored reading for (meter, value name). Updates for meters
    /// that were never registered are discarded.
    pub fn update_value(&self, meter: &str, value_name: &str, reading: &Reading) {
        let mut meters = self.meters.write().unwrap();
        let state = match meters.get_mut(meter) {
            Some(state) => state,
            None => return,
        };

        state.last_update = Some(reading.metered_at);
        state.values.insert(
            value_name.to_string(),
            MeterValue {
                value: reading.value,
                unit: reading.unit.clone(),
                obis: reading.obis.clone(),
            },
        );
    }

    /// Self-consistent copy of all meter states, safe to serialize while
    /// updates continue.
    pub fn snapshot(&self) -> HashMap<String, MeterState> {
        return self.meters.read().unwrap().clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn reading(value: f64) -> Reading {
        Reading {
            value,
            unit: "kWh".to_string(),
            obis: "1-0:1.8.0".to_string(),
            metered_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let store = StateStore::new();
        store.register_meter("haus", "/dev/ttyUSB0");
        store.update_value("haus", "Bezug", &reading(8782.4));

        store.register_meter("haus", "/dev/ttyUSB0");

        let snapshot = store.snapshot();
        assert_eq!(snapshot["haus"].values["Bezug"].value, 8782.4);
    }

    #[test]
    fn test_update_unregistered_meter_is_discarded() {
        let store = StateStore::new();
        store.update_value("phantom", "Bezug", &reading(1.0));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_update_replaces_value() {
        let store = StateStore::new();
        store.register_meter("haus", "/dev/ttyUSB0");

        store.update_value("haus", "Leistung", &reading(100.0));
        store.update_value("haus", "Leistung", &reading(250.0));

        let snapshot = store.snapshot();
        assert_eq!(snapshot["haus"].values.len(), 1);
        assert_eq!(snapshot["haus"].values["Leistung"].value, 250.0);
        assert!(snapshot["haus"].last_update.is_some());
    }

    #[test]
    fn test_concurrent_updates_for_different_meters() {
        let store = Arc::new(StateStore::new());
        store.register_meter("a", "/dev/ttyUSB0");
        store.register_meter("b", "/dev/ttyUSB1");

        let mut handles = Vec::new();
        for (meter, base) in [("a", 0.0), ("b", 10_000.0)] {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    store.update_value(meter, "Bezug", &reading(base + i as f64));
                    // A snapshot taken mid-write must never tear
                    let snapshot = store.snapshot();
                    if let Some(v) = snapshot[meter].values.get("Bezug") {
                        assert_eq!(v.unit, "kWh");
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot["a"].values["Bezug"].value, 499.0);
        assert_eq!(snapshot["b"].values["Bezug"].value, 10_499.0);
    }
}
