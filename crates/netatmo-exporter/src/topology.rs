//! Normalised station/module topology.
//!
//! The device listing is loosely typed and fields come and go depending on
//! station model and firmware, so normalisation walks `serde_json::Value`
//! by hand: every missing or mistyped field degrades to its default, and the
//! walk itself never fails.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Label value for missing descriptive fields.
pub const UNKNOWN: &str = "Unknown";

/// Module types that describe the base station itself.
pub const BASE_STATION_TYPES: [&str; 2] = ["NAMain", "NAWifiStation"];

/// Geographic placement of a station.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Place {
    pub city: String,
    pub country: String,
    pub timezone: String,
    pub altitude: Option<f64>,
    /// `[longitude, latitude]` as sent by the API; may be short or empty.
    pub location: Vec<f64>,
}

impl Place {
    pub fn longitude(&self) -> Option<f64> {
        self.location.first().copied()
    }

    pub fn latitude(&self) -> Option<f64> {
        self.location.get(1).copied()
    }
}

/// A base weather unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: String,
    pub station_name: String,
    pub home_name: String,
    pub home_id: Option<String>,
    pub station_type: String,
    pub module_name: String,
    pub place: Place,
    pub wifi_status: Option<f64>,
    pub co2_calibrating: Option<bool>,
    pub reachable: bool,
    pub firmware: Option<i64>,
    pub date_setup: Option<i64>,
    pub last_setup: Option<i64>,
    pub last_status_store: Option<i64>,
    pub data_type: Vec<String>,
    pub dashboard_data: Option<Map<String, Value>>,
    pub modules: Vec<Module>,
}

/// A peripheral sensor unit attached to a station.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub id: Option<String>,
    pub module_name: String,
    pub module_type: String,
    pub battery_percent: Option<f64>,
    pub battery_vp: Option<f64>,
    pub rf_status: Option<f64>,
    pub reachable: bool,
    pub firmware: Option<i64>,
    pub last_setup: Option<i64>,
    pub last_message: Option<i64>,
    pub last_seen: Option<i64>,
    pub data_type: Vec<String>,
    pub dashboard_data: Option<Map<String, Value>>,
}

/// Stations keyed by id, in stable order.
pub type Topology = BTreeMap<String, Station>;

/// Build the station map from the raw device list.
///
/// Devices without an id are skipped together with their modules. A later
/// device with an already seen id replaces the earlier one.
pub fn normalize(devices: &[Value]) -> Topology {
    let mut stations = Topology::new();

    for device in devices {
        let Some(id) = str_field(device, "_id").filter(|id| !id.is_empty()) else {
            log::debug!("Skipping device without id");
            continue;
        };

        let mut station = station_from(id.clone(), device);
        station.modules = device
            .get("modules")
            .and_then(Value::as_array)
            .map(|modules| {
                modules
                    .iter()
                    .filter(|m| !is_base_station(m))
                    .map(module_from)
                    .collect()
            })
            .unwrap_or_default();

        stations.insert(id, station);
    }

    stations
}

fn is_base_station(module: &Value) -> bool {
    str_field(module, "type")
        .map(|t| BASE_STATION_TYPES.contains(&t.as_str()))
        .unwrap_or(false)
}

fn station_from(id: String, device: &Value) -> Station {
    Station {
        id,
        station_name: str_or_unknown(device, "station_name"),
        home_name: str_or_unknown(device, "home_name"),
        home_id: str_field(device, "home_id"),
        station_type: str_or_unknown(device, "type"),
        module_name: str_or_unknown(device, "module_name"),
        place: place_from(device.get("place")),
        wifi_status: f64_field(device, "wifi_status"),
        co2_calibrating: bool_field(device, "co2_calibrating"),
        reachable: bool_field(device, "reachable").unwrap_or(false),
        firmware: i64_field(device, "firmware"),
        date_setup: i64_field(device, "date_setup"),
        last_setup: i64_field(device, "last_setup"),
        last_status_store: i64_field(device, "last_status_store"),
        data_type: string_list(device, "data_type"),
        dashboard_data: object_field(device, "dashboard_data"),
        modules: Vec::new(),
    }
}

fn module_from(module: &Value) -> Module {
    Module {
        id: str_field(module, "_id"),
        module_name: str_or_unknown(module, "module_name"),
        module_type: str_or_unknown(module, "type"),
        battery_percent: f64_field(module, "battery_percent"),
        battery_vp: f64_field(module, "battery_vp"),
        rf_status: f64_field(module, "rf_status"),
        reachable: bool_field(module, "reachable").unwrap_or(false),
        firmware: i64_field(module, "firmware"),
        last_setup: i64_field(module, "last_setup"),
        last_message: i64_field(module, "last_message"),
        last_seen: i64_field(module, "last_seen"),
        data_type: string_list(module, "data_type"),
        dashboard_data: object_field(module, "dashboard_data"),
    }
}

fn place_from(place: Option<&Value>) -> Place {
    let Some(place) = place.filter(|p| p.is_object()) else {
        return Place {
            city: UNKNOWN.to_string(),
            country: UNKNOWN.to_string(),
            timezone: UNKNOWN.to_string(),
            ..Place::default()
        };
    };

    Place {
        city: str_or_unknown(place, "city"),
        country: str_or_unknown(place, "country"),
        timezone: str_or_unknown(place, "timezone"),
        altitude: f64_field(place, "altitude"),
        // Stop at the first non-number so indices keep their meaning
        location: place
            .get("location")
            .and_then(Value::as_array)
            .map(|coords| coords.iter().map_while(Value::as_f64).collect())
            .unwrap_or_default(),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn str_or_unknown(value: &Value, key: &str) -> String {
    str_field(value, key).unwrap_or_else(|| UNKNOWN.to_string())
}

fn f64_field(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(Value::as_f64)
}

fn i64_field(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

fn bool_field(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        _ => None,
    }
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn object_field(value: &Value, key: &str) -> Option<Map<String, Value>> {
    value.get(key).and_then(Value::as_object).cloned()
}
