//! Metric registry and the topology → series projection.
//!
//! All series are gauges with last-value-wins semantics. The registry is
//! written by the poller and read concurrently by the metrics endpoint;
//! prometheus gauges store their value in an atomic, so scrapes never see a
//! torn value.

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ExporterError, Result};
use crate::topology::{Module, Station, Topology};

/// Labels of station-level series.
pub const STATION_LABELS: [&str; 6] = ["home", "station", "type", "city", "country", "timezone"];

/// Labels of sensor and module series.
pub const MODULE_LABELS: [&str; 4] = ["home", "station", "module", "type"];

/// Dashboard keys that carry timestamps rather than readings.
pub const DROPPED_KEYS: [&str; 4] = ["time_utc", "date_max_temp", "date_min_temp", "date_max_wind_str"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorKind {
    Gauge,
    Trend,
}

struct SensorDef {
    key: &'static str,
    name: &'static str,
    help: &'static str,
    kind: SensorKind,
}

const fn sensor(key: &'static str, name: &'static str, help: &'static str) -> SensorDef {
    SensorDef {
        key,
        name,
        help,
        kind: SensorKind::Gauge,
    }
}

const fn trend(key: &'static str, name: &'static str, help: &'static str) -> SensorDef {
    SensorDef {
        key,
        name,
        help,
        kind: SensorKind::Trend,
    }
}

/// Every dashboard key the exporter knows how to publish.
const SENSORS: &[SensorDef] = &[
    sensor("Temperature", "netatmo_temperature", "The current Temperature"),
    sensor("min_temp", "netatmo_temperature_min", "The current Min Temperature"),
    sensor("max_temp", "netatmo_temperature_max", "The current Max Temperature"),
    trend("temp_trend", "netatmo_temperature_trend", "The current Temperature Trend"),
    sensor("Humidity", "netatmo_humidity", "The current Humidity"),
    sensor("CO2", "netatmo_co2", "The current CO2"),
    sensor("Pressure", "netatmo_pressure", "The current Pressure"),
    trend("pressure_trend", "netatmo_pressure_trend", "The current Pressure Trend"),
    sensor("AbsolutePressure", "netatmo_absolute_pressure", "The current Absolute Pressure"),
    sensor("Noise", "netatmo_noise", "The current Noise"),
    sensor("WindAngle", "netatmo_wind_angle", "The current Wind Angle"),
    sensor("WindStrength", "netatmo_wind_strength", "The current Wind Strength"),
    sensor("max_wind_angle", "netatmo_wind_max_angle", "The current Wind Max Angle"),
    sensor("max_wind_str", "netatmo_wind_max_strength", "The current Wind Max Strength"),
    sensor("GustAngle", "netatmo_gust_angle", "The current Gust Angle"),
    sensor("GustStrength", "netatmo_gust_strength", "The current Gust Strength"),
    sensor("Rain", "netatmo_rain", "The current Rain"),
    sensor("sum_rain_1", "netatmo_rain_1h", "Rain over the last 1h"),
    sensor("sum_rain_24", "netatmo_rain_24h", "Rain over the last 24h"),
];

/// Direction indicator for temperature and pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    /// Parse `up`/`down`/`stable`, ignoring case.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Trend::Up),
            "down" => Some(Trend::Down),
            "stable" => Some(Trend::Stable),
            _ => None,
        }
    }

    pub fn value(self) -> f64 {
        match self {
            Trend::Up => 1.0,
            Trend::Down => -1.0,
            Trend::Stable => 0.0,
        }
    }
}

/// A single reading that could not be projected. Never aborts a cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProjectionError {
    #[error("unknown trend value {value:?} for {sensor}")]
    UnknownTrendValue { sensor: String, value: String },

    #[error("non-numeric value {value} for {sensor}")]
    NonNumeric { sensor: String, value: String },

    #[error("unknown sensor {0}")]
    UnknownSensor(String),
}

struct SensorHandle {
    gauge: GaugeVec,
    kind: SensorKind,
}

/// Process-lifetime metric context shared by the poller and the endpoint.
pub struct Metrics {
    registry: Registry,
    pub station_reachable: GaugeVec,
    pub station_altitude: GaugeVec,
    pub station_longitude: GaugeVec,
    pub station_latitude: GaugeVec,
    pub station_wifi_status: GaugeVec,
    pub station_co2_calibrating: GaugeVec,
    pub rf_status: GaugeVec,
    pub battery_vp: GaugeVec,
    pub battery_percent: GaugeVec,
    /// Keyed by upper-cased dashboard key.
    sensors: HashMap<String, SensorHandle>,
}

impl Metrics {
    /// Declare and register every series family.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let station = |name: &str, help: &str| register(&registry, name, help, &STATION_LABELS);
        let module = |name: &str, help: &str| register(&registry, name, help, &MODULE_LABELS);

        let mut sensors = HashMap::with_capacity(SENSORS.len());
        for def in SENSORS {
            sensors.insert(
                def.key.to_ascii_uppercase(),
                SensorHandle {
                    gauge: module(def.name, def.help)?,
                    kind: def.kind,
                },
            );
        }

        Ok(Self {
            station_reachable: station("netatmo_station_reachable", "If the station is reachable")?,
            station_altitude: station("netatmo_station_altitude", "The Altitude of the Station")?,
            station_longitude: station("netatmo_station_longitude", "The Longitude of the Station")?,
            station_latitude: station("netatmo_station_latitude", "The Latitude of the Station")?,
            station_wifi_status: station("netatmo_station_wifi_status", "The current Wifi Status")?,
            station_co2_calibrating: station(
                "netatmo_station_co2_calibrating",
                "The current CO2 Calibrating Status",
            )?,
            rf_status: module("netatmo_rf_status", "The current RF Status")?,
            battery_vp: module("netatmo_battery_vp", "The current Battery VP")?,
            battery_percent: module("netatmo_battery_percent", "The current Battery Percent")?,
            sensors,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Look up the series family for a dashboard key, ignoring case.
    pub fn sensor(&self, key: &str) -> Option<&GaugeVec> {
        self.sensors
            .get(&key.to_ascii_uppercase())
            .map(|handle| &handle.gauge)
    }

    /// Render every series in the text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ExporterError::Metrics(e.to_string()))
    }

    /// Number of labelled series currently held.
    pub fn series_count(&self) -> usize {
        self.registry
            .gather()
            .iter()
            .map(|family| family.get_metric().len())
            .sum()
    }
}

fn register(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Writes normalised topology into the registry.
#[derive(Clone)]
pub struct MetricProjector {
    metrics: Arc<Metrics>,
}

impl MetricProjector {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Project every station, returning the per-reading failures.
    pub fn project_all(&self, topology: &Topology) -> Vec<ProjectionError> {
        topology
            .iter()
            .flat_map(|(id, station)| self.project(id, station))
            .collect()
    }

    /// Project one station and its modules.
    ///
    /// Failed readings are logged and reported; the remaining readings,
    /// modules and stations are still written.
    pub fn project(&self, station_id: &str, station: &Station) -> Vec<ProjectionError> {
        log::debug!("Station Data ({}): {:?}", station_id, station);

        self.project_station_status(station);

        let mut errors = Vec::new();
        match &station.dashboard_data {
            Some(data) => {
                let labels = [
                    station.home_name.as_str(),
                    station.station_name.as_str(),
                    station.module_name.as_str(),
                    station.station_type.as_str(),
                ];
                errors.extend(self.project_readings(data, &labels));
            }
            None => log::debug!("Station {} reports no dashboard data", station_id),
        }

        for module in &station.modules {
            errors.extend(self.project_module(station, module));
        }

        for error in &errors {
            match error {
                ProjectionError::UnknownSensor(_) => log::debug!("Skipping reading: {}", error),
                _ => log::warn!("Skipping reading on station {}: {}", station_id, error),
            }
        }
        errors
    }

    fn project_station_status(&self, station: &Station) {
        let m = &self.metrics;
        let labels = [
            station.home_name.as_str(),
            station.station_name.as_str(),
            station.station_type.as_str(),
            station.place.city.as_str(),
            station.place.country.as_str(),
            station.place.timezone.as_str(),
        ];

        m.station_reachable
            .with_label_values(&labels)
            .set(bool_value(station.reachable));

        let optional = [
            (&m.station_altitude, station.place.altitude),
            (&m.station_longitude, station.place.longitude()),
            (&m.station_latitude, station.place.latitude()),
            (&m.station_wifi_status, station.wifi_status),
            (&m.station_co2_calibrating, station.co2_calibrating.map(bool_value)),
        ];
        for (gauge, value) in optional {
            if let Some(value) = value {
                gauge.with_label_values(&labels).set(value);
            }
        }
    }

    fn project_module(&self, station: &Station, module: &Module) -> Vec<ProjectionError> {
        log::debug!("Module Data: {:?}", module);
        let m = &self.metrics;
        let labels = [
            station.home_name.as_str(),
            station.station_name.as_str(),
            module.module_name.as_str(),
            module.module_type.as_str(),
        ];

        for (gauge, value) in [
            (&m.rf_status, module.rf_status),
            (&m.battery_vp, module.battery_vp),
            (&m.battery_percent, module.battery_percent),
        ] {
            if let Some(value) = value {
                gauge.with_label_values(&labels).set(value);
            }
        }

        match &module.dashboard_data {
            Some(data) => self.project_readings(data, &labels),
            None => Vec::new(),
        }
    }

    fn project_readings(&self, data: &Map<String, Value>, labels: &[&str; 4]) -> Vec<ProjectionError> {
        let mut errors = Vec::new();
        for (key, value) in data {
            if let Err(e) = self.project_reading(key, value, labels) {
                errors.push(e);
            }
        }
        errors
    }

    fn project_reading(
        &self,
        key: &str,
        value: &Value,
        labels: &[&str; 4],
    ) -> std::result::Result<(), ProjectionError> {
        if DROPPED_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) || value.is_null() {
            return Ok(());
        }

        let handle = self
            .metrics
            .sensors
            .get(&key.to_ascii_uppercase())
            .ok_or_else(|| ProjectionError::UnknownSensor(key.to_string()))?;

        let number = match handle.kind {
            SensorKind::Trend => value
                .as_str()
                .and_then(Trend::parse)
                .map(Trend::value)
                .ok_or_else(|| ProjectionError::UnknownTrendValue {
                    sensor: key.to_string(),
                    value: value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()),
                })?,
            SensorKind::Gauge => {
                numeric_value(value).ok_or_else(|| ProjectionError::NonNumeric {
                    sensor: key.to_string(),
                    value: value.to_string(),
                })?
            }
        };

        handle.gauge.with_label_values(labels).set(number);
        Ok(())
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(bool_value(*b)),
        _ => None,
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::normalize;
    use serde_json::json;

    fn projector() -> MetricProjector {
        MetricProjector::new(Arc::new(Metrics::new().unwrap()))
    }

    fn scenario() -> Topology {
        normalize(&[json!({
            "_id": "S1",
            "station_name": "Garden",
            "home_name": "Home",
            "module_name": "Indoor",
            "type": "NAMain",
            "place": {"city": "Essen", "country": "DE", "timezone": "Europe/Berlin", "location": [7.5, 51.2]},
            "dashboard_data": {"Temperature": 21.5, "temp_trend": "up"},
            "modules": [{
                "_id": "M1",
                "module_name": "Outdoor",
                "type": "NAModule1",
                "dashboard_data": {"Humidity": 55}
            }]
        })])
    }

    const STATION: [&str; 6] = ["Home", "Garden", "NAMain", "Essen", "DE", "Europe/Berlin"];
    const INDOOR: [&str; 4] = ["Home", "Garden", "Indoor", "NAMain"];
    const OUTDOOR: [&str; 4] = ["Home", "Garden", "Outdoor", "NAModule1"];

    #[test]
    fn test_trend_parse() {
        assert_eq!(Trend::parse("up").map(Trend::value), Some(1.0));
        assert_eq!(Trend::parse("DOWN").map(Trend::value), Some(-1.0));
        assert_eq!(Trend::parse("Stable").map(Trend::value), Some(0.0));
        assert_eq!(Trend::parse("sideways"), None);
    }

    #[test]
    fn test_sensor_lookup_ignores_case() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.sensor("Temperature").is_some());
        assert!(metrics.sensor("TEMPERATURE").is_some());
        assert!(metrics.sensor("absolutepressure").is_some());
        assert!(metrics.sensor("health_idx").is_none());
    }

    #[test]
    fn test_reference_scenario() {
        let projector = projector();
        let errors = projector.project_all(&scenario());
        assert!(errors.is_empty(), "{errors:?}");

        let m = projector.metrics();
        assert_eq!(m.station_longitude.with_label_values(&STATION).get(), 7.5);
        assert_eq!(m.station_latitude.with_label_values(&STATION).get(), 51.2);
        assert_eq!(m.sensor("Temperature").unwrap().with_label_values(&INDOOR).get(), 21.5);
        assert_eq!(m.sensor("temp_trend").unwrap().with_label_values(&INDOOR).get(), 1.0);
        assert_eq!(m.sensor("Humidity").unwrap().with_label_values(&OUTDOOR).get(), 55.0);
    }

    #[test]
    fn test_projection_is_idempotent() {
        let projector = projector();
        let topology = scenario();
        projector.project_all(&topology);
        let first = projector.metrics().encode().unwrap();
        let count = projector.metrics().series_count();

        projector.project_all(&topology);
        assert_eq!(projector.metrics().encode().unwrap(), first);
        assert_eq!(projector.metrics().series_count(), count);
    }

    #[test]
    fn test_unknown_trend_fails_single_reading() {
        let projector = projector();
        let topology = normalize(&[json!({
            "_id": "S1",
            "station_name": "Garden",
            "home_name": "Home",
            "module_name": "Indoor",
            "type": "NAMain",
            "place": {"city": "Essen", "country": "DE", "timezone": "Europe/Berlin"},
            "dashboard_data": {"Temperature": 19.0, "temp_trend": "sideways", "pressure_trend": "down"},
            "modules": [{"module_name": "Outdoor", "type": "NAModule1", "dashboard_data": {"Humidity": 60}}]
        })]);

        let errors = projector.project_all(&topology);
        assert_eq!(
            errors,
            vec![ProjectionError::UnknownTrendValue {
                sensor: "temp_trend".into(),
                value: "sideways".into()
            }]
        );

        let m = projector.metrics();
        assert_eq!(m.sensor("Temperature").unwrap().with_label_values(&INDOOR).get(), 19.0);
        assert_eq!(m.sensor("pressure_trend").unwrap().with_label_values(&INDOOR).get(), -1.0);
        assert_eq!(m.sensor("Humidity").unwrap().with_label_values(&OUTDOOR).get(), 60.0);
        let text = m.encode().unwrap();
        assert!(!text.contains("netatmo_temperature_trend{"));
    }

    #[test]
    fn test_dropped_and_unknown_keys() {
        let projector = projector();
        let topology = normalize(&[json!({
            "_id": "S1",
            "dashboard_data": {
                "time_utc": 1700000000,
                "date_max_temp": 1700000000,
                "date_min_temp": 1700000000,
                "date_max_wind_str": 1700000000,
                "health_idx": 1,
                "CO2": 600,
                "Pressure": "high"
            }
        })]);

        let errors = projector.project_all(&topology);
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ProjectionError::UnknownSensor("health_idx".into())));
        assert!(errors.iter().any(|e| matches!(e, ProjectionError::NonNumeric { sensor, .. } if sensor == "Pressure")));

        let text = projector.metrics().encode().unwrap();
        assert!(text.contains("netatmo_co2{"));
        assert!(!text.contains("time_utc"));
    }

    #[test]
    fn test_station_without_dashboard_still_projects_modules() {
        let projector = projector();
        let topology = normalize(&[json!({
            "_id": "S1",
            "station_name": "Garden",
            "home_name": "Home",
            "type": "NAMain",
            "reachable": false,
            "wifi_status": 60,
            "co2_calibrating": true,
            "place": {"city": "Essen", "country": "DE", "timezone": "Europe/Berlin", "altitude": 116},
            "modules": [{
                "module_name": "Outdoor",
                "type": "NAModule1",
                "rf_status": 70,
                "battery_vp": 5200,
                "battery_percent": 64,
                "dashboard_data": {"Temperature": 4.5}
            }]
        })]);
        assert!(projector.project_all(&topology).is_empty());

        let m = projector.metrics();
        assert_eq!(m.station_reachable.with_label_values(&STATION).get(), 0.0);
        assert_eq!(m.station_altitude.with_label_values(&STATION).get(), 116.0);
        assert_eq!(m.station_wifi_status.with_label_values(&STATION).get(), 60.0);
        assert_eq!(m.station_co2_calibrating.with_label_values(&STATION).get(), 1.0);
        assert_eq!(m.rf_status.with_label_values(&OUTDOOR).get(), 70.0);
        assert_eq!(m.battery_vp.with_label_values(&OUTDOOR).get(), 5200.0);
        assert_eq!(m.battery_percent.with_label_values(&OUTDOOR).get(), 64.0);
        assert_eq!(m.sensor("Temperature").unwrap().with_label_values(&OUTDOOR).get(), 4.5);
    }

    #[test]
    fn test_missing_coordinates_are_not_written() {
        let projector = projector();
        projector.project_all(&normalize(&[json!({"_id": "S1", "place": {"location": [7.5]}})]));

        let text = projector.metrics().encode().unwrap();
        assert!(text.contains("netatmo_station_longitude{"));
        assert!(!text.contains("netatmo_station_latitude{"));
        assert!(!text.contains("netatmo_station_altitude{"));
        assert!(text.contains("netatmo_station_reachable{"));
    }

    #[test]
    fn test_last_value_wins_and_stale_series_kept() {
        let projector = projector();
        let first = normalize(&[json!({
            "_id": "S1", "station_name": "Garden", "home_name": "Home", "module_name": "Indoor", "type": "NAMain",
            "dashboard_data": {"Temperature": 20.0, "Noise": 40}
        })]);
        let second = normalize(&[json!({
            "_id": "S1", "station_name": "Garden", "home_name": "Home", "module_name": "Indoor", "type": "NAMain",
            "dashboard_data": {"Temperature": 22.0}
        })]);
        projector.project_all(&first);
        projector.project_all(&second);

        let labels = ["Home", "Garden", "Indoor", "NAMain"];
        let m = projector.metrics();
        assert_eq!(m.sensor("Temperature").unwrap().with_label_values(&labels).get(), 22.0);
        assert_eq!(m.sensor("Noise").unwrap().with_label_values(&labels).get(), 40.0);
    }

    #[test]
    fn test_encode_exposition_format() {
        let projector = projector();
        projector.project_all(&scenario());
        let text = projector.metrics().encode().unwrap();
        assert!(text.contains("# TYPE netatmo_temperature gauge"));
        let humidity = text
            .lines()
            .find(|line| line.starts_with("netatmo_humidity{"))
            .unwrap();
        assert!(humidity.contains("module=\"Outdoor\""));
        assert!(humidity.contains("type=\"NAModule1\""));
        assert!(humidity.ends_with(" 55"));
    }
}
