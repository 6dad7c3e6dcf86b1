//! Turns an incident record from the dispatch feed into map parameters.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

pub mod highway;
pub mod nominatim;

pub use highway::{normalize_marker, HighwayTable};
pub use nominatim::NominatimGeocoder;

pub const DEFAULT_ZOOM: u8 = 17;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocateError {
    #[error("incident record has unexpected shape: {0}")]
    Shape(String),
    #[error("no highway marker for km {0}")]
    UnknownMarker(String),
    #[error("address not found: {0}")]
    NotFound(String),
    #[error("geocoder failed: {0}")]
    Geocoder(String),
    #[error("highway table error: {0}")]
    Table(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapParams {
    pub lat: f64,
    pub lon: f64,
    pub zoom: u8,
}

impl fmt::Display for MapParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/?lat={}&lon={}&zoom={}", self.lat, self.lon, self.zoom)
    }
}

/// Address to coordinates lookup.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, LocateError>;
}

/// Address fields of one `EinsatzData` entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IncidentAddress {
    #[serde(rename = "Strasse")]
    pub street: String,
    #[serde(rename = "Nummer1")]
    pub number1: String,
    #[serde(rename = "Nummer2")]
    pub number2: String,
    #[serde(rename = "Nummer3")]
    pub number3: String,
    #[serde(rename = "Plz")]
    pub postal_code: String,
    #[serde(rename = "Ort")]
    pub town: String,
}

impl IncidentAddress {
    pub fn from_record(record: &Value) -> Result<Self, LocateError> {
        Self::deserialize(record).map_err(|err| LocateError::Shape(err.to_string()))
    }

    /// `"<Plz> <Ort>, <Strasse> <Nummer1> <Nummer2> <Nummer3>"` with empty parts dropped.
    pub fn postal_address(&self) -> String {
        let mut street = vec![self.street.trim().to_string()];
        for number in [&self.number1, &self.number2, &self.number3] {
            street.push(strip_integer_suffix(number).to_string());
        }
        let street = street
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} {}, {}",
            self.postal_code.trim(),
            self.town.trim(),
            street
        )
    }
}

pub fn strip_integer_suffix(number: &str) -> &str {
    let number = number.trim();
    number.strip_suffix(".000").unwrap_or(number)
}

pub struct AddressResolver {
    highway_name: String,
    highway: HighwayTable,
    geocoder: Arc<dyn Geocoder>,
    zoom: u8,
}

impl AddressResolver {
    pub fn new(
        highway_name: impl Into<String>,
        highway: HighwayTable,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        Self {
            highway_name: highway_name.into(),
            highway,
            geocoder,
            zoom: DEFAULT_ZOOM,
        }
    }

    pub fn with_zoom(mut self, zoom: u8) -> Self {
        self.zoom = zoom;
        self
    }

    /// Resolves `record`; every failure is logged and returned, never raised further.
    pub async fn resolve(&self, record: &Value) -> Result<MapParams, LocateError> {
        let result = self.resolve_inner(record).await;
        match &result {
            Ok(params) => info!(event = "map_params", params = %params),
            Err(LocateError::Shape(reason)) => {
                error!(event = "incident_shape_error", reason = %reason, record = %record);
            }
            Err(err) => error!(event = "map_resolve_failed", error = %err),
        }
        result
    }

    async fn resolve_inner(&self, record: &Value) -> Result<MapParams, LocateError> {
        let street = record_text(record, "Strasse")?;
        let coordinates = if self.is_highway(street) {
            let km = record_text(record, "Nummer1")?;
            debug!(event = "highway_incident", highway = %self.highway_name, km = %km);
            self.highway.lookup(km)?
        } else {
            let query = IncidentAddress::from_record(record)?.postal_address();
            debug!(event = "geocode_request", address = %query);
            self.geocoder
                .geocode(&query)
                .await?
                .ok_or(LocateError::NotFound(query))?
        };
        Ok(MapParams {
            lat: coordinates.lat,
            lon: coordinates.lon,
            zoom: self.zoom,
        })
    }

    fn is_highway(&self, street: &str) -> bool {
        !self.highway_name.is_empty() && street.contains(&self.highway_name)
    }
}

fn record_text<'a>(record: &'a Value, key: &str) -> Result<&'a str, LocateError> {
    record
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| LocateError::Shape(format!("missing field `{key}`")))
}
