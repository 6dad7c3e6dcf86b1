use crate::{Coordinates, Geocoder, LocateError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Geocoder backed by a Nominatim `/search` endpoint.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self, LocateError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| LocateError::Geocoder(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, LocateError> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(|err| LocateError::Geocoder(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LocateError::Geocoder(format!(
                "status {}",
                response.status()
            )));
        }
        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|err| LocateError::Geocoder(err.to_string()))?;
        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        let lat = hit
            .lat
            .parse()
            .map_err(|_| LocateError::Geocoder(format!("invalid latitude {}", hit.lat)))?;
        let lon = hit
            .lon
            .parse()
            .map_err(|_| LocateError::Geocoder(format!("invalid longitude {}", hit.lon)))?;
        Ok(Some(Coordinates { lat, lon }))
    }
}
