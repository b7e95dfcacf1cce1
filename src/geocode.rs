use anyhow::{Context, Result};
use geo::Point;
use serde::Deserialize;

use crate::config::GeocoderConfig;

/// Result of an address lookup. An empty Nominatim response is not an error;
/// the caller surfaces the not-found notice and leaves the map center alone.
#[derive(Debug, Clone, PartialEq)]
pub enum GeocodeOutcome {
    Found(Point<f64>),
    NotFound,
}

pub struct Geocoder {
    client: reqwest::Client,
    endpoint: String,
}

/// Nominatim returns lat/lon as strings.
#[derive(Debug, Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
}

impl NominatimHit {
    fn position(&self) -> Result<Point<f64>> {
        let lat: f64 = self
            .lat
            .parse()
            .with_context(|| format!("Geocoder returned unparsable latitude: {}", self.lat))?;
        let lon: f64 = self
            .lon
            .parse()
            .with_context(|| format!("Geocoder returned unparsable longitude: {}", self.lon))?;
        Ok(Point::new(lon, lat))
    }
}

impl Geocoder {
    pub fn new(client: reqwest::Client, config: &GeocoderConfig) -> Self {
        Geocoder { client, endpoint: config.endpoint.clone() }
    }

    /// Looks an address up, taking the first hit. Single attempt, no retry;
    /// network and parse failures bubble up as errors.
    pub async fn search(&self, address: &str) -> Result<GeocodeOutcome> {
        let hits: Vec<NominatimHit> = self
            .client
            .get(&self.endpoint)
            .query(&[("format", "json"), ("q", address)])
            .send()
            .await
            .context("Geocoding request failed")?
            .error_for_status()
            .context("Geocoding request rejected")?
            .json()
            .await
            .context("Failed to parse geocoding response")?;

        outcome_from_hits(hits)
    }
}

fn outcome_from_hits(hits: Vec<NominatimHit>) -> Result<GeocodeOutcome> {
    match hits.first() {
        Some(hit) => Ok(GeocodeOutcome::Found(hit.position()?)),
        None => Ok(GeocodeOutcome::NotFound),
    }
}
