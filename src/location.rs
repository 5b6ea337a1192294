//! Check-in location capture.
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LocationError {
    #[error("latitude {0} is outside -90..=90")]
    Latitude(f64),
    #[error("longitude {0} is outside -180..=180")]
    Longitude(f64),
    #[error("no location available: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, LocationError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(LocationError::Latitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(LocationError::Longitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Display address stored on the record; no reverse geocoding.
    pub fn address(&self) -> String {
        format!("{:.4}, {:.4}", self.latitude, self.longitude)
    }
}

/// Picks the location text for a check-in: coordinates win over free text,
/// free text over the project's site address.
pub fn resolve_location(
    coords: Option<(f64, f64)>,
    text: Option<&str>,
    fallback: Option<&str>,
) -> Result<String, LocationError> {
    if let Some((lat, lon)) = coords {
        return Ok(Coordinates::new(lat, lon)?.address());
    }
    if let Some(t) = text.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(t.to_string());
    }
    fallback
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| LocationError::Unavailable("no coordinates, text or site address".into()))
}
