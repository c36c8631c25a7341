//! Cell-tower geolocation client
//!
//! HTTP client for the Unwired Labs location API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Serving cell reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellTower {
    pub mcc: i64,
    pub mnc: i64,
    pub lac: i64,
    pub cid: i64,
}

impl CellTower {
    /// Extract `cell_info.cell_towers` from an event's details
    pub fn from_details(details: &Value) -> Option<Self> {
        let towers = details.get("cell_info")?.get("cell_towers")?;
        serde_json::from_value(towers.clone()).ok()
    }
}

/// A resolved position
#[derive(Debug, Clone, PartialEq)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub address: Option<String>,
}

/// Resolves cell identifiers to coordinates
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self, tower: &CellTower) -> Result<GeoFix, EnrichmentError>;
}

/// Configuration for the Unwired Labs client
#[derive(Debug, Clone)]
pub struct UnwiredLabsConfig {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    token: &'a str,
    radio: &'static str,
    mcc: i64,
    mnc: i64,
    cells: [Cell; 1],
    address: u8,
}

#[derive(Serialize)]
struct Cell {
    lac: i64,
    cid: i64,
}

#[derive(Deserialize)]
struct ProcessResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    accuracy: Option<f64>,
    #[serde(default)]
    address: Option<String>,
}

impl ProcessResponse {
    fn into_fix(self) -> Result<GeoFix, EnrichmentError> {
        if self.status != "ok" {
            return Err(EnrichmentError::Rejected(
                self.message.unwrap_or_else(|| format!("status {}", self.status)),
            ));
        }
        match (self.lat, self.lon) {
            (Some(latitude), Some(longitude)) => Ok(GeoFix {
                latitude,
                longitude,
                accuracy: self.accuracy,
                address: self.address,
            }),
            _ => Err(EnrichmentError::InvalidResponse(
                "missing coordinates".to_string(),
            )),
        }
    }
}

/// Unwired Labs `process.php` client
pub struct UnwiredLabsResolver {
    client: Client,
    config: UnwiredLabsConfig,
}

impl UnwiredLabsResolver {
    pub fn new(config: UnwiredLabsConfig) -> Result<Self, EnrichmentError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(EnrichmentError::Request)?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl GeoResolver for UnwiredLabsResolver {
    async fn resolve(&self, tower: &CellTower) -> Result<GeoFix, EnrichmentError> {
        let body = ProcessRequest {
            token: &self.config.token,
            radio: "gsm",
            mcc: tower.mcc,
            mnc: tower.mnc,
            cells: [Cell {
                lac: tower.lac,
                cid: tower.cid,
            }],
            address: 1,
        };

        let response = self
            .client
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EnrichmentError::Timeout
                } else if e.is_connect() {
                    EnrichmentError::Unavailable
                } else {
                    EnrichmentError::Request(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EnrichmentError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ProcessResponse = response
            .json()
            .await
            .map_err(|e| EnrichmentError::InvalidResponse(e.to_string()))?;

        parsed.into_fix()
    }
}

/// Errors that can occur while enriching a location event
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("Geolocation service unavailable")]
    Unavailable,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Request timeout")]
    Timeout,

    /// The service answered but could not resolve the cell
    #[error("Lookup rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to store location: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_tower_from_details() {
        let details = json!({
            "cell_info": {"cell_towers": {"mcc": 404, "mnc": 45, "lac": 1234, "cid": 56789}}
        });
        let tower = CellTower::from_details(&details).unwrap();
        assert_eq!(
            tower,
            CellTower {
                mcc: 404,
                mnc: 45,
                lac: 1234,
                cid: 56789
            }
        );
    }

    #[test]
    fn test_cell_tower_missing_or_partial() {
        assert!(CellTower::from_details(&json!({})).is_none());
        assert!(CellTower::from_details(&json!({"cell_info": {}})).is_none());
        assert!(
            CellTower::from_details(&json!({"cell_info": {"cell_towers": {"mcc": 404}}})).is_none()
        );
    }

    #[test]
    fn test_request_body_shape() {
        let body = ProcessRequest {
            token: "t",
            radio: "gsm",
            mcc: 404,
            mnc: 45,
            cells: [Cell { lac: 1, cid: 2 }],
            address: 1,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({"token": "t", "radio": "gsm", "mcc": 404, "mnc": 45,
                   "cells": [{"lac": 1, "cid": 2}], "address": 1})
        );
    }

    #[test]
    fn test_response_ok() {
        let response: ProcessResponse = serde_json::from_value(json!({
            "status": "ok", "lat": 19.07, "lon": 72.87, "accuracy": 600, "address": "Mumbai"
        }))
        .unwrap();
        let fix = response.into_fix().unwrap();
        assert_eq!(fix.latitude, 19.07);
        assert_eq!(fix.accuracy, Some(600.0));
        assert_eq!(fix.address.as_deref(), Some("Mumbai"));
    }

    #[test]
    fn test_response_error_status() {
        let response: ProcessResponse = serde_json::from_value(json!({
            "status": "error", "message": "No matches found"
        }))
        .unwrap();
        assert!(matches!(
            response.into_fix(),
            Err(EnrichmentError::Rejected(m)) if m == "No matches found"
        ));
    }
}
