//! Geolocation Enrichment
//!
//! Resolves the serving cell tower of LOCATION events to coordinates and
//! keeps one `DeviceLocation` row per device up to date.
//!
//! - **client**: `GeoResolver` trait and the Unwired Labs implementation
//! - **enricher**: bounded, tracked background lookups

mod client;
mod enricher;

pub use client::{
    CellTower, EnrichmentError, GeoFix, GeoResolver, UnwiredLabsConfig, UnwiredLabsResolver,
};
pub use enricher::{enrich, Enricher};
