//! Quick HN Library - Core of the open address-point house number importer
//!
//! This library overlays open address-point data onto a map editor and helps attach house
//! numbers to road segments. The interesting parts are not the UI glue but three coupled
//! subsystems:
//!
//! # Architecture
//!
//! - **[`SpatialRepository`]**: Sparse tile cache that lazily and concurrently loads address
//!   features from every registered [`SourceAdapter`], coalesces in-flight loads, deduplicates
//!   results and evicts far-away tiles
//! - **[`IngestionPipeline`]**: Reduces GeoJSON, KML, KMZ, GPX, GML, WKT and ZIP uploads in
//!   arbitrary reference systems to the canonical [`Feature`] schema
//! - **[`SegmentMatcher`]**: Resolves an address point to the best road segment, with a
//!   confirmation fallback when the street name cannot be found
//! - **[`Session`]**: Orchestrator wiring host notifications to the components above
//!
//! Leaf helpers live in [`utils`] (geometry), [`projection`] (reference systems) and
//! [`normalize`] (street names and house numbers).

mod config;
mod feature;
pub mod host;
pub mod ingest;
mod matcher;
pub mod normalize;
pub mod projection;
mod repository;
mod session;
pub mod source;
pub mod storage;
mod style;
pub mod utils;

// Public API exports
pub use config::{Config, LalitpurConfig};
pub use feature::{AddressProperties, AddressType, DedupKey, Feature, FeatureId};
pub use ingest::{AttributeMapping, FileFormat, ImportResult, IngestError, IngestionPipeline};
pub use matcher::{
    Confirmation, ConfirmationRequest, Confirmer, DecisionCache, MatchOutcome, MatchResult,
    SegmentMatcher,
};
pub use repository::{CullReport, SpatialRepository, TileCoord};
pub use session::{Session, StreetIndex};
pub use source::{SourceAdapter, SourceError};
pub use storage::{DatasetKind, DatasetStore, StorageError};
pub use style::{FeatureStyle, feature_style};

/// Top-level error type of the library
#[derive(Debug, thiserror::Error)]
pub enum QuickHnError {
    #[error("Ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("Source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Projection failed: {0}")]
    Projection(#[from] projection::ProjectionError),

    #[error("Host rejected the edit: {0}")]
    Host(#[from] host::HostError),

    #[error("House number must not be empty (feature {0})")]
    EmptyHouseNumber(String),
}

pub type Result<T> = std::result::Result<T, QuickHnError>;
