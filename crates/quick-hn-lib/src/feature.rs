//! Canonical address-point model
//!
//! Every source (uploaded files, URL datasets, remote providers) is reduced to [`Feature`]
//! at the ingestion boundary. Past that boundary nothing looks at raw property bags again.

use crate::{QuickHnError, Result};
use geo::Point;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session-unique feature identifier
///
/// Encodes provenance: `file-{stem}-{index}` for uploads, `np-{gid}` for the Lalitpur
/// provider, `{prefix}-{id}` for generic providers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle status of an address as reported by its source
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Active,
    Planned,
}

/// Canonical address properties
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressProperties {
    /// Normalized street name, empty when the name is unknown
    pub street: String,
    /// Street name exactly as found in the source
    pub street_original: String,
    /// House number as displayed, never empty
    pub number: String,
    pub municipality: String,
    #[serde(rename = "type", default)]
    pub kind: AddressType,
    /// Optional secondary-language text (Devanagari street or tole name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nepali_text: Option<String>,
}

/// A single address point in WGS84 degrees
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    /// `(lon, lat)` in degrees
    pub point: Point<f64>,
    pub properties: AddressProperties,
}

/// Composite key used to collapse duplicate address records
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub municipality: String,
    pub street: String,
    pub number: String,
}

impl Feature {
    /// Create a feature, rejecting an empty house number
    pub fn new(id: FeatureId, point: Point<f64>, properties: AddressProperties) -> Result<Self> {
        if properties.number.trim().is_empty() {
            return Err(QuickHnError::EmptyHouseNumber(id.to_string()));
        }
        Ok(Self {
            id,
            point,
            properties,
        })
    }

    pub fn lon(&self) -> f64 {
        self.point.x()
    }

    pub fn lat(&self) -> f64 {
        self.point.y()
    }

    pub fn street(&self) -> &str {
        &self.properties.street
    }

    pub fn number(&self) -> &str {
        &self.properties.number
    }

    /// Whether the street name is unresolved and matching should go by number only
    pub fn has_street(&self) -> bool {
        !self.properties.street.is_empty()
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            municipality: self.properties.municipality.clone(),
            street: self.properties.street.clone(),
            number: self.properties.number.clone(),
        }
    }

    /// Display copy shifted by `(dx, dy)` degrees; the original is left untouched
    pub fn with_offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            id: self.id.clone(),
            point: crate::utils::translate(&self.point, dx, dy),
            properties: self.properties.clone(),
        }
    }
}
