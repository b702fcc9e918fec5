//! Generic adapter for bounding-box GeoJSON endpoints
//!
//! Covers OGC API Features, WFS `GetFeature` with `outputFormat=application/json` and
//! similar services: the tile rectangle is substituted into a URL template and the returned
//! features are mapped through a [`PropertyMapping`].

use super::{HttpClient, SourceAdapter, SourceError, decode_features};
use crate::feature::{AddressProperties, AddressType, Feature, FeatureId};
use crate::ingest::{geometry_from_geojson, property_text};
use crate::normalize::normalize;
use crate::projection::{self, Crs};
use crate::utils;
use async_trait::async_trait;
use geo::{Polygon, Rect};

/// Where the canonical fields come from in a provider response
#[derive(Clone, Debug, Default)]
pub struct PropertyMapping {
    /// Property holding the provider id; the GeoJSON feature id is used when absent
    pub id: Option<String>,
    pub number: String,
    /// Candidate street keys, first non-empty wins
    pub street: Vec<String>,
    /// Candidate municipality keys, first non-empty wins
    pub municipality: Vec<String>,
    pub nepali_text: Option<String>,
    /// Status property and the values accepted for it; features with another status are
    /// dropped. No status filtering when `None`.
    pub status: Option<(String, Vec<(String, AddressType)>)>,
}

impl PropertyMapping {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            ..Default::default()
        }
    }

    pub fn street(mut self, key: impl Into<String>) -> Self {
        self.street.push(key.into());
        self
    }

    pub fn municipality(mut self, key: impl Into<String>) -> Self {
        self.municipality.push(key.into());
        self
    }

    pub fn id(mut self, key: impl Into<String>) -> Self {
        self.id = Some(key.into());
        self
    }

    pub fn status(mut self, key: impl Into<String>, values: Vec<(String, AddressType)>) -> Self {
        self.status = Some((key.into(), values));
        self
    }

    fn first_text(properties: &geojson::JsonObject, keys: &[String]) -> Option<String> {
        keys.iter().find_map(|key| property_text(properties, key))
    }
}

/// Adapter for a single bounding-box endpoint
///
/// The URL template may contain `{left}`, `{bottom}`, `{right}` and `{top}`. When a CRS is
/// configured the rectangle is projected into it before substitution and the response
/// coordinates are projected back to WGS84.
pub struct BboxGeoJsonSource<C> {
    name: String,
    client: C,
    url_template: String,
    id_prefix: String,
    mapping: PropertyMapping,
    region: Option<Polygon<f64>>,
    crs: Option<Crs>,
}

impl<C: HttpClient> BboxGeoJsonSource<C> {
    pub fn new(
        name: impl Into<String>,
        client: C,
        url_template: impl Into<String>,
        mapping: PropertyMapping,
    ) -> Self {
        let name = name.into();
        Self {
            id_prefix: name.clone(),
            name,
            client,
            url_template: url_template.into(),
            mapping,
            region: None,
            crs: None,
        }
    }

    /// Only query tiles intersecting this polygon
    pub fn with_region(mut self, region: Polygon<f64>) -> Self {
        self.region = Some(region);
        self
    }

    /// Exchange coordinates with the endpoint in `crs`
    pub fn with_crs(mut self, crs: Crs) -> Self {
        self.crs = Some(crs);
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    fn url_for(&self, extent: &Rect<f64>) -> Result<String, SourceError> {
        let (min, max) = match self.crs {
            Some(crs) => (
                projection::from_wgs84(crs, extent.min())?,
                projection::from_wgs84(crs, extent.max())?,
            ),
            None => (extent.min(), extent.max()),
        };
        Ok(self
            .url_template
            .replace("{left}", &min.x.to_string())
            .replace("{bottom}", &min.y.to_string())
            .replace("{right}", &max.x.to_string())
            .replace("{top}", &max.y.to_string()))
    }

    fn convert(&self, feature: &geojson::Feature) -> Option<Feature> {
        let properties = feature.properties.as_ref()?;

        let kind = match &self.mapping.status {
            Some((key, accepted)) => {
                let status = property_text(properties, key)?;
                accepted
                    .iter()
                    .find(|(value, _)| *value == status)
                    .map(|(_, kind)| *kind)?
            }
            None => AddressType::Active,
        };

        let number = property_text(properties, &self.mapping.number)?;
        let local_id = match &self.mapping.id {
            Some(key) => property_text(properties, key)?,
            None => match feature.id.as_ref()? {
                geojson::feature::Id::String(s) => s.clone(),
                geojson::feature::Id::Number(n) => n.to_string(),
            },
        };

        let mut geometry = geometry_from_geojson(&feature.geometry.as_ref()?.value).ok()?;
        if let Some(crs) = self.crs {
            geometry = projection::reproject_geometry(crs, &geometry).ok()?;
        }
        let point = utils::representative_point(&geometry)?;

        let street_original =
            PropertyMapping::first_text(properties, &self.mapping.street).unwrap_or_default();
        let municipality =
            PropertyMapping::first_text(properties, &self.mapping.municipality).unwrap_or_default();
        let nepali_text = self
            .mapping
            .nepali_text
            .as_deref()
            .and_then(|key| property_text(properties, key));

        Feature::new(
            FeatureId::new(format!("{}-{local_id}", self.id_prefix)),
            point,
            AddressProperties {
                street: normalize(&street_original),
                street_original,
                number,
                municipality,
                kind,
                nepali_text,
            },
        )
        .ok()
    }
}

#[async_trait]
impl<C: HttpClient + 'static> SourceAdapter for BboxGeoJsonSource<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, extent: Rect<f64>) -> Result<Vec<Feature>, SourceError> {
        if let Some(region) = &self.region {
            if utils::region_disjoint(region, &extent) {
                return Ok(Vec::new());
            }
        }

        let url = self.url_for(&extent)?;
        let body = self.client.get(&url).await?;
        let raw = decode_features(&body)?;
        let features: Vec<Feature> = raw.iter().filter_map(|f| self.convert(f)).collect();
        tracing::debug!(
            source = %self.name,
            received = raw.len(),
            kept = features.len(),
            "Provider features loaded"
        );
        Ok(features)
    }
}
