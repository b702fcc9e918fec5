//! Ingestion pipeline: uploaded files to canonical features
//!
//! The pipeline runs in four stages:
//!
//! 1. [`parse`]: the format reader for the file extension turns raw bytes into a generic
//!    [`FeatureCollection`]. Single features and bare geometries are coerced to one-element
//!    collections and elevation ordinates are dropped.
//! 2. [`detect_and_reproject`]: an optional CRS identifier carried by the document is
//!    resolved and every coordinate is brought to WGS84. Unknown reference systems are a
//!    logged no-op.
//! 3. Attribute selection: the union of property keys of the first features is offered to
//!    an [`AttributeSelector`], which decides which keys hold the number, the street and the
//!    optional secondary-language text.
//! 4. [`to_canonical`]: properties are mapped to the canonical schema, street names are
//!    normalized and every geometry is reduced to a representative point.

mod archive;
mod geojson;
mod gpx;
mod shp;
mod wkt;
mod xml;

pub use self::archive::{ArchiveEntry, ArchiveReader};
pub use self::geojson::{GeoJsonReader, convert_value as geometry_from_geojson};
pub use self::gpx::GpxReader;
pub use self::shp::Shapefile;
pub use self::wkt::{WktDocument, WktReader};
pub use self::xml::{GmlDocument, GmlReader, KmlReader, XmlFeature};

use crate::feature::{AddressProperties, AddressType, Feature, FeatureId};
use crate::normalize::normalize;
use crate::projection::{self, Reprojector};
use crate::utils;
use async_trait::async_trait;
use geo::{Geometry, Rect};
use rayon::prelude::*;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Number of leading features scanned for attribute keys
pub const ATTRIBUTE_SAMPLE_SIZE: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("{format} parse error: {message}")]
    Parse { format: FileFormat, message: String },

    #[error("GeoJSON error: {0}")]
    Json(#[from] ::geojson::Error),

    #[error("GPX parsing error: {0}")]
    Gpx(#[from] ::gpx::errors::GpxError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("WKT error on line {line}: {message}")]
    Wkt { line: usize, message: String },

    #[error("No features found in file")]
    NoFeatures,

    #[error("No attributes found in features")]
    NoAttributes,

    #[error("Number attribute '{0}' not present in the data")]
    MissingNumberAttribute(String),

    #[error("No feature carries a usable house number and location")]
    NoValidFeatures,

    #[error("Attribute selection cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supported upload formats, chosen by file extension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileFormat {
    GeoJson,
    Kml,
    Kmz,
    Gpx,
    Gml,
    Wkt,
    Zip,
}

impl FileFormat {
    /// Detect the format from a file name or path
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        Self::from_extension(&extension)
            .ok_or_else(|| IngestError::UnsupportedFormat(path.display().to_string()))
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "geojson" | "json" => Some(Self::GeoJson),
            "kml" => Some(Self::Kml),
            "kmz" => Some(Self::Kmz),
            "gpx" => Some(Self::Gpx),
            "gml" => Some(Self::Gml),
            "wkt" => Some(Self::Wkt),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Kmz | Self::Zip)
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GeoJson => "GeoJSON",
            Self::Kml => "KML",
            Self::Kmz => "KMZ",
            Self::Gpx => "GPX",
            Self::Gml => "GML",
            Self::Wkt => "WKT",
            Self::Zip => "ZIP",
        };
        f.write_str(name)
    }
}

/// One parsed feature before attribute mapping
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawFeature {
    /// Two-dimensional geometry, `None` for features without location
    pub geometry: Option<Geometry<f64>>,
    pub properties: Map<String, Value>,
}

/// Generic collection every format reader produces
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureCollection {
    /// CRS identifier as written in the document, if any
    pub crs: Option<String>,
    pub features: Vec<RawFeature>,
}

impl FeatureCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// A format-specific reader
///
/// `read` decodes raw bytes into the reader's own document model, `to_collection` converts
/// that document into the generic collection.
pub trait FormatReader {
    type Document;

    fn read(&self, bytes: &[u8]) -> Result<Self::Document, IngestError>;

    fn to_collection(&self, document: Self::Document) -> Result<FeatureCollection, IngestError>;

    fn parse(&self, bytes: &[u8]) -> Result<FeatureCollection, IngestError> {
        let document = self.read(bytes)?;
        self.to_collection(document)
    }
}

/// Parse raw file content with the reader for `format`
///
/// Fails with [`IngestError::NoFeatures`] when the document holds nothing.
pub fn parse(bytes: &[u8], format: FileFormat) -> Result<FeatureCollection, IngestError> {
    #[cfg(feature = "profiling")]
    profiling::scope!("ingest::parse");

    let collection = read_format(bytes, format)?;
    if collection.is_empty() {
        return Err(IngestError::NoFeatures);
    }
    tracing::debug!(%format, features = collection.len(), crs = ?collection.crs, "Parsed file");
    Ok(collection)
}

fn read_format(bytes: &[u8], format: FileFormat) -> Result<FeatureCollection, IngestError> {
    match format {
        FileFormat::GeoJson => GeoJsonReader.parse(bytes),
        FileFormat::Gpx => GpxReader.parse(bytes),
        FileFormat::Wkt => WktReader.parse(bytes),
        FileFormat::Kml => KmlReader.parse(bytes),
        FileFormat::Gml => GmlReader.parse(bytes),
        FileFormat::Kmz => ArchiveReader::kmz().parse(bytes),
        FileFormat::Zip => ArchiveReader::zip().parse(bytes),
    }
}

/// Bring every coordinate of the collection to WGS84
///
/// An unknown or invalid CRS identifier leaves the collection untouched with a warning.
/// A feature whose coordinates cannot be converted loses its geometry and is dropped later.
pub fn detect_and_reproject(mut collection: FeatureCollection) -> FeatureCollection {
    #[cfg(feature = "profiling")]
    profiling::scope!("ingest::detect_and_reproject");

    let Some(name) = collection.crs.as_deref() else {
        return collection;
    };

    let crs = match projection::resolve_crs(name) {
        Ok(crs) => crs,
        Err(error) => {
            tracing::warn!(crs = name, %error, "Unrecognized CRS, coordinates left unchanged");
            return collection;
        }
    };

    if !crs.is_geographic() {
        if let Err(error) = Reprojector::new(crs) {
            tracing::warn!(crs = name, %error, "Projection unavailable, coordinates left unchanged");
            return collection;
        }
        // One reprojector per worker thread
        let failures: usize = collection
            .features
            .par_iter_mut()
            .map_init(
                || Reprojector::new(crs),
                |reprojector, feature| match reprojector {
                    Ok(reprojector) => reproject_feature(reprojector, feature),
                    Err(_) => false,
                },
            )
            .filter(|ok| !ok)
            .count();
        if failures > 0 {
            tracing::warn!(
                crs = name,
                failures,
                "Some features could not be reprojected and were dropped"
            );
        }
        tracing::info!(
            from = crs.epsg(),
            features = collection.len(),
            "Reprojected to WGS84"
        );
    }

    collection.crs = Some("EPSG:4326".to_string());
    collection
}

fn reproject_feature(reprojector: &Reprojector, feature: &mut RawFeature) -> bool {
    let Some(geometry) = feature.geometry.as_ref() else {
        return true;
    };
    match reprojector.reproject(geometry) {
        Ok(reprojected) => {
            feature.geometry = Some(reprojected);
            true
        }
        Err(error) => {
            tracing::debug!(%error, "Dropping geometry that failed to reproject");
            feature.geometry = None;
            false
        }
    }
}

/// Role of an input property in the canonical schema
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeKind {
    Number,
    Street,
    NepaliText,
}

impl AttributeKind {
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Number)
    }
}

/// Which input property feeds which canonical field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeMapping {
    pub number: String,
    pub street: Option<String>,
    pub nepali_text: Option<String>,
}

impl AttributeMapping {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            street: None,
            nepali_text: None,
        }
    }

    pub fn with_street(mut self, street: impl Into<String>) -> Self {
        self.street = Some(street.into());
        self
    }

    pub fn with_nepali_text(mut self, key: impl Into<String>) -> Self {
        self.nepali_text = Some(key.into());
        self
    }

    /// Guess a mapping from well-known key names
    ///
    /// Returns `None` when no number key is recognized.
    pub fn guess(available: &[String]) -> Option<Self> {
        const NUMBER_KEYS: &[&str] = &[
            "addr:housenumber",
            "housenumber",
            "house_number",
            "number",
            "metric_num",
            "hn",
        ];
        const STREET_KEYS: &[&str] = &["addr:street", "street", "street_name", "road", "rd_naeng"];
        const NEPALI_KEYS: &[&str] = &["nepali", "name:ne", "tole_ne", "nepali_text"];

        let find = |candidates: &[&str]| {
            candidates.iter().find_map(|candidate| {
                available
                    .iter()
                    .find(|key| key.eq_ignore_ascii_case(candidate))
                    .cloned()
            })
        };

        Some(Self {
            number: find(NUMBER_KEYS)?,
            street: find(STREET_KEYS),
            nepali_text: find(NEPALI_KEYS),
        })
    }
}

/// Interactive collaborator choosing the attribute mapping
///
/// Returning `None` cancels the import.
#[async_trait]
pub trait AttributeSelector: Send + Sync {
    async fn select(
        &self,
        available: &[String],
        kinds: &[AttributeKind],
    ) -> Option<AttributeMapping>;
}

/// Selector answering with a fixed mapping, or a guessed one when none is given
#[derive(Clone, Debug, Default)]
pub struct StaticAttributeSelector {
    mapping: Option<AttributeMapping>,
}

impl StaticAttributeSelector {
    pub fn new(mapping: AttributeMapping) -> Self {
        Self {
            mapping: Some(mapping),
        }
    }

    pub fn guessing() -> Self {
        Self { mapping: None }
    }
}

#[async_trait]
impl AttributeSelector for StaticAttributeSelector {
    async fn select(
        &self,
        available: &[String],
        _kinds: &[AttributeKind],
    ) -> Option<AttributeMapping> {
        match &self.mapping {
            Some(mapping) => Some(mapping.clone()),
            None => AttributeMapping::guess(available),
        }
    }
}

/// Sorted union of property keys of the first [`ATTRIBUTE_SAMPLE_SIZE`] features
pub fn available_attributes(collection: &FeatureCollection) -> Result<Vec<String>, IngestError> {
    let keys: BTreeSet<&String> = collection
        .features
        .iter()
        .take(ATTRIBUTE_SAMPLE_SIZE)
        .flat_map(|feature| feature.properties.keys())
        .collect();
    if keys.is_empty() {
        return Err(IngestError::NoAttributes);
    }
    Ok(keys.into_iter().cloned().collect())
}

/// Render a property value as text, `None` for missing, null or blank values
pub(crate) fn property_text(properties: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match properties.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Build canonical features
///
/// Features without a usable number or location are skipped. Ids are `file-{label}-{index}`
/// with the index of the input feature, and the municipality is the label.
pub fn to_canonical(
    features: &[RawFeature],
    mapping: &AttributeMapping,
    source_label: &str,
) -> Vec<Feature> {
    #[cfg(feature = "profiling")]
    profiling::scope!("ingest::to_canonical");

    features
        .par_iter()
        .enumerate()
        .filter_map(|(index, raw)| canonical_feature(index, raw, mapping, source_label))
        .collect()
}

fn canonical_feature(
    index: usize,
    raw: &RawFeature,
    mapping: &AttributeMapping,
    source_label: &str,
) -> Option<Feature> {
    let number = property_text(&raw.properties, &mapping.number)?;
    let point = raw
        .geometry
        .as_ref()
        .and_then(utils::representative_point)
        .filter(|p| p.x().is_finite() && p.y().is_finite())?;

    let street_original = mapping
        .street
        .as_deref()
        .and_then(|key| property_text(&raw.properties, key))
        .unwrap_or_default();
    let nepali_text = mapping
        .nepali_text
        .as_deref()
        .and_then(|key| property_text(&raw.properties, key));

    let properties = AddressProperties {
        street: normalize(&street_original),
        street_original,
        number,
        municipality: source_label.to_string(),
        kind: AddressType::Active,
        nepali_text,
    };
    Feature::new(
        FeatureId::new(format!("file-{source_label}-{index}")),
        point,
        properties,
    )
    .ok()
}

/// Outcome of a file import
#[derive(Clone, Debug)]
pub struct ImportResult {
    pub features: Vec<Feature>,
    /// Bounding box of the imported points, for zooming the map to the data
    pub bounds: Option<Rect<f64>>,
    pub file_name: String,
    /// Input features dropped for lacking a number or a location
    pub skipped: usize,
}

/// File stem used as source label and municipality
pub fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
        .to_string()
}

/// Runs the full ingestion for one file
#[derive(Clone, Copy, Debug, Default)]
pub struct IngestionPipeline;

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl IngestionPipeline {
    pub fn new() -> Self {
        Self
    }

    /// Parse and reproject without attribute mapping
    pub fn load(&self, bytes: &[u8], file_name: &str) -> Result<FeatureCollection, IngestError> {
        let format = FileFormat::from_path(file_name)?;
        let collection = parse(bytes, format)?;
        Ok(detect_and_reproject(collection))
    }

    /// Import a file, asking `selector` for the attribute mapping
    pub async fn import(
        &self,
        bytes: &[u8],
        file_name: &str,
        selector: &dyn AttributeSelector,
    ) -> Result<ImportResult, IngestError> {
        let collection = self.load(bytes, file_name)?;
        let available = available_attributes(&collection)?;
        let kinds = [
            AttributeKind::Number,
            AttributeKind::Street,
            AttributeKind::NepaliText,
        ];
        let mapping = selector
            .select(&available, &kinds)
            .await
            .ok_or(IngestError::Cancelled)?;
        self.finish(collection, &available, &mapping, file_name)
    }

    /// Import a file with a mapping decided up front
    pub fn import_with_mapping(
        &self,
        bytes: &[u8],
        file_name: &str,
        mapping: &AttributeMapping,
    ) -> Result<ImportResult, IngestError> {
        let collection = self.load(bytes, file_name)?;
        let available = available_attributes(&collection)?;
        self.finish(collection, &available, mapping, file_name)
    }

    fn finish(
        &self,
        collection: FeatureCollection,
        available: &[String],
        mapping: &AttributeMapping,
        file_name: &str,
    ) -> Result<ImportResult, IngestError> {
        if !available.contains(&mapping.number) {
            return Err(IngestError::MissingNumberAttribute(mapping.number.clone()));
        }

        let label = file_stem(file_name);
        let features = to_canonical(&collection.features, mapping, &label);
        if features.is_empty() {
            return Err(IngestError::NoValidFeatures);
        }

        let skipped = collection.len() - features.len();
        let bounds = utils::bounds_of(features.iter().map(|f| &f.point));
        tracing::info!(
            file = file_name,
            imported = features.len(),
            skipped,
            "Imported address features"
        );

        Ok(ImportResult {
            features,
            bounds,
            file_name: file_name.to_string(),
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Point;
    use serde_json::json;

    fn raw(x: f64, y: f64, properties: Value) -> RawFeature {
        RawFeature {
            geometry: Some(Geometry::Point(Point::new(x, y))),
            properties: properties.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_path("a.GeoJSON").unwrap(), FileFormat::GeoJson);
        assert_eq!(FileFormat::from_path("dir/a.json").unwrap(), FileFormat::GeoJson);
        assert_eq!(FileFormat::from_path("a.kmz").unwrap(), FileFormat::Kmz);
        assert!(matches!(
            FileFormat::from_path("a.shp"),
            Err(IngestError::UnsupportedFormat(_))
        ));
        assert!(FileFormat::from_path("noext").is_err());
    }

    #[test]
    fn test_available_attributes_sampled_and_sorted() {
        let mut features: Vec<RawFeature> = (0..ATTRIBUTE_SAMPLE_SIZE)
            .map(|i| raw(0.0, 0.0, json!({"number": i, "street": "x"})))
            .collect();
        features.push(raw(0.0, 0.0, json!({"late_key": 1})));
        let collection = FeatureCollection {
            crs: None,
            features,
        };

        assert_eq!(
            available_attributes(&collection).unwrap(),
            vec!["number".to_string(), "street".to_string()]
        );
    }

    #[test]
    fn test_no_attributes() {
        let collection = FeatureCollection {
            crs: None,
            features: vec![raw(0.0, 0.0, json!({}))],
        };
        assert!(matches!(
            available_attributes(&collection),
            Err(IngestError::NoAttributes)
        ));
    }

    #[test]
    fn test_to_canonical() {
        let features = vec![
            raw(85.3, 27.6, json!({"hn": "12", "st": "Araniko Marg", "np": "अरनिको"})),
            raw(85.4, 27.7, json!({"hn": null, "st": "Ring Road"})),
            raw(85.5, 27.8, json!({"hn": 7})),
            RawFeature {
                geometry: None,
                properties: json!({"hn": "3"}).as_object().cloned().unwrap_or_default(),
            },
        ];
        let mapping = AttributeMapping::new("hn")
            .with_street("st")
            .with_nepali_text("np");

        let result = to_canonical(&features, &mapping, "upload");
        assert_eq!(result.len(), 2);

        assert_eq!(result[0].id.as_str(), "file-upload-0");
        assert_eq!(result[0].properties.street, "Araniko Marga");
        assert_eq!(result[0].properties.street_original, "Araniko Marg");
        assert_eq!(result[0].properties.municipality, "upload");
        assert_eq!(result[0].properties.nepali_text.as_deref(), Some("अरनिको"));

        assert_eq!(result[1].id.as_str(), "file-upload-2");
        assert_eq!(result[1].number(), "7");
        assert!(!result[1].has_street());
    }

    #[test]
    fn test_reproject_web_mercator() {
        let projected = projection::from_wgs84(
            projection::Crs::WebMercator,
            geo::Coord { x: 85.3, y: 27.7 },
        )
        .unwrap();
        let (x, y) = (projected.x, projected.y);
        let collection = FeatureCollection {
            crs: Some("EPSG:3857".to_string()),
            features: vec![raw(x, y, json!({"n": "1"}))],
        };
        let result = detect_and_reproject(collection);
        assert_eq!(result.crs.as_deref(), Some("EPSG:4326"));

        let Some(Geometry::Point(p)) = result.features[0].geometry else {
            panic!("expected a point");
        };
        assert!((p.x() - 85.3).abs() < 1e-6);
        assert!((p.y() - 27.7).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_crs_is_noop() {
        let collection = FeatureCollection {
            crs: Some("EPSG:99999".to_string()),
            features: vec![raw(1.0, 2.0, json!({"n": "1"}))],
        };
        let result = detect_and_reproject(collection.clone());
        assert_eq!(result, collection);
    }

    #[test]
    fn test_guess_mapping() {
        let available = vec![
            "addr:housenumber".to_string(),
            "addr:street".to_string(),
            "other".to_string(),
        ];
        let mapping = AttributeMapping::guess(&available).unwrap();
        assert_eq!(mapping.number, "addr:housenumber");
        assert_eq!(mapping.street.as_deref(), Some("addr:street"));
        assert!(mapping.nepali_text.is_none());

        assert!(AttributeMapping::guess(&["other".to_string()]).is_none());
    }

    #[test]
    fn test_import_geojson_with_mapping() {
        let data = br#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":{"type":"Point","coordinates":[85.31,27.67,1300]},
             "properties":{"num":"5","road":"Main Street"}},
            {"type":"Feature","geometry":{"type":"Point","coordinates":[85.32,27.68]},
             "properties":{"num":"","road":"Main Street"}}
        ]}"#;
        let mapping = AttributeMapping::new("num").with_street("road");
        let result = IngestionPipeline::new()
            .import_with_mapping(data, "wards.geojson", &mapping)
            .unwrap();

        assert_eq!(result.features.len(), 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.features[0].id.as_str(), "file-wards-0");
        assert_eq!(result.features[0].street(), "Main St");
        let bounds = result.bounds.unwrap();
        assert_eq!(bounds.min().x, 85.31);
    }

    #[test]
    fn test_missing_number_attribute() {
        let data = br#"{"type":"Feature","geometry":{"type":"Point","coordinates":[1,2]},
            "properties":{"a":"1"}}"#;
        let err = IngestionPipeline::new()
            .import_with_mapping(data, "x.json", &AttributeMapping::new("b"))
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingNumberAttribute(_)));
    }

    #[tokio::test]
    async fn test_import_cancelled() {
        struct Cancel;

        #[async_trait]
        impl AttributeSelector for Cancel {
            async fn select(&self, _: &[String], _: &[AttributeKind]) -> Option<AttributeMapping> {
                None
            }
        }

        let data = br#"{"type":"Feature","geometry":{"type":"Point","coordinates":[1,2]},
            "properties":{"a":"1"}}"#;
        let err = IngestionPipeline::new()
            .import(data, "x.json", &Cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
    }
}
