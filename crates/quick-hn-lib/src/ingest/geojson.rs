//! GeoJSON reader

use super::{FeatureCollection, FileFormat, FormatReader, IngestError, RawFeature};
use ::geojson::{GeoJson, JsonObject, Position, Value};
use geo::{Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint};
use geo::{MultiPolygon, Point, Polygon};

/// Reads GeoJSON and plain JSON files
///
/// Accepts a feature collection, a single feature or a bare geometry. Third and further
/// ordinates are discarded. A legacy `crs` member is reported as the collection CRS.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeoJsonReader;

impl FormatReader for GeoJsonReader {
    type Document = GeoJson;

    fn read(&self, bytes: &[u8]) -> Result<GeoJson, IngestError> {
        let text = std::str::from_utf8(bytes).map_err(|e| IngestError::Parse {
            format: FileFormat::GeoJson,
            message: e.to_string(),
        })?;
        Ok(text.trim_start_matches('\u{feff}').parse::<GeoJson>()?)
    }

    fn to_collection(&self, document: GeoJson) -> Result<FeatureCollection, IngestError> {
        match document {
            GeoJson::FeatureCollection(fc) => {
                let crs = fc.foreign_members.as_ref().and_then(crs_name);
                let features = fc
                    .features
                    .into_iter()
                    .map(convert_feature)
                    .collect::<Result<_, _>>()?;
                Ok(FeatureCollection { crs, features })
            }
            GeoJson::Feature(feature) => {
                let crs = feature.foreign_members.as_ref().and_then(crs_name);
                Ok(FeatureCollection {
                    crs,
                    features: vec![convert_feature(feature)?],
                })
            }
            GeoJson::Geometry(geometry) => {
                let crs = geometry.foreign_members.as_ref().and_then(crs_name);
                Ok(FeatureCollection {
                    crs,
                    features: vec![RawFeature {
                        geometry: Some(convert_value(&geometry.value)?),
                        properties: Default::default(),
                    }],
                })
            }
        }
    }
}

fn convert_feature(feature: ::geojson::Feature) -> Result<RawFeature, IngestError> {
    let geometry = feature
        .geometry
        .as_ref()
        .map(|g| convert_value(&g.value))
        .transpose()?;
    Ok(RawFeature {
        geometry,
        properties: feature.properties.unwrap_or_default(),
    })
}

/// Read the CRS from a legacy `"crs"` member, either named or linked by EPSG code
fn crs_name(members: &JsonObject) -> Option<String> {
    let properties = members.get("crs")?.get("properties")?;
    if let Some(name) = properties.get("name").and_then(|n| n.as_str()) {
        return Some(name.to_string());
    }
    properties
        .get("code")
        .and_then(|c| c.as_u64())
        .map(|code| format!("EPSG:{code}"))
}

fn coord(position: &Position) -> Result<Coord<f64>, IngestError> {
    match position.as_slice() {
        [x, y, ..] => Ok(Coord { x: *x, y: *y }),
        _ => Err(IngestError::Parse {
            format: FileFormat::GeoJson,
            message: format!("position with {} ordinates", position.len()),
        }),
    }
}

fn line(positions: &[Position]) -> Result<LineString<f64>, IngestError> {
    positions
        .iter()
        .map(coord)
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

fn polygon(rings: &[Vec<Position>]) -> Result<Polygon<f64>, IngestError> {
    let mut rings = rings.iter().map(|r| line(r));
    let exterior = rings.next().transpose()?.unwrap_or_else(|| LineString::new(vec![]));
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Convert a GeoJSON geometry value to a two-dimensional geometry
pub fn convert_value(value: &Value) -> Result<Geometry<f64>, IngestError> {
    let geometry = match value {
        Value::Point(p) => Geometry::Point(Point::from(coord(p)?)),
        Value::MultiPoint(points) => Geometry::MultiPoint(MultiPoint::new(
            points
                .iter()
                .map(|p| coord(p).map(Point::from))
                .collect::<Result<_, _>>()?,
        )),
        Value::LineString(positions) => Geometry::LineString(line(positions)?),
        Value::MultiLineString(lines) => Geometry::MultiLineString(MultiLineString::new(
            lines.iter().map(|l| line(l)).collect::<Result<_, _>>()?,
        )),
        Value::Polygon(rings) => Geometry::Polygon(polygon(rings)?),
        Value::MultiPolygon(polygons) => Geometry::MultiPolygon(MultiPolygon::new(
            polygons
                .iter()
                .map(|p| polygon(p))
                .collect::<Result<_, _>>()?,
        )),
        Value::GeometryCollection(geometries) => {
            Geometry::GeometryCollection(GeometryCollection::new_from(
                geometries
                    .iter()
                    .map(|g| convert_value(&g.value))
                    .collect::<Result<_, _>>()?,
            ))
        }
    };
    Ok(geometry)
}
