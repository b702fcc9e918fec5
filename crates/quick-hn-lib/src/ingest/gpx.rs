//! GPX reader

use super::{FeatureCollection, FormatReader, IngestError, RawFeature};
use ::gpx::{Gpx, Waypoint};
use geo::{Geometry, LineString, MultiLineString};
use serde_json::{Map, Value};

/// Reads GPX 1.0/1.1 files
///
/// Waypoints become points carrying their `name`, `desc`, `cmt` and `type` as properties.
/// Tracks and routes become lines named after the track or route. Elevation is ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpxReader;

impl FormatReader for GpxReader {
    type Document = Gpx;

    fn read(&self, bytes: &[u8]) -> Result<Gpx, IngestError> {
        Ok(::gpx::read(bytes)?)
    }

    fn to_collection(&self, document: Gpx) -> Result<FeatureCollection, IngestError> {
        let mut features = Vec::with_capacity(document.waypoints.len());

        features.extend(document.waypoints.iter().map(|waypoint| RawFeature {
            geometry: Some(Geometry::Point(waypoint.point())),
            properties: waypoint_properties(waypoint),
        }));

        for track in &document.tracks {
            let lines: Vec<LineString<f64>> = track
                .segments
                .iter()
                .map(|segment| line(&segment.points))
                .filter(|line| !line.0.is_empty())
                .collect();
            if lines.is_empty() {
                continue;
            }
            features.push(RawFeature {
                geometry: Some(Geometry::MultiLineString(MultiLineString::new(lines))),
                properties: named(track.name.as_deref()),
            });
        }

        for route in &document.routes {
            if route.points.is_empty() {
                continue;
            }
            features.push(RawFeature {
                geometry: Some(Geometry::LineString(line(&route.points))),
                properties: named(route.name.as_deref()),
            });
        }

        Ok(FeatureCollection {
            crs: None,
            features,
        })
    }
}

fn line(points: &[Waypoint]) -> LineString<f64> {
    points.iter().map(|p| p.point().0).collect()
}

fn named(name: Option<&str>) -> Map<String, Value> {
    let mut properties = Map::new();
    if let Some(name) = name {
        properties.insert("name".to_string(), Value::from(name));
    }
    properties
}

fn waypoint_properties(waypoint: &Waypoint) -> Map<String, Value> {
    let mut properties = named(waypoint.name.as_deref());
    let optional = [
        ("desc", &waypoint.description),
        ("cmt", &waypoint.comment),
        ("type", &waypoint.type_),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            properties.insert(key.to_string(), Value::from(value.as_str()));
        }
    }
    properties
}
