//! ESRI shapefile reader for the members of a ZIP upload

use super::{FeatureCollection, FileFormat, IngestError, RawFeature};
use crate::projection;
use ::shapefile::dbase::{FieldValue, Record};
use ::shapefile::{Shape, ShapeReader};
use geo::Geometry;
use serde_json::{Map, Number, Value};
use std::io::Cursor;

/// The parts of one shapefile; only the `.shp` is required
#[derive(Clone, Debug, Default)]
pub struct Shapefile {
    pub shp: Vec<u8>,
    pub dbf: Option<Vec<u8>>,
    /// WKT of the `.prj`
    pub prj: Option<String>,
}

fn parse_error(error: impl std::fmt::Display) -> IngestError {
    IngestError::Parse {
        format: FileFormat::Zip,
        message: format!("shapefile: {error}"),
    }
}

fn field_value(value: FieldValue) -> Value {
    match value {
        FieldValue::Character(Some(text)) | FieldValue::Memo(text) => {
            Value::String(text.trim().to_string())
        }
        FieldValue::Numeric(Some(n)) | FieldValue::Double(n) => number(n),
        FieldValue::Float(Some(n)) => number(f64::from(n)),
        FieldValue::Integer(n) => Value::from(n),
        FieldValue::Logical(Some(b)) => Value::Bool(b),
        _ => Value::Null,
    }
}

/// Whole numbers stay integers so a house number `12` never reads as `12.0`
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn properties(record: Record) -> Map<String, Value> {
    record
        .into_iter()
        .map(|(name, value)| (name.trim().to_string(), field_value(value)))
        .collect()
}

fn geometry(shape: Shape) -> Option<Geometry<f64>> {
    Geometry::<f64>::try_from(shape).ok()
}

impl Shapefile {
    /// Read shapes and their attribute records
    ///
    /// A `.prj` naming a supported system becomes the collection CRS; an unrecognized one
    /// leaves the coordinates as they are.
    pub fn to_collection(self) -> Result<FeatureCollection, IngestError> {
        let shapes = ShapeReader::new(Cursor::new(self.shp)).map_err(parse_error)?;

        let features: Vec<RawFeature> = match self.dbf {
            Some(dbf) => {
                let records =
                    ::shapefile::dbase::Reader::new(Cursor::new(dbf)).map_err(parse_error)?;
                ::shapefile::Reader::new(shapes, records)
                    .read()
                    .map_err(parse_error)?
                    .into_iter()
                    .map(|(shape, record)| RawFeature {
                        geometry: geometry(shape),
                        properties: properties(record),
                    })
                    .collect()
            }
            None => shapes
                .read()
                .map_err(parse_error)?
                .into_iter()
                .map(|shape| RawFeature {
                    geometry: geometry(shape),
                    properties: Map::new(),
                })
                .collect(),
        };

        let crs = self.prj.as_deref().and_then(|wkt| {
            let crs = projection::crs_from_prj(wkt);
            if crs.is_none() {
                tracing::warn!("Unrecognized shapefile projection, coordinates left unchanged");
            }
            crs.map(|crs| format!("EPSG:{}", crs.epsg()))
        });
        Ok(FeatureCollection { crs, features })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use geo::Point;

    /// Point shapefile holding `points`
    pub(crate) fn point_shp(points: &[(f64, f64)]) -> Vec<u8> {
        let length_words = (100 + points.len() * 28) / 2;
        let mut bytes = Vec::new();
        bytes.extend(9994i32.to_be_bytes());
        bytes.extend([0u8; 20]);
        bytes.extend((length_words as i32).to_be_bytes());
        bytes.extend(1000i32.to_le_bytes());
        bytes.extend(1i32.to_le_bytes());
        let xs = points.iter().map(|p| p.0);
        let ys = points.iter().map(|p| p.1);
        for bound in [
            xs.clone().fold(f64::INFINITY, f64::min),
            ys.clone().fold(f64::INFINITY, f64::min),
            xs.fold(f64::NEG_INFINITY, f64::max),
            ys.fold(f64::NEG_INFINITY, f64::max),
            0.0,
            0.0,
            0.0,
            0.0,
        ] {
            bytes.extend(bound.to_le_bytes());
        }
        for (index, (x, y)) in points.iter().enumerate() {
            bytes.extend((index as i32 + 1).to_be_bytes());
            bytes.extend(10i32.to_be_bytes());
            bytes.extend(1i32.to_le_bytes());
            bytes.extend(x.to_le_bytes());
            bytes.extend(y.to_le_bytes());
        }
        bytes
    }

    /// dBase III table of character fields, 20 bytes wide
    pub(crate) fn dbf(fields: &[&str], rows: &[&[&str]]) -> Vec<u8> {
        const WIDTH: usize = 20;
        let mut bytes = vec![0x03, 125, 1, 1];
        bytes.extend((rows.len() as u32).to_le_bytes());
        bytes.extend(((32 + 32 * fields.len() + 1) as u16).to_le_bytes());
        bytes.extend(((1 + WIDTH * fields.len()) as u16).to_le_bytes());
        bytes.extend([0u8; 20]);
        for field in fields {
            let mut name = [0u8; 11];
            name[..field.len()].copy_from_slice(field.as_bytes());
            bytes.extend(name);
            bytes.push(b'C');
            bytes.extend([0u8; 4]);
            bytes.push(WIDTH as u8);
            bytes.push(0);
            bytes.extend([0u8; 14]);
        }
        bytes.push(0x0D);
        for row in rows {
            bytes.push(b' ');
            for value in row.iter() {
                bytes.extend(format!("{value:<WIDTH$}").as_bytes());
            }
        }
        bytes.push(0x1A);
        bytes
    }

    #[test]
    fn test_points_with_attributes() {
        let shapefile = Shapefile {
            shp: point_shp(&[(85.3245, 27.6712), (85.3251, 27.6731)]),
            dbf: Some(dbf(
                &["HN", "STREET"],
                &[&["12", "Mangal Bazar"], &["7/1", "Ring Road"]],
            )),
            prj: None,
        };
        let collection = shapefile.to_collection().unwrap();
        assert_eq!(collection.crs, None);
        assert_eq!(collection.len(), 2);

        let first = &collection.features[0];
        assert_eq!(
            first.geometry,
            Some(Geometry::Point(Point::new(85.3245, 27.6712)))
        );
        assert_eq!(first.properties["HN"], "12");
        assert_eq!(first.properties["STREET"], "Mangal Bazar");
        assert_eq!(collection.features[1].properties["HN"], "7/1");
    }

    #[test]
    fn test_shapes_without_table() {
        let shapefile = Shapefile {
            shp: point_shp(&[(1.0, 2.0)]),
            ..Default::default()
        };
        let collection = shapefile.to_collection().unwrap();
        assert_eq!(collection.len(), 1);
        assert!(collection.features[0].properties.is_empty());
    }

    #[test]
    fn test_projection_file_sets_crs() {
        let shapefile = Shapefile {
            shp: point_shp(&[(334749.79, 3061902.67)]),
            dbf: None,
            prj: Some(r#"PROJCS["WGS_1984_UTM_Zone_45N",GEOGCS["GCS_WGS_1984"]]"#.to_string()),
        };
        let collection = shapefile.to_collection().unwrap();
        assert_eq!(collection.crs.as_deref(), Some("EPSG:32645"));
    }

    #[test]
    fn test_whole_numbers_stay_integers() {
        assert_eq!(number(12.0), Value::from(12));
        assert_eq!(number(12.5), serde_json::json!(12.5));
        assert_eq!(field_value(FieldValue::Character(None)), Value::Null);
    }

    #[test]
    fn test_truncated_shp() {
        let shapefile = Shapefile {
            shp: vec![0, 0, 0x27],
            ..Default::default()
        };
        assert!(matches!(
            shapefile.to_collection(),
            Err(IngestError::Parse { .. })
        ));
    }
}
