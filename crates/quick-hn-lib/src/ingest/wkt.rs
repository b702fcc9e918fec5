//! Well-known text reader

use super::{FeatureCollection, FileFormat, FormatReader, IngestError, RawFeature};
use geo::Geometry;
use std::str::FromStr;

/// Reads one WKT geometry per non-empty line
///
/// An EWKT `SRID=<code>;` prefix on the first geometry sets the collection CRS. WKT has no
/// attributes, so the resulting features carry empty properties.
#[derive(Clone, Copy, Debug, Default)]
pub struct WktReader;

/// Parsed WKT lines
#[derive(Debug, Default)]
pub struct WktDocument {
    pub srid: Option<u32>,
    pub geometries: Vec<Geometry<f64>>,
}

impl FormatReader for WktReader {
    type Document = WktDocument;

    fn read(&self, bytes: &[u8]) -> Result<WktDocument, IngestError> {
        let text = std::str::from_utf8(bytes).map_err(|e| IngestError::Parse {
            format: FileFormat::Wkt,
            message: e.to_string(),
        })?;

        let mut document = WktDocument::default();
        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let (srid, body) = split_srid(line);
            if document.srid.is_none() {
                document.srid = srid;
            }
            document.geometries.push(parse_line(body, index + 1)?);
        }
        Ok(document)
    }

    fn to_collection(&self, document: WktDocument) -> Result<FeatureCollection, IngestError> {
        Ok(FeatureCollection {
            crs: document.srid.map(|code| format!("EPSG:{code}")),
            features: document
                .geometries
                .into_iter()
                .map(|geometry| RawFeature {
                    geometry: Some(geometry),
                    properties: Default::default(),
                })
                .collect(),
        })
    }
}

fn split_srid(line: &str) -> (Option<u32>, &str) {
    let Some(rest) = line
        .get(..5)
        .filter(|head| head.eq_ignore_ascii_case("SRID="))
        .map(|_| &line[5..])
    else {
        return (None, line);
    };
    match rest.split_once(';') {
        Some((code, body)) => (code.trim().parse().ok(), body.trim()),
        None => (None, line),
    }
}

fn parse_line(body: &str, line: usize) -> Result<Geometry<f64>, IngestError> {
    let wkt = ::wkt::Wkt::<f64>::from_str(body).map_err(|e| IngestError::Wkt {
        line,
        message: e.to_string(),
    })?;
    wkt.try_into()
        .map_err(|e: ::wkt::conversion::Error| IngestError::Wkt {
            line,
            message: format!("{e:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Point;

    #[test]
    fn test_one_geometry_per_line() {
        let text = "POINT (85.3 27.6)\n\n  LINESTRING (0 0, 1 1)\r\nPOINT (1 2)\n";
        let collection = WktReader.parse(text.as_bytes()).unwrap();
        assert_eq!(collection.len(), 3);
        assert!(collection.crs.is_none());
        assert_eq!(
            collection.features[0].geometry,
            Some(Geometry::Point(Point::new(85.3, 27.6)))
        );
        assert_eq!(
            collection.features[2].geometry,
            Some(Geometry::Point(Point::new(1.0, 2.0)))
        );
    }

    #[test]
    fn test_srid_prefix() {
        let collection = WktReader
            .parse(b"SRID=3857;POINT (9495000 3209000)")
            .unwrap();
        assert_eq!(collection.crs.as_deref(), Some("EPSG:3857"));
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_error_reports_line() {
        let err = WktReader
            .parse(b"POINT (1 2)\nPOINT (oops)")
            .unwrap_err();
        assert!(matches!(err, IngestError::Wkt { line: 2, .. }));
    }
}
