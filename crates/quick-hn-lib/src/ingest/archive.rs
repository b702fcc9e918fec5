//! KMZ and ZIP archive reader

use super::shp::Shapefile;
use super::{FeatureCollection, FileFormat, FormatReader, IngestError};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

/// Reads archives and merges the collections of their inner documents
///
/// Each inner document is parsed by the reader for its extension and reprojected on its own
/// before merging, so documents in different reference systems can share one archive.
/// ZIP archives also carry shapefiles: the `.shp`, `.dbf` and `.prj` members sharing a
/// stem are read together. Other entries (images, styles, indexes) are skipped. Nested
/// archives are not opened.
#[derive(Clone, Debug)]
pub struct ArchiveReader {
    format: FileFormat,
}

/// An inner document of an archive
#[derive(Clone, Debug)]
pub enum ArchiveEntry {
    Document {
        name: String,
        format: FileFormat,
        bytes: Vec<u8>,
    },
    Shapefile {
        name: String,
        parts: Shapefile,
    },
}

/// Shapefile members seen so far, by path without extension
#[derive(Default)]
struct ShapefileMembers {
    shp: Option<Vec<u8>>,
    dbf: Option<Vec<u8>>,
    prj: Option<String>,
}

impl ArchiveReader {
    /// KMZ: only the KML documents inside are read
    pub fn kmz() -> Self {
        Self {
            format: FileFormat::Kmz,
        }
    }

    pub fn zip() -> Self {
        Self {
            format: FileFormat::Zip,
        }
    }

    fn accepts(&self, format: FileFormat) -> bool {
        match self.format {
            FileFormat::Kmz => format == FileFormat::Kml,
            _ => !format.is_archive(),
        }
    }

    fn reads_shapefiles(&self) -> bool {
        self.format == FileFormat::Zip
    }
}

fn read_entry(file: &mut impl Read, size: u64) -> Result<Vec<u8>, IngestError> {
    let mut bytes = Vec::with_capacity(size as usize);
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

impl FormatReader for ArchiveReader {
    type Document = Vec<ArchiveEntry>;

    fn read(&self, bytes: &[u8]) -> Result<Vec<ArchiveEntry>, IngestError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = Vec::new();
        let mut shapefiles: BTreeMap<String, ShapefileMembers> = BTreeMap::new();

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let size = file.size();
            let path = Path::new(&name);
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();

            if self.reads_shapefiles() && matches!(extension.as_str(), "shp" | "dbf" | "prj") {
                let stem = path.with_extension("").to_string_lossy().to_lowercase();
                let members = shapefiles.entry(stem).or_default();
                let bytes = read_entry(&mut file, size)?;
                match extension.as_str() {
                    "shp" => members.shp = Some(bytes),
                    "dbf" => members.dbf = Some(bytes),
                    _ => members.prj = Some(String::from_utf8_lossy(&bytes).into_owned()),
                }
                continue;
            }

            match FileFormat::from_extension(&extension) {
                Some(format) if self.accepts(format) => {
                    let bytes = read_entry(&mut file, size)?;
                    entries.push(ArchiveEntry::Document {
                        name,
                        format,
                        bytes,
                    });
                }
                _ => tracing::debug!(entry = %name, archive = %self.format, "Skipping archive entry"),
            }
        }

        for (stem, members) in shapefiles {
            let Some(shp) = members.shp else {
                tracing::debug!(%stem, "Skipping shapefile parts without a .shp");
                continue;
            };
            if members.dbf.is_none() {
                tracing::warn!(%stem, "Shapefile without a .dbf, features have no attributes");
            }
            entries.push(ArchiveEntry::Shapefile {
                name: format!("{stem}.shp"),
                parts: Shapefile {
                    shp,
                    dbf: members.dbf,
                    prj: members.prj,
                },
            });
        }

        if entries.is_empty() {
            return Err(IngestError::UnsupportedFormat(format!(
                "{} archive without readable documents",
                self.format
            )));
        }
        Ok(entries)
    }

    fn to_collection(&self, document: Vec<ArchiveEntry>) -> Result<FeatureCollection, IngestError> {
        let mut merged = FeatureCollection::default();
        for entry in document {
            let (name, collection) = match entry {
                ArchiveEntry::Document {
                    name,
                    format,
                    bytes,
                } => (name, super::read_format(&bytes, format)?),
                ArchiveEntry::Shapefile { name, parts } => (name, parts.to_collection()?),
            };
            tracing::debug!(
                entry = %name,
                features = collection.len(),
                "Read archive entry"
            );
            merged
                .features
                .extend(super::detect_and_reproject(collection).features);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::shp::tests::{dbf, point_shp};
    use geo::{Geometry, Point};
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_binary_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn build_archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let entries: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(name, content)| (*name, content.as_bytes()))
            .collect();
        build_binary_archive(&entries)
    }

    const KML: &str = r#"<kml><Placemark><name>4</name>
        <Point><coordinates>85.3,27.6</coordinates></Point></Placemark></kml>"#;

    #[test]
    fn test_kmz_reads_kml_only() {
        let bytes = build_archive(&[
            ("doc.kml", KML),
            ("files/icon.png", "not an image"),
            ("extra.geojson", r#"{"type":"Point","coordinates":[0,0]}"#),
        ]);
        let collection = ArchiveReader::kmz().parse(&bytes).unwrap();
        assert_eq!(collection.len(), 1);
        assert_eq!(
            collection.features[0].geometry,
            Some(Geometry::Point(Point::new(85.3, 27.6)))
        );
    }

    #[test]
    fn test_zip_merges_and_reprojects_each_entry() {
        let projected = crate::projection::from_wgs84(
            crate::projection::Crs::WebMercator,
            geo::Coord { x: 85.3, y: 27.7 },
        )
        .unwrap();
        let (x, y) = (projected.x, projected.y);
        let projected = format!(
            r#"{{"type":"FeatureCollection","crs":{{"type":"name","properties":{{"name":"EPSG:3857"}}}},
                "features":[{{"type":"Feature","geometry":{{"type":"Point","coordinates":[{x},{y}]}},"properties":{{}}}}]}}"#
        );
        let bytes = build_archive(&[
            ("a.kml", KML),
            ("b.geojson", projected.as_str()),
            ("c.txt", "notes"),
        ]);
        let collection = ArchiveReader::zip().parse(&bytes).unwrap();
        assert_eq!(collection.len(), 2);

        let Some(Geometry::Point(p)) = collection.features[1].geometry else {
            panic!("expected a point");
        };
        assert!((p.x() - 85.3).abs() < 1e-6);
        assert!((p.y() - 27.7).abs() < 1e-6);
    }

    #[test]
    fn test_zip_shapefile_with_projection() {
        let shp = point_shp(&[(334749.79, 3061902.67)]);
        let table = dbf(&["HOUSE_NO", "ROAD"], &[&["12", "Mangal Bazar"]]);
        let prj = br#"PROJCS["WGS_1984_UTM_Zone_45N",GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984"]]]"#;
        let bytes = build_binary_archive(&[
            ("Patan/Addresses.SHP", shp.as_slice()),
            ("Patan/Addresses.dbf", table.as_slice()),
            ("Patan/Addresses.prj", prj.as_slice()),
            ("Patan/Addresses.shx", b"index".as_slice()),
        ]);

        let collection = ArchiveReader::zip().parse(&bytes).unwrap();
        assert_eq!(collection.len(), 1);
        let feature = &collection.features[0];
        assert_eq!(feature.properties["HOUSE_NO"], "12");
        assert_eq!(feature.properties["ROAD"], "Mangal Bazar");

        let Some(Geometry::Point(p)) = feature.geometry else {
            panic!("expected a point");
        };
        assert!((p.x() - 85.3245).abs() < 1e-5, "{p:?}");
        assert!((p.y() - 27.6712).abs() < 1e-5, "{p:?}");
    }

    #[test]
    fn test_kmz_ignores_shapefiles() {
        let shp = point_shp(&[(85.3, 27.6)]);
        let bytes = build_binary_archive(&[
            ("doc.kml", KML.as_bytes()),
            ("extra.shp", shp.as_slice()),
        ]);
        assert_eq!(ArchiveReader::kmz().parse(&bytes).unwrap().len(), 1);
    }

    #[test]
    fn test_shapefile_parts_without_shp() {
        let table = dbf(&["HN"], &[&["1"]]);
        let bytes = build_binary_archive(&[("a.dbf", table.as_slice())]);
        assert!(matches!(
            ArchiveReader::zip().parse(&bytes),
            Err(IngestError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_archive_without_documents() {
        let bytes = build_archive(&[("readme.txt", "hello")]);
        assert!(matches!(
            ArchiveReader::zip().parse(&bytes),
            Err(IngestError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_not_an_archive() {
        assert!(matches!(
            ArchiveReader::zip().parse(b"plain text"),
            Err(IngestError::Archive(_))
        ));
    }
}
