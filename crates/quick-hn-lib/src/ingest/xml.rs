//! KML and GML readers
//!
//! Both formats are walked as a stream of `quick-xml` events. Element local names are kept
//! on a stack, so namespace prefixes (`gml:`, `kml:`, `wfs:`) never matter. Geometry parts
//! found inside one feature are assembled by [`GeometryBuilder`]; a feature with several
//! parts becomes a geometry collection.

use super::{FeatureCollection, FileFormat, FormatReader, IngestError, RawFeature};
use geo::{Coord, Geometry, GeometryCollection, LineString, Point, Polygon};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

/// Callbacks for [`walk`]
///
/// `stack` never includes the element being opened or closed.
trait XmlHandler {
    fn start(
        &mut self,
        element: &BytesStart,
        name: &str,
        stack: &[String],
    ) -> Result<(), IngestError>;

    fn text(&mut self, text: &str, stack: &[String]) -> Result<(), IngestError>;

    fn end(&mut self, name: &str, stack: &[String]);
}

fn walk(text: &str, handler: &mut impl XmlHandler) -> Result<(), IngestError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                let name = local_name(&element);
                handler.start(&element, &name, &stack)?;
                stack.push(name);
            }
            Event::Empty(element) => {
                let name = local_name(&element);
                handler.start(&element, &name, &stack)?;
                handler.end(&name, &stack);
            }
            Event::End(_) => {
                if let Some(name) = stack.pop() {
                    handler.end(&name, &stack);
                }
            }
            Event::Text(text) => handler.text(&text.unescape()?, &stack)?,
            Event::CData(data) => handler.text(&String::from_utf8_lossy(&data), &stack)?,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(())
}

fn local_name(element: &BytesStart) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

fn attribute(element: &BytesStart, key: &str) -> Result<Option<String>, IngestError> {
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.local_name().as_ref() == key.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn decode_text(format: FileFormat, bytes: &[u8]) -> Result<&str, IngestError> {
    std::str::from_utf8(bytes).map_err(|e| IngestError::Parse {
        format,
        message: e.to_string(),
    })
}

fn number(format: FileFormat, token: &str) -> Result<f64, IngestError> {
    token.trim().parse().map_err(|_| IngestError::Parse {
        format,
        message: format!("invalid coordinate '{token}'"),
    })
}

/// Parse `x,y[,z] x,y[,z] ...` tuples, ignoring any third ordinate
fn parse_tuples(format: FileFormat, text: &str) -> Result<Vec<Coord<f64>>, IngestError> {
    text.split_whitespace()
        .map(|tuple| {
            let mut parts = tuple.split(',');
            match (parts.next(), parts.next()) {
                (Some(x), Some(y)) => Ok(Coord {
                    x: number(format, x)?,
                    y: number(format, y)?,
                }),
                _ => Err(IngestError::Parse {
                    format,
                    message: format!("invalid coordinate tuple '{tuple}'"),
                }),
            }
        })
        .collect()
}

/// Parse a flat whitespace-separated ordinate list with `dimension` values per position
fn parse_pos_list(text: &str, dimension: usize) -> Result<Vec<Coord<f64>>, IngestError> {
    let values = text
        .split_whitespace()
        .map(|token| number(FileFormat::Gml, token))
        .collect::<Result<Vec<_>, _>>()?;
    let dimension = dimension.max(2);
    if values.len() % dimension != 0 {
        return Err(IngestError::Parse {
            format: FileFormat::Gml,
            message: format!("{} ordinates do not form {dimension}D positions", values.len()),
        });
    }
    Ok(values
        .chunks_exact(dimension)
        .map(|c| Coord { x: c[0], y: c[1] })
        .collect())
}

/// Accumulates the geometry parts of one feature
#[derive(Debug, Default)]
struct GeometryBuilder {
    parts: Vec<Geometry<f64>>,
    exterior: Option<LineString<f64>>,
    interiors: Vec<LineString<f64>>,
}

impl GeometryBuilder {
    /// Route a coordinate list to the innermost enclosing geometry element
    fn coordinates(&mut self, coords: Vec<Coord<f64>>, stack: &[String]) {
        let innermost = stack.iter().rev().find(|name| {
            matches!(
                name.as_str(),
                "Point" | "LineString" | "LinearRing" | "LineStringSegment" | "Envelope"
            )
        });
        match innermost.map(String::as_str) {
            Some("Point") => {
                if let Some(first) = coords.first() {
                    self.parts.push(Geometry::Point(Point::from(*first)));
                }
            }
            Some("LineString" | "LineStringSegment") => {
                self.parts.push(Geometry::LineString(LineString::new(coords)));
            }
            Some("LinearRing") => {
                let inner = stack
                    .iter()
                    .any(|name| name == "innerBoundaryIs" || name == "interior");
                if inner {
                    self.interiors.push(LineString::new(coords));
                } else {
                    self.exterior = Some(LineString::new(coords));
                }
            }
            _ => {}
        }
    }

    fn end_polygon(&mut self) {
        let interiors = std::mem::take(&mut self.interiors);
        if let Some(exterior) = self.exterior.take() {
            self.parts
                .push(Geometry::Polygon(Polygon::new(exterior, interiors)));
        }
    }

    fn finish(mut self) -> Option<Geometry<f64>> {
        match self.parts.len() {
            0 => None,
            1 => self.parts.pop(),
            _ => Some(Geometry::GeometryCollection(GeometryCollection::new_from(
                self.parts,
            ))),
        }
    }
}

/// One feature as found in an XML document
#[derive(Debug, Default)]
pub struct XmlFeature {
    properties: Map<String, Value>,
    geometry: GeometryBuilder,
}

impl XmlFeature {
    fn set(&mut self, key: &str, value: &str) {
        self.properties
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    fn into_raw(self) -> RawFeature {
        RawFeature {
            geometry: self.geometry.finish(),
            properties: self.properties,
        }
    }
}

/// Reads KML placemarks
///
/// `name`, `description` and `address` of the placemark plus every `ExtendedData` entry
/// (`Data`/`value` and `SchemaData`/`SimpleData`) become properties.
#[derive(Clone, Copy, Debug, Default)]
pub struct KmlReader;

#[derive(Default)]
struct KmlHandler {
    placemarks: Vec<XmlFeature>,
    current: Option<XmlFeature>,
    data_name: Option<String>,
}

impl XmlHandler for KmlHandler {
    fn start(
        &mut self,
        element: &BytesStart,
        name: &str,
        _stack: &[String],
    ) -> Result<(), IngestError> {
        match name {
            "Placemark" => self.current = Some(XmlFeature::default()),
            "Data" | "SimpleData" => self.data_name = attribute(element, "name")?,
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str, stack: &[String]) -> Result<(), IngestError> {
        let Some(feature) = self.current.as_mut() else {
            return Ok(());
        };
        let (Some(last), parent) = (stack.last(), stack.len().checked_sub(2).map(|i| &stack[i]))
        else {
            return Ok(());
        };

        match (last.as_str(), parent.map(String::as_str)) {
            ("coordinates", _) => {
                let coords = parse_tuples(FileFormat::Kml, text)?;
                feature.geometry.coordinates(coords, stack);
            }
            ("value", Some("Data")) | ("SimpleData", _) => {
                if let Some(key) = &self.data_name {
                    feature.set(key, text);
                }
            }
            ("name" | "description" | "address", Some("Placemark")) => feature.set(last, text),
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &str, _stack: &[String]) {
        match name {
            "Polygon" => {
                if let Some(feature) = self.current.as_mut() {
                    feature.geometry.end_polygon();
                }
            }
            "Data" | "SimpleData" => self.data_name = None,
            "Placemark" => self.placemarks.extend(self.current.take()),
            _ => {}
        }
    }
}

impl FormatReader for KmlReader {
    type Document = Vec<XmlFeature>;

    fn read(&self, bytes: &[u8]) -> Result<Vec<XmlFeature>, IngestError> {
        let mut handler = KmlHandler::default();
        walk(decode_text(FileFormat::Kml, bytes)?, &mut handler)?;
        Ok(handler.placemarks)
    }

    fn to_collection(&self, document: Vec<XmlFeature>) -> Result<FeatureCollection, IngestError> {
        Ok(FeatureCollection {
            crs: None,
            features: document.into_iter().map(XmlFeature::into_raw).collect(),
        })
    }
}

/// Reads GML feature collections (WFS output and OGR exports)
///
/// Every child of a `featureMember`, `featureMembers` or `member` element is a feature;
/// its simple child elements become properties. The first `srsName` in the document is
/// reported as the collection CRS. Positions are read in document order as `x y`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GmlReader;

/// Parsed GML features with the declared reference system
#[derive(Debug, Default)]
pub struct GmlDocument {
    pub srs_name: Option<String>,
    features: Vec<XmlFeature>,
}

#[derive(Default)]
struct GmlHandler {
    document: GmlDocument,
    /// Stack depth of the open feature element
    current: Option<(usize, XmlFeature)>,
    dimension: Option<usize>,
}

impl XmlHandler for GmlHandler {
    fn start(
        &mut self,
        element: &BytesStart,
        _name: &str,
        stack: &[String],
    ) -> Result<(), IngestError> {
        if self.document.srs_name.is_none() {
            self.document.srs_name = attribute(element, "srsName")?;
        }
        if let Some(dimension) = attribute(element, "srsDimension")? {
            self.dimension = dimension.trim().parse().ok();
        }

        let is_member = stack.last().is_some_and(|parent| {
            matches!(parent.as_str(), "featureMember" | "featureMembers" | "member")
        });
        if self.current.is_none() && is_member {
            self.current = Some((stack.len(), XmlFeature::default()));
        }
        Ok(())
    }

    fn text(&mut self, text: &str, stack: &[String]) -> Result<(), IngestError> {
        let Some((depth, feature)) = self.current.as_mut() else {
            return Ok(());
        };
        if stack.iter().any(|name| name == "boundedBy") {
            return Ok(());
        }
        let Some(last) = stack.last() else {
            return Ok(());
        };

        match last.as_str() {
            "pos" | "posList" => {
                let coords = parse_pos_list(text, self.dimension.unwrap_or(2))?;
                feature.geometry.coordinates(coords, stack);
            }
            "coordinates" => {
                let coords = parse_tuples(FileFormat::Gml, text)?;
                feature.geometry.coordinates(coords, stack);
            }
            property if stack.len() == *depth + 2 => feature.set(property, text),
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &str, stack: &[String]) {
        if name == "Polygon" {
            if let Some((_, feature)) = self.current.as_mut() {
                feature.geometry.end_polygon();
            }
        }
        if matches!(name, "pos" | "posList") {
            self.dimension = None;
        }
        if self
            .current
            .as_ref()
            .is_some_and(|(depth, _)| stack.len() == *depth)
        {
            if let Some((_, feature)) = self.current.take() {
                self.document.features.push(feature);
            }
        }
    }
}

impl FormatReader for GmlReader {
    type Document = GmlDocument;

    fn read(&self, bytes: &[u8]) -> Result<GmlDocument, IngestError> {
        let mut handler = GmlHandler::default();
        walk(decode_text(FileFormat::Gml, bytes)?, &mut handler)?;
        Ok(handler.document)
    }

    fn to_collection(&self, document: GmlDocument) -> Result<FeatureCollection, IngestError> {
        Ok(FeatureCollection {
            crs: document.srs_name,
            features: document
                .features
                .into_iter()
                .map(XmlFeature::into_raw)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KML: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <name>Patan</name>
    <Placemark>
      <name>House 12</name>
      <description><![CDATA[<b>Mangal</b> Bazar]]></description>
      <ExtendedData>
        <Data name="number"><value>12</value></Data>
        <SchemaData schemaUrl="#s"><SimpleData name="street">Araniko Marg</SimpleData></SchemaData>
      </ExtendedData>
      <Point><coordinates>85.3240,27.6710,1300</coordinates></Point>
    </Placemark>
    <Placemark>
      <Polygon>
        <outerBoundaryIs><LinearRing><coordinates>
          0,0 2,0 2,2 0,2 0,0
        </coordinates></LinearRing></outerBoundaryIs>
        <innerBoundaryIs><LinearRing><coordinates>
          0.5,0.5 1,0.5 1,1 0.5,0.5
        </coordinates></LinearRing></innerBoundaryIs>
      </Polygon>
    </Placemark>
  </Document>
</kml>"##;

    #[test]
    fn test_kml_placemarks() {
        let collection = KmlReader.parse(KML.as_bytes()).unwrap();
        assert_eq!(collection.len(), 2);

        let first = &collection.features[0];
        assert_eq!(first.properties["name"], "House 12");
        assert_eq!(first.properties["description"], "<b>Mangal</b> Bazar");
        assert_eq!(first.properties["number"], "12");
        assert_eq!(first.properties["street"], "Araniko Marg");
        assert_eq!(
            first.geometry,
            Some(Geometry::Point(Point::new(85.324, 27.671)))
        );

        let Some(Geometry::Polygon(polygon)) = &collection.features[1].geometry else {
            panic!("expected a polygon");
        };
        assert_eq!(polygon.exterior().0.len(), 5);
        assert_eq!(polygon.interiors().len(), 1);
    }

    #[test]
    fn test_kml_document_name_not_a_property() {
        let collection = KmlReader.parse(KML.as_bytes()).unwrap();
        assert!(
            collection
                .features
                .iter()
                .all(|f| f.properties.get("name").is_none_or(|n| n != "Patan"))
        );
    }

    #[test]
    fn test_kml_invalid_coordinates() {
        let text = "<kml><Placemark><Point><coordinates>a,b</coordinates></Point></Placemark></kml>";
        assert!(matches!(
            KmlReader.parse(text.as_bytes()),
            Err(IngestError::Parse { .. })
        ));
    }

    const GML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<wfs:FeatureCollection xmlns:wfs="http://www.opengis.net/wfs" xmlns:gml="http://www.opengis.net/gml" xmlns:np="urn:np">
  <gml:boundedBy>
    <gml:Envelope srsName="EPSG:3857">
      <gml:lowerCorner>0 0</gml:lowerCorner>
      <gml:upperCorner>1 1</gml:upperCorner>
    </gml:Envelope>
  </gml:boundedBy>
  <gml:featureMember>
    <np:address>
      <np:number>7</np:number>
      <np:street>Ring Road</np:street>
      <np:geom><gml:Point><gml:pos>9495000 3209000</gml:pos></gml:Point></np:geom>
    </np:address>
  </gml:featureMember>
  <gml:featureMember>
    <np:address>
      <np:number>9</np:number>
      <np:geom>
        <gml:LineString><gml:posList srsDimension="3">0 0 5 1 1 5</gml:posList></gml:LineString>
      </np:geom>
    </np:address>
  </gml:featureMember>
</wfs:FeatureCollection>"#;

    #[test]
    fn test_gml_features() {
        let collection = GmlReader.parse(GML.as_bytes()).unwrap();
        assert_eq!(collection.crs.as_deref(), Some("EPSG:3857"));
        assert_eq!(collection.len(), 2);

        let first = &collection.features[0];
        assert_eq!(first.properties["number"], "7");
        assert_eq!(first.properties["street"], "Ring Road");
        assert!(first.properties.get("pos").is_none());
        assert_eq!(
            first.geometry,
            Some(Geometry::Point(Point::new(9495000.0, 3209000.0)))
        );

        let Some(Geometry::LineString(line)) = &collection.features[1].geometry else {
            panic!("expected a line string");
        };
        assert_eq!(line.0, vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }]);
    }

    #[test]
    fn test_gml_wfs2_members() {
        let text = r#"<wfs:FeatureCollection xmlns:wfs="w" xmlns:gml="g">
            <wfs:member><a><n>1</n><g><gml:Point><gml:coordinates>5,6</gml:coordinates></gml:Point></g></a></wfs:member>
        </wfs:FeatureCollection>"#;
        let collection = GmlReader.parse(text.as_bytes()).unwrap();
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.features[0].properties["n"], "1");
        assert_eq!(
            collection.features[0].geometry,
            Some(Geometry::Point(Point::new(5.0, 6.0)))
        );
    }

    #[test]
    fn test_pos_list_dimension_mismatch() {
        assert!(parse_pos_list("1 2 3", 2).is_err());
        assert_eq!(parse_pos_list("1 2 3 4", 2).unwrap().len(), 2);
    }
}
