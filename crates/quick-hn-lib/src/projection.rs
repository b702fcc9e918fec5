//! Coordinate reference systems and reprojection to WGS84
//!
//! Only the reference systems address data actually arrives in are supported:
//! - EPSG:4326 (WGS84) and EPSG:4269 (NAD83, treated as identical at this scale)
//! - EPSG:3857 (Web Mercator)
//! - EPSG:326xx / 327xx (WGS84 UTM zones 1-60, north and south)
//! - EPSG:3794 (Slovenia 1996 / Slovene National Grid)
//!
//! Each system maps to a proj string and [`proj4rs`] does the math. Geographic coordinates
//! go in and come out in degrees; the radian convention of the library stays in here.

use geo::{Coord, Geometry, MapCoords, MapCoordsInPlace};
use once_cell::sync::Lazy;
use proj4rs::Proj;
use regex::Regex;
use proj4rs::transform::transform;

/// Geographic WGS84, the target of every reprojection
const WGS84_DEFINITION: &str = "+proj=longlat +datum=WGS84 +no_defs";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProjectionError {
    #[error("Unknown coordinate reference system: {0}")]
    UnknownCrs(String),

    #[error("Invalid coordinate ({x}, {y})")]
    InvalidCoordinate { x: f64, y: f64 },

    #[error("Projection failed: {0}")]
    Transform(String),
}

impl From<proj4rs::errors::Error> for ProjectionError {
    fn from(error: proj4rs::errors::Error) -> Self {
        Self::Transform(error.to_string())
    }
}

/// Supported coordinate reference systems
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crs {
    Wgs84,
    Nad83,
    WebMercator,
    Utm { zone: u8, south: bool },
    /// EPSG:3794
    Slovenia96,
}

impl Crs {
    /// Look up a CRS by EPSG code
    pub fn from_epsg(code: u32) -> Option<Self> {
        match code {
            4326 => Some(Self::Wgs84),
            4269 => Some(Self::Nad83),
            3857 | 900913 => Some(Self::WebMercator),
            3794 => Some(Self::Slovenia96),
            32601..=32660 => Some(Self::Utm {
                zone: (code - 32600) as u8,
                south: false,
            }),
            32701..=32760 => Some(Self::Utm {
                zone: (code - 32700) as u8,
                south: true,
            }),
            _ => None,
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Self::Wgs84 => 4326,
            Self::Nad83 => 4269,
            Self::WebMercator => 3857,
            Self::Slovenia96 => 3794,
            Self::Utm { zone, south: false } => 32600 + u32::from(*zone),
            Self::Utm { zone, south: true } => 32700 + u32::from(*zone),
        }
    }

    /// Whether coordinates in this CRS are already WGS84 degrees
    pub fn is_geographic(&self) -> bool {
        matches!(self, Self::Wgs84 | Self::Nad83)
    }

    /// proj string of the system
    pub fn definition(&self) -> String {
        match self {
            Self::Wgs84 | Self::Nad83 => WGS84_DEFINITION.to_string(),
            Self::WebMercator => "+proj=webmerc +datum=WGS84 +units=m +no_defs".to_string(),
            Self::Utm { zone, south } => format!(
                "+proj=utm +zone={zone}{} +datum=WGS84 +units=m +no_defs",
                if *south { " +south" } else { "" }
            ),
            Self::Slovenia96 => "+proj=tmerc +lat_0=0 +lon_0=15 +k=0.9999 +x_0=500000 \
                                 +y_0=-5000000 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs"
                .to_string(),
        }
    }
}

/// Identifiers that name WGS84 or NAD83 without an EPSG code
const ALIASES: &[(&str, u32)] = &[
    ("CRS84", 4326),
    ("urn:ogc:def:crs:OGC:1.3:CRS84", 4326),
    ("urn:ogc:def:crs:OGC::CRS84", 4326),
    ("WGS84", 4326),
    ("WGS 84", 4326),
    ("WGS_84", 4326),
    ("CRS:84", 4326),
    ("NAD83", 4269),
    ("NAD 83", 4269),
];

/// Prefixes followed by a bare EPSG code
const CODE_PREFIXES: &[&str] = &[
    "urn:ogc:def:crs:EPSG::",
    "urn:ogc:def:crs:EPSG:",
    "http://www.opengis.net/def/crs/EPSG/0/",
    "http://www.opengis.net/gml/srs/epsg.xml#",
    "EPSG:",
    "CRS:",
];

/// Resolve a CRS identifier as found in GeoJSON, GML or WKT input
///
/// Accepts the common aliases, `EPSG:{code}`, `CRS:{code}`, both EPSG URN spellings and
/// OGC definition URLs. Matching is case-insensitive.
pub fn resolve_crs(name: &str) -> Result<Crs, ProjectionError> {
    let trimmed = name.trim();
    let unknown = || ProjectionError::UnknownCrs(trimmed.to_string());

    if let Some((_, code)) = ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
    {
        return Crs::from_epsg(*code).ok_or_else(unknown);
    }

    let code = CODE_PREFIXES
        .iter()
        .find_map(|prefix| strip_prefix_ignore_case(trimmed, prefix))
        .unwrap_or(trimmed);
    let code: u32 = code.trim().parse().map_err(|_| unknown())?;
    Crs::from_epsg(code).ok_or_else(unknown)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &s[prefix.len()..])
}

static EPSG_AUTHORITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)AUTHORITY\[\s*"EPSG"\s*,\s*"?(\d+)"?\s*\]"#)
        .expect("authority pattern is valid")
});

static UTM_ZONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)UTM[_ ]zone[_ ](\d{1,2})\s*([NS])").expect("UTM zone pattern is valid")
});

/// Identify the CRS of a WKT definition as found in a shapefile `.prj`
///
/// The outermost EPSG authority wins. ESRI definitions carry none, so their names are
/// matched against the supported systems. Returns `None` for anything else.
pub fn crs_from_prj(wkt: &str) -> Option<Crs> {
    if let Some(code) = EPSG_AUTHORITY
        .captures_iter(wkt)
        .last()
        .and_then(|captures| captures[1].parse::<u32>().ok())
    {
        return Crs::from_epsg(code);
    }

    let compact = wkt.to_ascii_lowercase().replace(' ', "_");
    if compact.trim_start_matches('_').starts_with("projcs") {
        if let Some(captures) = UTM_ZONE.captures(wkt) {
            let zone: u8 = captures[1].parse().ok()?;
            let south = captures[2].eq_ignore_ascii_case("s");
            return (compact.contains("wgs_1984") || compact.contains("wgs_84"))
                .then_some(Crs::Utm { zone, south })
                .filter(|crs| Crs::from_epsg(crs.epsg()).is_some());
        }
        if [
            "pseudo_mercator",
            "pseudo-mercator",
            "web_mercator",
            "popular_visualisation",
            "auxiliary_sphere",
        ]
        .iter()
        .any(|name| compact.contains(name))
        {
            return Some(Crs::WebMercator);
        }
        if compact.contains("slovenia_1996") || compact.contains("d96_tm") {
            return Some(Crs::Slovenia96);
        }
        return None;
    }
    if compact.contains("wgs_1984") || compact.contains("wgs_84") {
        return Some(Crs::Wgs84);
    }
    (compact.contains("north_american_1983") || compact.contains("nad83")).then_some(Crs::Nad83)
}

/// Both ends of a conversion between one CRS and WGS84
///
/// Building one parses two proj strings; reuse it for every coordinate of a batch.
pub struct Reprojector {
    crs: Crs,
    native: Proj,
    wgs84: Proj,
}

impl Reprojector {
    pub fn new(crs: Crs) -> Result<Self, ProjectionError> {
        Ok(Self {
            crs,
            native: Proj::from_proj_string(&crs.definition())?,
            wgs84: Proj::from_proj_string(WGS84_DEFINITION)?,
        })
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    /// Convert a coordinate in the native CRS to WGS84 `(lon, lat)` degrees
    pub fn to_wgs84(&self, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
        check_finite(coord)?;
        if self.crs.is_geographic() {
            return Ok(coord);
        }
        let (lon, lat) = self.native_to_degrees(coord)?;
        if !lon.is_finite() || !lat.is_finite() || lat.abs() > 90.0 {
            return Err(ProjectionError::InvalidCoordinate {
                x: coord.x,
                y: coord.y,
            });
        }
        Ok(Coord { x: lon, y: lat })
    }

    /// Convert WGS84 `(lon, lat)` degrees into the native CRS
    pub fn from_wgs84(&self, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
        check_finite(coord)?;
        if coord.y.abs() > 90.0 {
            return Err(ProjectionError::InvalidCoordinate {
                x: coord.x,
                y: coord.y,
            });
        }
        if self.crs.is_geographic() {
            return Ok(coord);
        }
        let mut point = (coord.x.to_radians(), coord.y.to_radians());
        transform(&self.wgs84, &self.native, &mut point)?;
        Ok(Coord {
            x: point.0,
            y: point.1,
        })
    }

    /// Reproject every coordinate of a geometry to WGS84 degrees
    pub fn reproject(&self, geometry: &Geometry<f64>) -> Result<Geometry<f64>, ProjectionError> {
        if self.crs.is_geographic() {
            return Ok(geometry.clone());
        }
        let mut reprojected = geometry.try_map_coords(check_finite)?;
        transform(&self.native, &self.wgs84, &mut reprojected)?;
        reprojected.map_coords_in_place(|c| Coord {
            x: c.x.to_degrees(),
            y: c.y.to_degrees(),
        });
        reprojected.try_map_coords(|c| {
            if c.x.is_finite() && c.y.is_finite() && c.y.abs() <= 90.0 {
                Ok(c)
            } else {
                Err(ProjectionError::InvalidCoordinate { x: c.x, y: c.y })
            }
        })
    }

    fn native_to_degrees(&self, coord: Coord<f64>) -> Result<(f64, f64), ProjectionError> {
        let mut point = (coord.x, coord.y);
        transform(&self.native, &self.wgs84, &mut point)?;
        Ok((point.0.to_degrees(), point.1.to_degrees()))
    }
}

fn check_finite(coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
    if coord.x.is_finite() && coord.y.is_finite() {
        Ok(coord)
    } else {
        Err(ProjectionError::InvalidCoordinate {
            x: coord.x,
            y: coord.y,
        })
    }
}

/// Convert a coordinate in `crs` to WGS84 `(lon, lat)` degrees
pub fn to_wgs84(crs: Crs, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
    Reprojector::new(crs)?.to_wgs84(coord)
}

/// Convert WGS84 `(lon, lat)` degrees into `crs`
pub fn from_wgs84(crs: Crs, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
    Reprojector::new(crs)?.from_wgs84(coord)
}

/// Reproject every coordinate of a geometry to WGS84
pub fn reproject_geometry(
    crs: Crs,
    geometry: &Geometry<f64>,
) -> Result<Geometry<f64>, ProjectionError> {
    if crs.is_geographic() {
        return Ok(geometry.clone());
    }
    Reprojector::new(crs)?.reproject(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Coord<f64>, expected: (f64, f64), tolerance: f64) {
        assert!(
            (actual.x - expected.0).abs() < tolerance && (actual.y - expected.1).abs() < tolerance,
            "{actual:?} is not within {tolerance} of {expected:?}"
        );
    }

    #[test]
    fn test_resolve_aliases() {
        assert_eq!(resolve_crs("CRS84"), Ok(Crs::Wgs84));
        assert_eq!(resolve_crs("urn:ogc:def:crs:OGC:1.3:CRS84"), Ok(Crs::Wgs84));
        assert_eq!(resolve_crs("WGS 84"), Ok(Crs::Wgs84));
        assert_eq!(resolve_crs("wgs84"), Ok(Crs::Wgs84));
        assert_eq!(resolve_crs("NAD83"), Ok(Crs::Nad83));
    }

    #[test]
    fn test_resolve_code_templates() {
        assert_eq!(resolve_crs("EPSG:3857"), Ok(Crs::WebMercator));
        assert_eq!(resolve_crs("urn:ogc:def:crs:EPSG::4326"), Ok(Crs::Wgs84));
        assert_eq!(resolve_crs("urn:ogc:def:crs:EPSG:3794"), Ok(Crs::Slovenia96));
        assert_eq!(
            resolve_crs("http://www.opengis.net/def/crs/EPSG/0/32645"),
            Ok(Crs::Utm {
                zone: 45,
                south: false
            })
        );
        assert_eq!(
            resolve_crs("EPSG:32733"),
            Ok(Crs::Utm {
                zone: 33,
                south: true
            })
        );
        assert_eq!(resolve_crs("4269"), Ok(Crs::Nad83));
    }

    #[test]
    fn test_resolve_unknown() {
        assert!(matches!(
            resolve_crs("EPSG:27700"),
            Err(ProjectionError::UnknownCrs(_))
        ));
        assert!(matches!(
            resolve_crs("EPSG:32661"),
            Err(ProjectionError::UnknownCrs(_))
        ));
        assert!(matches!(
            resolve_crs("not a crs"),
            Err(ProjectionError::UnknownCrs(_))
        ));
    }

    #[test]
    fn test_epsg_roundtrip() {
        for code in [4326, 4269, 3857, 3794, 32601, 32645, 32660, 32701, 32760] {
            assert_eq!(Crs::from_epsg(code).map(|c| c.epsg()), Some(code));
        }
    }

    #[test]
    fn test_crs_from_prj() {
        let esri_utm = r#"PROJCS["WGS_1984_UTM_Zone_45N",GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Transverse_Mercator"],PARAMETER["Central_Meridian",87.0],UNIT["Meter",1.0]]"#;
        assert_eq!(
            crs_from_prj(esri_utm),
            Some(Crs::Utm {
                zone: 45,
                south: false
            })
        );

        let ogc = r#"PROJCS["WGS 84 / Pseudo-Mercator",GEOGCS["WGS 84",AUTHORITY["EPSG","4326"]],AUTHORITY["EPSG","3857"]]"#;
        assert_eq!(crs_from_prj(ogc), Some(Crs::WebMercator));

        let geographic = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]]]"#;
        assert_eq!(crs_from_prj(geographic), Some(Crs::Wgs84));

        assert_eq!(crs_from_prj(r#"PROJCS["Everest_1830_UTM_Zone_45N"]"#), None);
        assert_eq!(crs_from_prj(""), None);
    }

    #[test]
    fn test_every_definition_parses() {
        for code in [4326, 4269, 3857, 3794, 32601, 32645, 32733] {
            let crs = Crs::from_epsg(code).unwrap();
            assert!(Reprojector::new(crs).is_ok(), "{code} does not parse");
        }
    }

    #[test]
    fn test_utm_central_meridian_at_equator() {
        let crs = Crs::Utm {
            zone: 45,
            south: false,
        };
        let projected = from_wgs84(crs, Coord { x: 87.0, y: 0.0 }).unwrap();
        assert_close(projected, (500000.0, 0.0), 1e-3);
    }

    #[test]
    fn test_utm_scale_on_the_equator() {
        // 3 degrees east of the central meridian on the equator is a fixed distance
        let crs = Crs::Utm {
            zone: 45,
            south: false,
        };
        let projected = from_wgs84(crs, Coord { x: 90.0, y: 0.0 }).unwrap();
        assert!((projected.x - 834_000.0).abs() < 500.0, "{projected:?}");
        assert!(projected.y.abs() < 1e-3);
    }

    #[test]
    fn test_utm_kathmandu() {
        let crs = Crs::Utm {
            zone: 45,
            south: false,
        };
        let original = Coord { x: 85.324, y: 27.7172 };
        let projected = from_wgs84(crs, original).unwrap();

        assert_close(projected, (334769.78, 3067000.01), 0.05);

        let back = to_wgs84(crs, projected).unwrap();
        assert_close(back, (original.x, original.y), 1e-7);
    }

    #[test]
    fn test_utm_south_false_northing() {
        let crs = Crs::Utm {
            zone: 33,
            south: true,
        };
        let projected = from_wgs84(crs, Coord { x: 15.0, y: -10.0 }).unwrap();
        assert!(projected.y < 10000000.0 && projected.y > 8000000.0);
        let back = to_wgs84(crs, projected).unwrap();
        assert!((back.y + 10.0).abs() < 1e-7);
    }

    #[test]
    fn test_slovenia_origin() {
        // The central meridian carries the false easting
        let projected = from_wgs84(Crs::Slovenia96, Coord { x: 15.0, y: 46.0 }).unwrap();
        assert!((projected.x - 500000.0).abs() < 1e-3);

        let original = Coord { x: 14.5058, y: 46.0569 };
        let projected = from_wgs84(Crs::Slovenia96, original).unwrap();
        // Ljubljana is roughly (462000, 101000) in D96/TM
        assert!((projected.x - 462000.0).abs() < 2000.0);
        assert!((projected.y - 101000.0).abs() < 2000.0);

        let back = to_wgs84(Crs::Slovenia96, projected).unwrap();
        assert_close(back, (original.x, original.y), 1e-7);
    }

    #[test]
    fn test_web_mercator() {
        let projected = from_wgs84(Crs::WebMercator, Coord { x: 180.0, y: 0.0 }).unwrap();
        assert_close(projected, (20037508.342789244, 0.0), 1e-3);

        let back = to_wgs84(Crs::WebMercator, Coord { x: -14226.6, y: 6711542.5 }).unwrap();
        assert_close(back, (-0.1278, 51.5074), 1e-4);
    }

    #[test]
    fn test_invalid_coordinate() {
        let err = to_wgs84(Crs::WebMercator, Coord { x: f64::NAN, y: 0.0 });
        assert!(matches!(err, Err(ProjectionError::InvalidCoordinate { .. })));
        let err = from_wgs84(Crs::WebMercator, Coord { x: 0.0, y: 91.0 });
        assert!(matches!(err, Err(ProjectionError::InvalidCoordinate { .. })));
    }

    #[test]
    fn test_reproject_geometry() {
        let projected = from_wgs84(Crs::WebMercator, Coord { x: 85.3, y: 27.7 }).unwrap();
        let geometry = Geometry::LineString(geo::LineString::new(vec![projected, projected]));
        let Geometry::LineString(line) = reproject_geometry(Crs::WebMercator, &geometry).unwrap()
        else {
            panic!("expected a line string");
        };
        for coord in line.coords() {
            assert_close(*coord, (85.3, 27.7), 1e-9);
        }
    }
}
