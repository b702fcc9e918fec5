//! Utility functions for distances, extents and small geometric operations
//!
//! All coordinates are WGS84 degrees with `x = lon` and `y = lat`. Reprojection lives in
//! [`crate::projection`].

use geo::{BoundingRect, Centroid, Coord, Geometry, Intersects, LineString, MultiPoint, Point};
use geo::{Polygon, Rect, Translate};

/// Mean Earth radius in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Geographic rectangle `[min_lon, min_lat, max_lon, max_lat]`
pub type Extent = [f64; 4];

/// Great-circle distance between two points in kilometers
#[inline]
pub fn haversine_km(p1: &Point<f64>, p2: &Point<f64>) -> f64 {
    let lat1 = p1.y().to_radians();
    let lat2 = p2.y().to_radians();
    let delta_lat = (p2.y() - p1.y()).to_radians();
    let delta_lon = (p2.x() - p1.x()).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Shortest distance in kilometers from a point to a polyline
///
/// Each vertex is projected onto a local equirectangular plane centred on `point`, which is
/// accurate to well under a meter at street scale. Returns `f64::INFINITY` for an empty line.
pub fn point_to_line_distance_km(point: &Point<f64>, line: &LineString<f64>) -> f64 {
    let scale = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;
    let cos_lat = point.y().to_radians().cos();
    let project = |c: &Coord<f64>| {
        Coord {
            x: (c.x - point.x()) * cos_lat * scale,
            y: (c.y - point.y()) * scale,
        }
    };

    let coords: Vec<Coord<f64>> = line.coords().map(project).collect();
    match coords.as_slice() {
        [] => f64::INFINITY,
        [only] => only.x.hypot(only.y),
        _ => coords
            .windows(2)
            .map(|w| origin_to_segment(w[0], w[1]))
            .fold(f64::INFINITY, f64::min),
    }
}

/// Distance from the origin to segment `a`-`b` in the projected plane
#[inline]
fn origin_to_segment(a: Coord<f64>, b: Coord<f64>) -> f64 {
    let d = b - a;
    let len2 = d.x * d.x + d.y * d.y;
    if len2 == 0.0 {
        return a.x.hypot(a.y);
    }
    let t = (-(a.x * d.x + a.y * d.y) / len2).clamp(0.0, 1.0);
    let closest = a + d * t;
    closest.x.hypot(closest.y)
}

/// Whether every ordinate of the extent is finite and min <= max on both axes
pub fn extent_is_valid(extent: &Extent) -> bool {
    extent.iter().all(|v| v.is_finite()) && extent[0] <= extent[2] && extent[1] <= extent[3]
}

/// Convert an extent into a rectangle
pub fn extent_to_rect(extent: &Extent) -> Rect<f64> {
    Rect::new(
        Coord {
            x: extent[0],
            y: extent[1],
        },
        Coord {
            x: extent[2],
            y: extent[3],
        },
    )
}

/// Convert a rectangle into an extent
pub fn rect_to_extent(rect: &Rect<f64>) -> Extent {
    [rect.min().x, rect.min().y, rect.max().x, rect.max().y]
}

/// Half-open containment: `min <= p < max` on both axes, so grid cells sharing an edge
/// never both own a point
#[inline]
pub fn rect_owns(rect: &Rect<f64>, point: &Point<f64>) -> bool {
    point.x() >= rect.min().x
        && point.x() < rect.max().x
        && point.y() >= rect.min().y
        && point.y() < rect.max().y
}

/// Inclusive containment of a point in an extent
#[inline]
pub fn extent_contains(extent: &Extent, point: &Point<f64>) -> bool {
    point.x() >= extent[0]
        && point.x() <= extent[2]
        && point.y() >= extent[1]
        && point.y() <= extent[3]
}

/// Whether a region polygon and a rectangle share no point
pub fn region_disjoint(region: &Polygon<f64>, rect: &Rect<f64>) -> bool {
    !region.intersects(rect)
}

/// Representative point of an arbitrary geometry
///
/// Points are returned unchanged, everything else is reduced to its centroid. `None` for
/// empty geometries.
pub fn representative_point(geometry: &Geometry<f64>) -> Option<Point<f64>> {
    match geometry {
        Geometry::Point(p) => Some(*p),
        other => other.centroid(),
    }
}

/// Translate a point by `(dx, dy)` degrees, returning a new point
#[inline]
pub fn translate(point: &Point<f64>, dx: f64, dy: f64) -> Point<f64> {
    point.translate(dx, dy)
}

/// Bounding rectangle of a set of points
pub fn bounds_of<'a>(points: impl IntoIterator<Item = &'a Point<f64>>) -> Option<Rect<f64>> {
    let multi: MultiPoint<f64> = points.into_iter().copied().collect();
    multi.bounding_rect()
}
