//! Tile grid of the spatial cache

use crate::feature::Feature;
use futures::future::{BoxFuture, Shared};
use geo::{Coord, Point, Rect};
use std::sync::Arc;

/// Tile width in degrees of longitude
pub const TILE_WIDTH_DEG: f64 = 0.01;
/// Tile height in degrees of latitude
pub const TILE_HEIGHT_DEG: f64 = 0.005;

/// Integer cell of the lon/lat grid
///
/// Tile `(x, y)` covers `[x, x + 1) * 0.01°` of longitude and `[y, y + 1) * 0.005°` of
/// latitude.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub x: i64,
    pub y: i64,
}

impl TileCoord {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Tile containing a WGS84 position
    pub fn containing(lon: f64, lat: f64) -> Self {
        Self {
            x: (lon / TILE_WIDTH_DEG).floor() as i64,
            y: (lat / TILE_HEIGHT_DEG).floor() as i64,
        }
    }

    pub fn rect(&self) -> Rect<f64> {
        let min = Coord {
            x: self.x as f64 * TILE_WIDTH_DEG,
            y: self.y as f64 * TILE_HEIGHT_DEG,
        };
        let max = Coord {
            x: min.x + TILE_WIDTH_DEG,
            y: min.y + TILE_HEIGHT_DEG,
        };
        Rect::new(min, max)
    }

    pub fn center(&self) -> Point<f64> {
        self.rect().center().into()
    }

    /// Tiles covering `extent`, row-major: north to south, west to east within a row
    ///
    /// The extent is half-open like the tiles, so a maximum edge lying on a grid line does
    /// not pull in the next column or row.
    pub fn covering(extent: &Rect<f64>) -> impl Iterator<Item = TileCoord> {
        let (min_x, max_x) = cells(extent.min().x, extent.max().x, TILE_WIDTH_DEG);
        let (min_y, max_y) = cells(extent.min().y, extent.max().y, TILE_HEIGHT_DEG);
        (min_y..=max_y)
            .rev()
            .flat_map(move |y| (min_x..=max_x).map(move |x| TileCoord { x, y }))
    }
}

/// Grid lines closer than this fraction of a cell count as hit exactly
const SNAP: f64 = 1e-9;

/// First and last cell of the span `[min, max)`; a degenerate span still yields one cell
fn cells(min: f64, max: f64, size: f64) -> (i64, i64) {
    let first = (min / size + SNAP).floor() as i64;
    let last = ((max / size - SNAP).ceil() as i64 - 1).max(first);
    (first, last)
}

/// A load shared by every caller waiting for the same tile
pub(crate) type TileLoad = Shared<BoxFuture<'static, Arc<Vec<Feature>>>>;

/// State of a populated grid cell; absent cells are unpopulated
pub(crate) enum TileState {
    /// Sources are being queried. `generation` identifies this load so a late result
    /// cannot overwrite a tile that was evicted and requested again meanwhile.
    Loading { generation: u64, load: TileLoad },
    Loaded(Arc<Vec<Feature>>),
}

impl TileState {
    pub(crate) fn features(&self) -> Option<&Arc<Vec<Feature>>> {
        match self {
            TileState::Loaded(features) => Some(features),
            TileState::Loading { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::extent_to_rect;

    #[test]
    fn test_containing() {
        assert_eq!(TileCoord::containing(85.3205, 27.6702), TileCoord::new(8532, 5534));
        assert_eq!(TileCoord::containing(-0.005, -0.001), TileCoord::new(-1, -1));
    }

    #[test]
    fn test_rect_contains_its_points() {
        let coord = TileCoord::containing(85.3205, 27.6702);
        let rect = coord.rect();
        assert!(rect.min().x <= 85.3205 && 85.3205 < rect.max().x);
        assert!(rect.min().y <= 27.6702 && 27.6702 < rect.max().y);
        assert!((rect.width() - TILE_WIDTH_DEG).abs() < 1e-12);
        assert!((rect.height() - TILE_HEIGHT_DEG).abs() < 1e-12);
    }

    #[test]
    fn test_covering_is_row_major() {
        let extent = extent_to_rect(&[85.3205, 27.6702, 85.3395, 27.6758]);
        let tiles: Vec<_> = TileCoord::covering(&extent).collect();
        assert_eq!(
            tiles,
            vec![
                TileCoord::new(8532, 5535),
                TileCoord::new(8533, 5535),
                TileCoord::new(8532, 5534),
                TileCoord::new(8533, 5534),
            ]
        );
    }

    #[test]
    fn test_covering_a_tile_yields_only_that_tile() {
        for coord in [
            TileCoord::new(8532, 5534),
            TileCoord::new(8533, 5535),
            TileCoord::new(-1, -1),
        ] {
            let tiles: Vec<_> = TileCoord::covering(&coord.rect()).collect();
            assert_eq!(tiles, vec![coord]);
        }
    }

    #[test]
    fn test_covering_stops_at_grid_lines() {
        // East edge on 85.34, north edge on 27.675
        let extent = extent_to_rect(&[85.3205, 27.6702, 85.34, 27.675]);
        let tiles: Vec<_> = TileCoord::covering(&extent).collect();
        assert_eq!(
            tiles,
            vec![TileCoord::new(8532, 5534), TileCoord::new(8533, 5534)]
        );

        let point = Rect::new(
            Coord { x: 85.33, y: 27.67 },
            Coord { x: 85.33, y: 27.67 },
        );
        assert_eq!(TileCoord::covering(&point).count(), 1);
    }
}
