//! Runtime configuration of the importer core

use crate::source::LALITPUR_WARD_URL;
use serde::{Deserialize, Serialize};

/// Configuration for the tile cache and the orchestrator
///
/// All distances are great-circle kilometres, all extents WGS84 degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sanity cap on the number of tiles visited by one extent query.
    /// Queries that would visit more tiles return a partial result.
    pub max_tiles_per_query: usize,
    /// Tiles whose centre is farther than this from the viewport centre are evicted
    /// by a cull. The orchestrator also culls only after moving this far.
    pub cull_distance_km: f64,
    /// Address points are shown from this zoom level on
    pub min_zoom: u8,
    /// Name of the host layer that must be visible for the overlay to show
    pub house_numbers_layer: String,
    /// Name of the overlay layer
    pub layer_name: String,
    /// Request timeout for remote providers
    pub http_timeout_secs: u64,
    /// Uniform `[dx, dy]` degree offset applied to display copies of features
    pub render_offset: [f64; 2],
    pub lalitpur: LalitpurConfig,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Default for Config {
    fn default() -> Self {
        Self {
            max_tiles_per_query: 10,
            cull_distance_km: 1.0,
            min_zoom: 19,
            house_numbers_layer: "house_numbers".to_string(),
            layer_name: "Quick HN importer for NP".to_string(),
            http_timeout_secs: 30,
            render_offset: [0.0, 0.0],
            lalitpur: LalitpurConfig::default(),
        }
    }
}

impl Config {
    /// Whether a non-zero render offset is configured
    pub fn has_render_offset(&self) -> bool {
        self.render_offset != [0.0, 0.0]
    }
}

/// Settings of the Lalitpur Metropolitan City provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LalitpurConfig {
    pub enabled: bool,
    /// Ward endpoint, `{ward}` is replaced by the ward number
    pub ward_url: String,
    pub ward_count: u32,
}

impl Default for LalitpurConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ward_url: LALITPUR_WARD_URL.to_string(),
            ward_count: 29,
        }
    }
}
