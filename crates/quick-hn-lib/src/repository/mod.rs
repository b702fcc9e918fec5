//! Spatial tile cache
//!
//! The repository answers "which address features exist in this rectangle" while the user
//! pans around. It keeps:
//!
//! - a sparse grid of tiles, each either loading (a shared future every caller awaits) or
//!   loaded (an immutable feature list),
//! - a directory from feature id to feature for lookups after a click,
//! - the durable datasets (uploaded file and URL dataset), which are held in memory as a
//!   whole and never tile-cached.
//!
//! Every registered [`SourceAdapter`] is queried concurrently for a new tile; an adapter
//! that fails is logged and the tile is installed with what the others returned.

mod tile;

pub use tile::{TILE_HEIGHT_DEG, TILE_WIDTH_DEG, TileCoord};

use crate::config::Config;
use crate::feature::{DedupKey, Feature, FeatureId};
use crate::host::FeatureLayer;
use crate::source::SourceAdapter;
use crate::storage::DatasetKind;
use crate::utils::{self, Extent};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::join_all;
use geo::{Point, Rect};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tile::{TileLoad, TileState};

/// Result of a [`SpatialRepository::cull`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CullReport {
    pub tiles_removed: usize,
    /// Ids dropped from the layer and the directory
    pub features_removed: usize,
    pub tiles_kept: usize,
}

/// Tile cache over all registered sources
pub struct SpatialRepository {
    config: Config,
    sources: Vec<Arc<dyn SourceAdapter>>,
    tiles: DashMap<TileCoord, TileState>,
    directory: DashMap<FeatureId, Feature>,
    durable: DashMap<DatasetKind, Arc<Vec<Feature>>>,
    layer: Option<Arc<dyn FeatureLayer>>,
    generation: AtomicU64,
}

/// Drop every feature whose dedup key was already seen, keeping the first
fn dedup(features: Vec<Feature>) -> Vec<Feature> {
    let mut seen: HashSet<DedupKey> = HashSet::with_capacity(features.len());
    features
        .into_iter()
        .filter(|feature| seen.insert(feature.dedup_key()))
        .collect()
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SpatialRepository {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sources: Vec::new(),
            tiles: DashMap::new(),
            directory: DashMap::new(),
            durable: DashMap::new(),
            layer: None,
            generation: AtomicU64::new(0),
        }
    }

    /// Layer whose features are removed together with evicted tiles
    pub fn with_layer(mut self, layer: Arc<dyn FeatureLayer>) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a source for future tile loads; tiles already cached are not refetched.
    /// Sources registered earlier win deduplication ties.
    pub fn add_source(&mut self, source: Arc<dyn SourceAdapter>) {
        tracing::debug!(source = source.name(), "Registered source");
        self.sources.push(source);
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// All features relevant to `extent`, deduplicated
    ///
    /// Tiles are visited in row-major order and each is awaited before the next one, so at
    /// most one tile is loading per call. At most `max_tiles_per_query` tiles are visited;
    /// larger extents get a partial result.
    pub async fn get_extent_data(&self, extent: Rect<f64>) -> Vec<Feature> {
        #[cfg(feature = "profiling")]
        profiling::scope!("repository::get_extent_data");

        let mut features = Vec::new();
        for (visited, coord) in TileCoord::covering(&extent).enumerate() {
            if visited >= self.config.max_tiles_per_query {
                tracing::warn!(
                    limit = self.config.max_tiles_per_query,
                    "Tile sanity limit reached, returning a partial result"
                );
                break;
            }
            features.extend(self.tile_data(coord).await.iter().cloned());
        }

        let bounds = utils::rect_to_extent(&extent);
        features.extend(self.durable_in(&bounds));

        let total = features.len();
        let features = dedup(features);
        tracing::trace!(total, unique = features.len(), "Extent data collected");
        features
    }

    /// Durable features inside `bounds`, indexed in the directory on the way
    fn durable_in(&self, bounds: &Extent) -> Vec<Feature> {
        let mut found = Vec::new();
        for kind in DatasetKind::ALL {
            let Some(dataset) = self.dataset(kind) else {
                continue;
            };
            for feature in dataset.iter().filter(|f| utils::extent_contains(bounds, &f.point)) {
                self.directory.insert(feature.id.clone(), feature.clone());
                found.push(feature.clone());
            }
        }
        found
    }

    /// Cached data of a tile, joining or starting its load as needed
    async fn tile_data(&self, coord: TileCoord) -> Arc<Vec<Feature>> {
        let (generation, load) = match self.tiles.entry(coord) {
            Entry::Occupied(entry) => match entry.get() {
                TileState::Loaded(features) => return features.clone(),
                TileState::Loading { generation, load } => (*generation, load.clone()),
            },
            Entry::Vacant(entry) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let load = self.start_load(coord);
                entry.insert(TileState::Loading {
                    generation,
                    load: load.clone(),
                });
                (generation, load)
            }
        };

        let features = load.await;
        self.install(coord, generation, &features);
        features
    }

    fn start_load(&self, coord: TileCoord) -> TileLoad {
        let sources = self.sources.clone();
        async move {
            let rect = coord.rect();
            let results = join_all(sources.iter().map(|source| source.fetch(rect))).await;

            let mut features = Vec::new();
            for (source, result) in sources.iter().zip(results) {
                match result {
                    Ok(found) => features.extend(found),
                    Err(error) => tracing::warn!(
                        source = source.name(),
                        x = coord.x,
                        y = coord.y,
                        %error,
                        "Source failed, tile loaded without it"
                    ),
                }
            }
            tracing::debug!(x = coord.x, y = coord.y, features = features.len(), "Tile loaded");
            Arc::new(features)
        }
        .boxed()
        .shared()
    }

    /// Move a tile from loading to loaded, unless it was evicted or reloaded meanwhile
    fn install(&self, coord: TileCoord, generation: u64, features: &Arc<Vec<Feature>>) {
        let installed = match self.tiles.get_mut(&coord) {
            Some(mut state) => {
                let current = matches!(
                    &*state,
                    TileState::Loading { generation: g, .. } if *g == generation
                );
                if current {
                    *state = TileState::Loaded(features.clone());
                }
                current
            }
            None => {
                tracing::debug!(x = coord.x, y = coord.y, "Discarding result of an evicted tile");
                false
            }
        };

        if installed {
            for feature in features.iter() {
                self.directory.insert(feature.id.clone(), feature.clone());
            }
        }
    }

    /// Evict every tile whose centre is farther than `cull_distance_km` from `center`
    ///
    /// Features of evicted tiles leave the layer and the directory unless a kept tile or a
    /// durable dataset still holds the same id. Durable datasets are never touched.
    pub fn cull(&self, center: Point<f64>) -> CullReport {
        let threshold = self.config.cull_distance_km;
        let far: Vec<TileCoord> = self
            .tiles
            .iter()
            .map(|entry| *entry.key())
            .filter(|coord| utils::haversine_km(&coord.center(), &center) > threshold)
            .collect();

        let mut report = CullReport::default();
        let mut evicted: HashSet<FeatureId> = HashSet::new();
        for coord in far {
            let Some((_, state)) = self.tiles.remove(&coord) else {
                continue;
            };
            report.tiles_removed += 1;
            if let Some(features) = state.features() {
                evicted.extend(features.iter().map(|feature| feature.id.clone()));
            }
        }
        report.tiles_kept = self.tiles.len();

        // A feature crossing a tile border is returned for each tile it touches
        if !evicted.is_empty() {
            for entry in self.tiles.iter() {
                if let Some(features) = entry.value().features() {
                    for feature in features.iter() {
                        evicted.remove(&feature.id);
                    }
                }
            }
            for dataset in self.durable.iter() {
                for feature in dataset.value().iter() {
                    evicted.remove(&feature.id);
                }
            }
        }
        for id in &evicted {
            self.forget(id);
        }
        report.features_removed = evicted.len();

        if report.tiles_removed > 0 {
            tracing::debug!(
                removed = report.tiles_removed,
                features = report.features_removed,
                kept = report.tiles_kept,
                "Culled distant tiles"
            );
        }
        report
    }

    fn forget(&self, id: &FeatureId) {
        if let Some(layer) = &self.layer {
            layer.remove_feature(id);
        }
        self.directory.remove(id);
    }

    pub fn get_feature_by_id(&self, id: &FeatureId) -> Option<Feature> {
        self.directory.get(id).map(|entry| entry.value().clone())
    }

    /// Drop the tile grid and the directory; durable datasets are kept
    pub fn clear_all(&self) {
        if let Some(layer) = &self.layer {
            for entry in self.directory.iter() {
                layer.remove_feature(entry.key());
            }
        }
        // Loads still in flight find no tile to install into
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.tiles.clear();
        self.directory.clear();
        tracing::debug!("Cleared tile cache");
    }

    /// Replace a durable dataset
    pub fn set_dataset(&self, kind: DatasetKind, features: Vec<Feature>) {
        tracing::debug!(?kind, count = features.len(), "Durable dataset set");
        if let Some(previous) = self.durable.insert(kind, Arc::new(features)) {
            for feature in previous.iter() {
                self.directory.remove(&feature.id);
            }
        }
    }

    pub fn clear_dataset(&self, kind: DatasetKind) {
        if let Some((_, previous)) = self.durable.remove(&kind) {
            for feature in previous.iter() {
                self.forget(&feature.id);
            }
        }
    }

    pub fn dataset(&self, kind: DatasetKind) -> Option<Arc<Vec<Feature>>> {
        self.durable.get(&kind).map(|entry| entry.value().clone())
    }

    /// Number of tiles, loading or loaded
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_tile_loaded(&self, coord: TileCoord) -> bool {
        self.tiles
            .get(&coord)
            .is_some_and(|state| state.features().is_some())
    }

    pub fn directory_len(&self) -> usize {
        self.directory.len()
    }
}
