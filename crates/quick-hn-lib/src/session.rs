//! Orchestrator
//!
//! A [`Session`] owns one repository, one matcher and the durable datasets, and wires them
//! to the host: viewport changes re-query and cull the cache, clicks on the overlay resolve
//! and attach house numbers, data-model notifications keep the [`StreetIndex`] current.

use crate::config::Config;
use crate::feature::{Feature, FeatureId};
use crate::host::{
    DataModel, EventKind, HostEvent, HostHandles, HouseNumberRef, RenderedFeature, Street,
    StreetId, Subscriptions,
};
use crate::ingest::{AttributeSelector, FileFormat, ImportResult, IngestionPipeline};
use crate::matcher::{Confirmer, MatchOutcome, MatchResult, SegmentMatcher};
use crate::normalize::{matching_key, simplify_number};
use crate::repository::SpatialRepository;
use crate::source::{HttpClient, LalitpurSource, SourceAdapter};
use crate::storage::{DatasetKind, DatasetStore, URL_SOURCE_SETTING_KEY};
use crate::style::feature_style;
use crate::utils;
use geo::Point;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::sync::{Mutex, RwLock};

/// Street names and house numbers currently present in the host
///
/// All names are compared through [`matching_key`] and numbers through
/// [`simplify_number`], so `Kupondole Marg 12/1` and `kupondole marga 12-1` are the same
/// entry.
#[derive(Clone, Debug, Default)]
pub struct StreetIndex {
    streets: HashMap<StreetId, String>,
    /// How many streets carry each name
    names: HashMap<String, usize>,
    numbers: HashSet<(String, String)>,
    selected: HashSet<String>,
}

impl StreetIndex {
    /// Replace the known streets; house numbers and selection are kept
    pub fn rebuild_streets(&mut self, streets: impl IntoIterator<Item = Street>) {
        self.streets.clear();
        self.names.clear();
        for street in streets {
            self.add_street(street.id, &street.name);
        }
    }

    pub fn add_street(&mut self, id: StreetId, name: &str) {
        let key = matching_key(name);
        if key.is_empty() {
            return;
        }
        if let Some(previous) = self.streets.insert(id, key.clone()) {
            self.release_name(&previous);
        }
        *self.names.entry(key).or_insert(0) += 1;
    }

    pub fn remove_street(&mut self, id: StreetId) {
        if let Some(key) = self.streets.remove(&id) {
            self.release_name(&key);
        }
    }

    fn release_name(&mut self, key: &str) {
        if let Some(count) = self.names.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.names.remove(key);
            }
        }
    }

    pub fn has_street(&self, name: &str) -> bool {
        self.names.contains_key(&matching_key(name))
    }

    pub fn street_count(&self) -> usize {
        self.names.len()
    }

    fn number_key(street: &str, number: &str) -> (String, String) {
        (matching_key(street), simplify_number(number))
    }

    pub fn add_number(&mut self, street: &str, number: &str) {
        self.numbers.insert(Self::number_key(street, number));
    }

    pub fn remove_number(&mut self, street: &str, number: &str) {
        self.numbers.remove(&Self::number_key(street, number));
    }

    /// Whether the host already has this number on a street of this name
    pub fn has_number(&self, street: &str, number: &str) -> bool {
        self.numbers.contains(&Self::number_key(street, number))
    }

    pub fn number_count(&self) -> usize {
        self.numbers.len()
    }

    pub fn set_selected<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.selected = names
            .into_iter()
            .map(|name| matching_key(name.as_ref()))
            .filter(|key| !key.is_empty())
            .collect();
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.selected.contains(&matching_key(name))
    }

    pub fn has_selection(&self) -> bool {
        !self.selected.is_empty()
    }
}

/// File name used for format detection of a URL dataset
fn url_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    if FileFormat::from_path(name).is_ok() {
        name.to_string()
    } else if name.is_empty() {
        "url.geojson".to_string()
    } else {
        format!("{name}.geojson")
    }
}

/// One importer session inside a host
pub struct Session {
    config: Config,
    host: HostHandles,
    repository: SpatialRepository,
    matcher: SegmentMatcher,
    pipeline: IngestionPipeline,
    store: DatasetStore,
    confirmer: Arc<dyn Confirmer>,
    index: RwLock<StreetIndex>,
    subscriptions: Mutex<Subscriptions>,
    previous_center: Mutex<Option<Point<f64>>>,
    autofill: Mutex<Vec<Feature>>,
    url_source_enabled: Arc<AtomicBool>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Session {
    pub fn new(
        config: Config,
        host: HostHandles,
        store: DatasetStore,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        let enabled = store.flag(URL_SOURCE_SETTING_KEY, config.lalitpur.enabled);
        let repository = SpatialRepository::new(config.clone()).with_layer(host.layer.clone());
        Self {
            config,
            host,
            repository,
            matcher: SegmentMatcher::new(),
            pipeline: IngestionPipeline::new(),
            store,
            confirmer,
            index: RwLock::new(StreetIndex::default()),
            subscriptions: Mutex::new(Subscriptions::default()),
            previous_center: Mutex::new(None),
            autofill: Mutex::new(Vec::new()),
            url_source_enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn add_source(&mut self, source: Arc<dyn SourceAdapter>) {
        self.repository.add_source(source);
    }

    /// Register the Lalitpur provider, switched by the persisted URL-source setting
    pub fn add_lalitpur_source<C: HttpClient + 'static>(&mut self, client: C) {
        let source = LalitpurSource::new(client, self.url_source_enabled.clone())
            .with_ward_url(self.config.lalitpur.ward_url.clone())
            .with_ward_count(self.config.lalitpur.ward_count);
        self.add_source(Arc::new(source));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &SpatialRepository {
        &self.repository
    }

    pub fn matcher(&self) -> &SegmentMatcher {
        &self.matcher
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    pub async fn street_index(&self) -> StreetIndex {
        self.index.read().await.clone()
    }

    pub fn url_source_enabled(&self) -> bool {
        self.url_source_enabled.load(Ordering::Relaxed)
    }

    /// Persist the URL-source toggle; cached tiles are dropped so it takes effect
    pub fn set_url_source_enabled(&self, enabled: bool) {
        self.url_source_enabled.store(enabled, Ordering::Relaxed);
        self.store.set_flag(URL_SOURCE_SETTING_KEY, enabled);
        self.repository.clear_all();
        tracing::info!(enabled, "URL data source setting updated");
    }

    /// Initialize (or re-initialize) against the host and subscribe to its notifications
    ///
    /// Returns the receiver to pass to [`Session::run`].
    pub async fn start(&self) -> UnboundedReceiver<HostEvent> {
        self.dispose().await;

        self.index
            .write()
            .await
            .rebuild_streets(self.host.network.streets());
        self.restore_datasets();

        let map = &self.host.map;
        map.set_layer_visibility(&self.config.layer_name, false);
        *self.previous_center.lock().await = Some(map.center());

        let (sender, receiver) = unbounded_channel();
        {
            let mut subscriptions = self.subscriptions.lock().await;
            for kind in EventKind::ALL {
                subscriptions.add(self.host.events.subscribe(kind, sender.clone()));
            }
        }
        tracing::info!(sources = self.repository.source_count(), "Session started");

        self.update_layer().await;
        receiver
    }

    /// Handle events until every sender is gone
    pub async fn run(&self, mut events: UnboundedReceiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(error) = self.handle_event(event).await {
                tracing::warn!(%error, "Event handling failed");
            }
        }
        tracing::debug!("Event stream closed");
    }

    pub async fn handle_event(&self, event: HostEvent) -> crate::Result<()> {
        tracing::trace!(kind = ?event.kind(), "Host event");
        match event {
            HostEvent::MapMoveEnd => self.on_map_move_end().await,
            HostEvent::LayerVisibilityChanged => {
                self.update_layer().await;
            }
            HostEvent::FeatureClicked { layer, feature_id } => {
                if layer == self.config.layer_name {
                    self.click_feature(&feature_id).await?;
                }
            }
            HostEvent::SelectionChanged => self.on_selection_changed().await,
            HostEvent::DataModelObjectsAdded { model, object_ids } => {
                self.on_data_model_change(model, &object_ids, true).await
            }
            HostEvent::DataModelObjectsRemoved { model, object_ids } => {
                self.on_data_model_change(model, &object_ids, false).await
            }
        }
        Ok(())
    }

    /// Redraw the overlay for the current viewport
    ///
    /// The overlay is only shown from `min_zoom` on and while the host's house-number layer
    /// is visible. Returns the features drawn.
    pub async fn update_layer(&self) -> Vec<Feature> {
        let map = &self.host.map;
        let zoom = map.zoom();
        let house_numbers_visible = map.is_layer_visible(&self.config.house_numbers_layer);
        tracing::debug!(zoom, house_numbers_visible, "Updating layer");

        if !house_numbers_visible || zoom < self.config.min_zoom {
            map.set_layer_visibility(&self.config.layer_name, false);
            self.autofill.lock().await.clear();
            return Vec::new();
        }
        if !map.is_layer_visible(&self.config.layer_name) {
            map.set_layer_visibility(&self.config.layer_name, true);
        }

        let extent = map.extent();
        let features = self.repository.get_extent_data(extent).await;

        let index = self.index.read().await;
        self.host.layer.remove_all();
        if !features.is_empty() {
            self.host.layer.add_features(self.render(&features, &index));
        }

        let candidates: Vec<Feature> = if index.has_selection() {
            let bounds = utils::rect_to_extent(&extent);
            features
                .iter()
                .filter(|f| index.is_selected(f.street()))
                .filter(|f| !index.has_number(f.street(), f.number()))
                .filter(|f| utils::extent_contains(&bounds, &f.point))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        drop(index);

        if !candidates.is_empty() {
            tracing::info!(
                count = candidates.len(),
                "Missing house numbers visible on the selected streets, autofill available"
            );
        }
        *self.autofill.lock().await = candidates;
        features
    }

    /// Display copies with their styles
    fn render(&self, features: &[Feature], index: &StreetIndex) -> Vec<RenderedFeature> {
        let [dx, dy] = self.config.render_offset;
        features
            .iter()
            .map(|feature| RenderedFeature {
                feature: if self.config.has_render_offset() {
                    feature.with_offset(dx, dy)
                } else {
                    feature.clone()
                },
                style: feature_style(feature, index),
            })
            .collect()
    }

    async fn on_map_move_end(&self) {
        self.update_layer().await;

        let current = self.host.map.center();
        let mut previous = self.previous_center.lock().await;
        let moved_far = (*previous).is_none_or(|last| {
            utils::haversine_km(&last, &current) > self.config.cull_distance_km
        });
        if moved_far {
            *previous = Some(current);
            self.repository.cull(current);
        }
    }

    /// Resolve a clicked feature and attach its number
    ///
    /// Returns `None` when the feature is unknown or its number is already present.
    pub async fn click_feature(&self, id: &FeatureId) -> crate::Result<Option<MatchOutcome>> {
        let Some(feature) = self.repository.get_feature_by_id(id) else {
            tracing::debug!(feature = %id, "Clicked feature is not cached");
            return Ok(None);
        };
        if self
            .index
            .read()
            .await
            .has_number(feature.street(), feature.number())
        {
            return Ok(None);
        }

        let outcome = self
            .matcher
            .resolve(
                &feature,
                self.host.network.as_ref(),
                self.confirmer.as_ref(),
                chrono::Utc::now(),
            )
            .await;

        match outcome.attachment() {
            Some(result) => {
                self.attach(&feature, result, true).await?;
                self.host.layer.redraw();
            }
            None => {
                if let Some(message) = outcome.user_message(&feature) {
                    tracing::warn!(feature = %feature.id, "{message}");
                }
            }
        }
        Ok(Some(outcome))
    }

    async fn attach(&self, feature: &Feature, result: &MatchResult, select: bool) -> crate::Result<()> {
        let editor = &self.host.editor;
        let segment = result.segment.id;
        if select {
            editor.select_segment(segment)?;
        }
        editor.add_house_number(segment, feature.number(), feature.point)?;

        let wanted = matching_key(feature.street());
        let name_exists = feature.has_street()
            && self
                .host
                .network
                .streets()
                .iter()
                .any(|street| matching_key(&street.name) == wanted);
        if name_exists {
            self.index
                .write()
                .await
                .add_number(feature.street(), feature.number());
        }

        tracing::info!(
            feature = %feature.id,
            number = feature.number(),
            %segment,
            exact = result.exact,
            "House number added"
        );
        Ok(())
    }

    /// Features offered by the last layer update for autofill
    pub async fn autofill_candidates(&self) -> Vec<Feature> {
        self.autofill.lock().await.clone()
    }

    /// Attach every visible missing number on the selected streets without asking
    pub async fn autofill(&self) -> crate::Result<usize> {
        let candidates = std::mem::take(&mut *self.autofill.lock().await);
        let mut added = 0;
        for feature in &candidates {
            let Some(result) = self.matcher.find(feature, self.host.network.as_ref()) else {
                continue;
            };
            self.attach(feature, &result, false).await?;
            added += 1;
        }
        self.host.layer.redraw();
        Ok(added)
    }

    async fn on_selection_changed(&self) {
        let network = &self.host.network;
        let names: Vec<String> = self
            .host
            .editor
            .selected_segments()
            .into_iter()
            .filter_map(|id| network.segment(id))
            .flat_map(|segment| segment.street_ids().collect::<Vec<_>>())
            .filter_map(|id| network.street_name(id))
            .collect();
        self.index.write().await.set_selected(names);
        self.update_layer().await;
    }

    async fn on_data_model_change(&self, model: DataModel, object_ids: &[String], added: bool) {
        let network = &self.host.network;
        {
            let mut index = self.index.write().await;
            match model {
                DataModel::SegmentHouseNumbers => {
                    for object_id in object_ids {
                        let Some(house_number) = HouseNumberRef::parse(object_id) else {
                            continue;
                        };
                        let Some(segment) = network.segment(house_number.segment) else {
                            tracing::debug!(
                                object_id,
                                "House number could not be matched to a segment"
                            );
                            continue;
                        };
                        for name in segment.street_ids().filter_map(|id| network.street_name(id)) {
                            if added {
                                index.add_number(&name, &house_number.number);
                            } else {
                                index.remove_number(&name, &house_number.number);
                            }
                        }
                    }
                }
                DataModel::Streets => {
                    for id in object_ids
                        .iter()
                        .filter_map(|id| id.parse::<i64>().ok())
                        .map(StreetId)
                    {
                        if !added {
                            index.remove_street(id);
                        } else if let Some(street) = network.street(id) {
                            index.add_street(street.id, &street.name);
                        }
                    }
                }
            }
        }
        self.host.layer.redraw();
    }

    /// Load the durable datasets from the store into the repository
    pub fn restore_datasets(&self) -> usize {
        let mut restored = 0;
        for kind in DatasetKind::ALL {
            if let Some(dataset) = self.store.load(kind) {
                tracing::info!(
                    ?kind,
                    count = dataset.count,
                    source = %dataset.filename,
                    "Restored features from previous session"
                );
                restored += dataset.features.len();
                self.repository.set_dataset(kind, dataset.features);
            }
        }
        restored
    }

    /// Import an uploaded file as the durable uploaded dataset
    pub async fn import_file(
        &self,
        bytes: &[u8],
        file_name: &str,
        selector: &dyn AttributeSelector,
    ) -> crate::Result<ImportResult> {
        let result = self.pipeline.import(bytes, file_name, selector).await?;
        self.install_dataset(DatasetKind::Uploaded, &result, file_name).await;
        Ok(result)
    }

    /// Fetch a remote file and import it as the durable URL dataset
    pub async fn import_url<C: HttpClient>(
        &self,
        client: &C,
        url: &str,
        selector: &dyn AttributeSelector,
    ) -> crate::Result<ImportResult> {
        let bytes = client.get(url).await?;
        let file_name = url_file_name(url);
        let result = self.pipeline.import(&bytes, &file_name, selector).await?;
        self.install_dataset(DatasetKind::Url, &result, url).await;
        Ok(result)
    }

    async fn install_dataset(&self, kind: DatasetKind, result: &ImportResult, origin: &str) {
        self.repository.set_dataset(kind, result.features.clone());
        self.store.save(kind, &result.features, origin);
        self.update_layer().await;
    }

    pub async fn clear_uploaded_data(&self) {
        self.clear_dataset(DatasetKind::Uploaded).await;
    }

    pub async fn clear_url_data(&self) {
        self.clear_dataset(DatasetKind::Url).await;
    }

    async fn clear_dataset(&self, kind: DatasetKind) {
        self.repository.clear_dataset(kind);
        self.store.clear(kind);
        tracing::info!(?kind, "Cleared dataset");
        self.update_layer().await;
    }

    /// Release every subscription and drop the tile cache
    pub async fn dispose(&self) {
        self.subscriptions.lock().await.dispose_all();
        self.repository.clear_all();
        self.autofill.lock().await.clear();
    }
}
