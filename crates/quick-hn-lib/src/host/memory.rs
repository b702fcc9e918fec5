//! Headless host keeping its whole model in memory

use super::{
    DataModel, EventKind, EventSource, FeatureLayer, HostError, HostEvent, HouseNumberEditor,
    MapView, RenderedFeature, RoadNetwork, Segment, SegmentId, Street, StreetId, Subscription,
};
use crate::feature::FeatureId;
use crate::ingest::geometry_from_geojson;
use geo::{Coord, Geometry, Point, Rect};
use geojson::GeoJson;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;

/// A house number created through [`HouseNumberEditor::add_house_number`]
#[derive(Clone, Debug, PartialEq)]
pub struct AddedHouseNumber {
    pub segment: SegmentId,
    pub number: String,
    pub point: Point<f64>,
}

struct Subscriber {
    id: u64,
    kind: EventKind,
    sender: UnboundedSender<HostEvent>,
}

struct MemoryState {
    streets: Vec<Street>,
    segments: Vec<Segment>,
    house_numbers: Vec<AddedHouseNumber>,
    selection: Vec<SegmentId>,
    extent: Rect<f64>,
    zoom: u8,
    visible_layers: HashSet<String>,
    drawn: Vec<RenderedFeature>,
    redraws: usize,
}

/// Road network, editor, viewport, overlay and event bus in one object
///
/// Methods of the host traits behave like an editor would, including the notifications it
/// sends: adding a house number announces it and selecting a segment announces the new
/// selection. The inherent methods play the user's part.
pub struct MemoryHost {
    state: Mutex<MemoryState>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_subscriber: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                streets: Vec::new(),
                segments: Vec::new(),
                house_numbers: Vec::new(),
                selection: Vec::new(),
                extent: Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 0.0 }),
                zoom: 0,
                visible_layers: HashSet::new(),
                drawn: Vec::new(),
                redraws: 0,
            }),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(0),
        }
    }

    /// Add a street, reusing an existing one of the same name
    pub fn add_street(&self, name: &str) -> StreetId {
        let mut state = lock(&self.state);
        if let Some(street) = state.streets.iter().find(|s| s.name == name) {
            return street.id;
        }
        let id = StreetId(state.streets.len() as i64 + 1);
        state.streets.push(Street {
            id,
            name: name.to_string(),
        });
        id
    }

    pub fn add_segment(&self, segment: Segment) {
        let mut state = lock(&self.state);
        state.segments.retain(|s| s.id != segment.id);
        state.segments.push(segment);
    }

    /// Load road segments from a GeoJSON document of line strings
    ///
    /// `id` is the segment id (defaults to the position in the document), `street` the
    /// primary street name and `alt_streets` an array of alternate names. Features without
    /// a line geometry are ignored. Returns the number of segments loaded.
    pub fn load_roads_geojson(&self, bytes: &[u8]) -> Result<usize, HostError> {
        let document: GeoJson = serde_json::from_slice(bytes)
            .map_err(|e| HostError::InvalidNetwork(e.to_string()))?;
        let GeoJson::FeatureCollection(collection) = document else {
            return Err(HostError::InvalidNetwork(
                "expected a FeatureCollection".to_string(),
            ));
        };

        let mut loaded = 0;
        for (index, feature) in collection.features.iter().enumerate() {
            let Some(geometry) = &feature.geometry else {
                continue;
            };
            let geometry = geometry_from_geojson(&geometry.value)
                .map_err(|e| HostError::InvalidNetwork(e.to_string()))?;
            let Geometry::LineString(line) = geometry else {
                tracing::debug!(index, "Skipping road feature without a line string");
                continue;
            };

            let text = |key: &str| {
                feature
                    .property(key)
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            let id = feature
                .property("id")
                .and_then(|v| v.as_i64())
                .unwrap_or(index as i64 + 1);
            let primary_street_id = text("street").map(|name| self.add_street(&name));
            let alternate_street_ids = feature
                .property("alt_streets")
                .and_then(|v| v.as_array())
                .map(|names| {
                    names
                        .iter()
                        .filter_map(|n| n.as_str())
                        .map(|name| self.add_street(name))
                        .collect()
                })
                .unwrap_or_default();

            self.add_segment(Segment {
                id: SegmentId(id),
                geometry: line,
                primary_street_id,
                alternate_street_ids,
            });
            loaded += 1;
        }
        tracing::info!(segments = loaded, "Loaded road network");
        Ok(loaded)
    }

    /// Set the viewport without notifying
    pub fn set_view(&self, extent: Rect<f64>, zoom: u8) {
        let mut state = lock(&self.state);
        state.extent = extent;
        state.zoom = zoom;
    }

    /// Pan or zoom the map like a user would
    pub fn move_to(&self, extent: Rect<f64>, zoom: u8) {
        self.set_view(extent, zoom);
        self.emit(HostEvent::MapMoveEnd);
    }

    /// Toggle a layer from the layer switcher
    pub fn toggle_layer(&self, layer: &str, visible: bool) {
        self.set_layer_visibility(layer, visible);
        self.emit(HostEvent::LayerVisibilityChanged);
    }

    /// Click a drawn feature
    pub fn click(&self, layer: &str, feature_id: FeatureId) {
        self.emit(HostEvent::FeatureClicked {
            layer: layer.to_string(),
            feature_id,
        });
    }

    /// Replace the selection like a user would
    pub fn select(&self, segments: Vec<SegmentId>) {
        lock(&self.state).selection = segments;
        self.emit(HostEvent::SelectionChanged);
    }

    /// Deliver an event to every matching subscriber, dropping closed channels
    pub fn emit(&self, event: HostEvent) {
        let kind = event.kind();
        lock(&self.subscribers).retain(|subscriber| {
            subscriber.kind != kind || subscriber.sender.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn house_numbers(&self) -> Vec<AddedHouseNumber> {
        lock(&self.state).house_numbers.clone()
    }

    pub fn drawn(&self) -> Vec<RenderedFeature> {
        lock(&self.state).drawn.clone()
    }

    pub fn redraw_count(&self) -> usize {
        lock(&self.state).redraws
    }
}

impl RoadNetwork for MemoryHost {
    fn segments(&self) -> Vec<Segment> {
        lock(&self.state).segments.clone()
    }

    fn streets(&self) -> Vec<Street> {
        lock(&self.state).streets.clone()
    }

    fn segment(&self, id: SegmentId) -> Option<Segment> {
        lock(&self.state)
            .segments
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    fn street(&self, id: StreetId) -> Option<Street> {
        lock(&self.state)
            .streets
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }
}

impl HouseNumberEditor for MemoryHost {
    fn add_house_number(
        &self,
        segment: SegmentId,
        number: &str,
        point: Point<f64>,
    ) -> Result<(), HostError> {
        {
            let mut state = lock(&self.state);
            if !state.segments.iter().any(|s| s.id == segment) {
                return Err(HostError::UnknownSegment(segment));
            }
            state.house_numbers.push(AddedHouseNumber {
                segment,
                number: number.to_string(),
                point,
            });
        }
        self.emit(HostEvent::DataModelObjectsAdded {
            model: DataModel::SegmentHouseNumbers,
            object_ids: vec![format!("{segment}/{number}")],
        });
        Ok(())
    }

    fn select_segment(&self, segment: SegmentId) -> Result<(), HostError> {
        {
            let mut state = lock(&self.state);
            if !state.segments.iter().any(|s| s.id == segment) {
                return Err(HostError::UnknownSegment(segment));
            }
            state.selection = vec![segment];
        }
        self.emit(HostEvent::SelectionChanged);
        Ok(())
    }

    fn selected_segments(&self) -> Vec<SegmentId> {
        lock(&self.state).selection.clone()
    }
}

impl MapView for MemoryHost {
    fn extent(&self) -> Rect<f64> {
        lock(&self.state).extent
    }

    fn center(&self) -> Point<f64> {
        lock(&self.state).extent.center().into()
    }

    fn zoom(&self) -> u8 {
        lock(&self.state).zoom
    }

    fn is_layer_visible(&self, layer: &str) -> bool {
        lock(&self.state).visible_layers.contains(layer)
    }

    fn set_layer_visibility(&self, layer: &str, visible: bool) {
        let mut state = lock(&self.state);
        if visible {
            state.visible_layers.insert(layer.to_string());
        } else {
            state.visible_layers.remove(layer);
        }
    }
}

impl FeatureLayer for MemoryHost {
    fn add_features(&self, features: Vec<RenderedFeature>) {
        lock(&self.state).drawn.extend(features);
    }

    fn remove_feature(&self, id: &FeatureId) {
        lock(&self.state).drawn.retain(|f| &f.feature.id != id);
    }

    fn remove_all(&self) {
        lock(&self.state).drawn.clear();
    }

    fn redraw(&self) {
        lock(&self.state).redraws += 1;
    }
}

impl EventSource for MemoryHost {
    fn subscribe(&self, kind: EventKind, sender: UnboundedSender<HostEvent>) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push(Subscriber { id, kind, sender });

        let subscribers = Arc::downgrade(&self.subscribers);
        Subscription::new(kind, move || {
            if let Some(subscribers) = subscribers.upgrade() {
                lock(&subscribers).retain(|s| s.id != id);
            }
        })
    }
}
