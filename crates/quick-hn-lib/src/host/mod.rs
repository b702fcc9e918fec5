//! Map host collaborator
//!
//! The importer runs inside a map editing application that owns the road network, the
//! rendering layers and the user interface. These traits are the complete surface the core
//! needs from it; a browser bridge, a desktop editor or a headless test double can provide
//! them.
//!
//! Notifications are delivered through a channel. Registering returns a [`Subscription`]
//! handle, and the orchestrator releases all of its handles at once through
//! [`Subscriptions::dispose_all`].
//!
//! [`MemoryHost`] is a self-contained implementation used by the command line tool and the
//! tests.

mod memory;

pub use memory::{AddedHouseNumber, MemoryHost};

use crate::feature::{Feature, FeatureId};
use crate::style::FeatureStyle;
use geo::{LineString, Point, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Unknown segment {0}")]
    UnknownSegment(SegmentId),

    #[error("Unknown layer {0}")]
    UnknownLayer(String),

    #[error("Edit rejected: {0}")]
    Rejected(String),

    #[error("Invalid road network: {0}")]
    InvalidNetwork(String),
}

/// Identifier of a road segment in the host model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub i64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a street (a named group of segments) in the host model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreetId(pub i64);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Street {
    pub id: StreetId,
    /// Street name, empty for unnamed streets
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    /// Segment geometry in WGS84 degrees
    pub geometry: LineString<f64>,
    pub primary_street_id: Option<StreetId>,
    #[serde(default)]
    pub alternate_street_ids: Vec<StreetId>,
}

impl Segment {
    /// Primary street first, then the alternates
    pub fn street_ids(&self) -> impl Iterator<Item = StreetId> + '_ {
        self.primary_street_id
            .into_iter()
            .chain(self.alternate_street_ids.iter().copied())
    }
}

/// Read access to the host's live road graph
pub trait RoadNetwork: Send + Sync {
    /// All currently loaded segments, in host enumeration order
    fn segments(&self) -> Vec<Segment>;

    /// All currently loaded streets
    fn streets(&self) -> Vec<Street>;

    fn segment(&self, id: SegmentId) -> Option<Segment>;

    fn street(&self, id: StreetId) -> Option<Street>;

    /// Name of a street, `None` for unknown or unnamed streets
    fn street_name(&self, id: StreetId) -> Option<String> {
        self.street(id)
            .map(|street| street.name)
            .filter(|name| !name.is_empty())
    }
}

/// Mutations of the host model
pub trait HouseNumberEditor: Send + Sync {
    fn add_house_number(
        &self,
        segment: SegmentId,
        number: &str,
        point: Point<f64>,
    ) -> Result<(), HostError>;

    /// Make `segment` the current selection
    fn select_segment(&self, segment: SegmentId) -> Result<(), HostError>;

    /// Currently selected segments; empty when the selection is not made of segments
    fn selected_segments(&self) -> Vec<SegmentId>;
}

/// Viewport and layer visibility
pub trait MapView: Send + Sync {
    /// Visible rectangle in WGS84 degrees
    fn extent(&self) -> Rect<f64>;

    fn center(&self) -> Point<f64>;

    fn zoom(&self) -> u8;

    fn is_layer_visible(&self, layer: &str) -> bool;

    fn set_layer_visibility(&self, layer: &str, visible: bool);
}

/// A feature ready to be drawn: a display copy plus its style
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedFeature {
    pub feature: Feature,
    pub style: FeatureStyle,
}

/// The overlay layer the importer draws on
pub trait FeatureLayer: Send + Sync {
    fn add_features(&self, features: Vec<RenderedFeature>);

    fn remove_feature(&self, id: &FeatureId);

    fn remove_all(&self);

    /// Re-evaluate the style of every drawn feature
    fn redraw(&self);
}

/// Host data models whose changes are tracked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataModel {
    SegmentHouseNumbers,
    Streets,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    MapMoveEnd,
    LayerVisibilityChanged,
    FeatureClicked,
    SelectionChanged,
    DataModelObjectsAdded,
    DataModelObjectsRemoved,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::MapMoveEnd,
        EventKind::LayerVisibilityChanged,
        EventKind::FeatureClicked,
        EventKind::SelectionChanged,
        EventKind::DataModelObjectsAdded,
        EventKind::DataModelObjectsRemoved,
    ];
}

/// A notification from the host
#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    MapMoveEnd,
    LayerVisibilityChanged,
    FeatureClicked {
        layer: String,
        feature_id: FeatureId,
    },
    SelectionChanged,
    /// Objects were added to a data model. House numbers are identified as
    /// `segmentId/number`, streets by their numeric id.
    DataModelObjectsAdded {
        model: DataModel,
        object_ids: Vec<String>,
    },
    DataModelObjectsRemoved {
        model: DataModel,
        object_ids: Vec<String>,
    },
}

impl HostEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HostEvent::MapMoveEnd => EventKind::MapMoveEnd,
            HostEvent::LayerVisibilityChanged => EventKind::LayerVisibilityChanged,
            HostEvent::FeatureClicked { .. } => EventKind::FeatureClicked,
            HostEvent::SelectionChanged => EventKind::SelectionChanged,
            HostEvent::DataModelObjectsAdded { .. } => EventKind::DataModelObjectsAdded,
            HostEvent::DataModelObjectsRemoved { .. } => EventKind::DataModelObjectsRemoved,
        }
    }
}

/// Registration point for host notifications
pub trait EventSource: Send + Sync {
    /// Deliver every event of `kind` to `sender` until the returned handle is released
    fn subscribe(&self, kind: EventKind, sender: UnboundedSender<HostEvent>) -> Subscription;
}

/// Every collaborator the orchestrator talks to
#[derive(Clone)]
pub struct HostHandles {
    pub network: Arc<dyn RoadNetwork>,
    pub editor: Arc<dyn HouseNumberEditor>,
    pub map: Arc<dyn MapView>,
    pub layer: Arc<dyn FeatureLayer>,
    pub events: Arc<dyn EventSource>,
}

impl HostHandles {
    /// Handles backed by a single object implementing every collaborator
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: RoadNetwork + HouseNumberEditor + MapView + FeatureLayer + EventSource + 'static,
    {
        Self {
            network: host.clone(),
            editor: host.clone(),
            map: host.clone(),
            layer: host.clone(),
            events: host,
        }
    }
}

/// Handle of one registration; releasing it stops the delivery
pub struct Subscription {
    kind: EventKind,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(kind: EventKind, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            kind,
            release: Some(Box::new(release)),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Every handle a component holds, released together
#[derive(Debug, Default)]
pub struct Subscriptions {
    handles: Vec<Subscription>,
}

impl Subscriptions {
    pub fn add(&mut self, subscription: Subscription) {
        self.handles.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn dispose_all(&mut self) {
        let count = self.handles.len();
        for handle in self.handles.drain(..) {
            handle.release();
        }
        if count > 0 {
            tracing::debug!(count, "Released host subscriptions");
        }
    }
}

/// A house number of the host model, `segmentId/number` on the wire
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HouseNumberRef {
    pub segment: SegmentId,
    pub number: String,
}

impl HouseNumberRef {
    /// Parse a `segmentId/number` object id
    ///
    /// Purely numeric ids are temporary ids of numbers still being created and yield `None`.
    pub fn parse(object_id: &str) -> Option<Self> {
        let (segment, number) = object_id.split_once('/')?;
        let segment = segment.trim().parse().ok()?;
        if number.is_empty() {
            return None;
        }
        Some(Self {
            segment: SegmentId(segment),
            number: number.to_string(),
        })
    }
}
