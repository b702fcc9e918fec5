//! Nearest-segment resolution
//!
//! A house number is attached to the road segment it belongs to. The matcher first looks
//! for segments carrying the feature's street name (primary or alternate) and takes the
//! closest; only if no segment carries that name does it fall back to the closest segment
//! of any name. The fallback asks the user unless an earlier answer for the same pair of
//! names is still remembered.
//!
//! Distance ties are won by the segment the host enumerates first.

use crate::feature::Feature;
use crate::host::{RoadNetwork, Segment, SegmentId, StreetId};
use crate::normalize::matching_key;
use crate::utils::point_to_line_distance_km;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

/// A candidate segment for a feature
#[derive(Clone, Debug, PartialEq)]
pub struct MatchResult {
    pub segment: Segment,
    pub distance_km: f64,
    /// Whether the segment carries the feature's street name
    pub exact: bool,
}

/// Question put to the user when the street name was not found
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmationRequest {
    /// Street name of the imported feature
    pub feature_street: String,
    /// Name of the street the nearest segment belongs to
    pub segment_street: String,
    pub segment: SegmentId,
    pub number: String,
}

/// Answer to a [`ConfirmationRequest`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// Attach anyway; the same pair of names is auto-confirmed for `remember_for`.
    /// A zero duration remembers nothing.
    Accept { remember_for: Duration },
    Cancel,
}

impl Confirmation {
    pub fn accept() -> Self {
        Confirmation::Accept {
            remember_for: Duration::zero(),
        }
    }

    pub fn accept_for_minutes(minutes: i64) -> Self {
        Confirmation::Accept {
            remember_for: Duration::minutes(minutes),
        }
    }
}

/// Interactive confirmation collaborator
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest) -> Confirmation;
}

/// Terminal states of one resolution
#[derive(Clone, Debug, PartialEq)]
pub enum MatchOutcome {
    /// A segment carries the feature's street name
    AttachedExact(MatchResult),
    /// The feature has no street name; the nearest segment is used without asking
    AttachedNumberOnly(MatchResult),
    AttachedFallbackConfirmed(MatchResult),
    /// The nearest segment was accepted through a remembered decision
    AttachedFallbackCached(MatchResult),
    /// There are no segments with a geometry at all
    RejectedNoSegment,
    /// The nearest segment has no street name and must be named first
    RejectedNoName(SegmentId),
    CancelledByUser,
}

impl MatchOutcome {
    /// The segment to attach to, if the outcome is an attachment
    pub fn attachment(&self) -> Option<&MatchResult> {
        match self {
            MatchOutcome::AttachedExact(result)
            | MatchOutcome::AttachedNumberOnly(result)
            | MatchOutcome::AttachedFallbackConfirmed(result)
            | MatchOutcome::AttachedFallbackCached(result) => Some(result),
            MatchOutcome::RejectedNoSegment
            | MatchOutcome::RejectedNoName(_)
            | MatchOutcome::CancelledByUser => None,
        }
    }

    /// Message for outcomes that need the user's attention
    pub fn user_message(&self, feature: &Feature) -> Option<String> {
        match self {
            MatchOutcome::RejectedNoSegment => Some(format!(
                "No road segment found near house number {}",
                feature.number()
            )),
            MatchOutcome::RejectedNoName(segment) => Some(format!(
                "The nearest segment {segment} has no street name. Name it before adding {}",
                feature.number()
            )),
            _ => None,
        }
    }
}

/// Remembered fallback decisions, keyed by the case-folded pair of street names
#[derive(Debug, Default)]
pub struct DecisionCache {
    entries: DashMap<(String, String), DateTime<Utc>>,
}

impl DecisionCache {
    fn key(feature_street: &str, segment_street: &str) -> (String, String) {
        (matching_key(feature_street), matching_key(segment_street))
    }

    /// Remember an accepted pair until `now + duration`; zero or negative durations are ignored
    pub fn remember(
        &self,
        feature_street: &str,
        segment_street: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) {
        if duration <= Duration::zero() {
            return;
        }
        self.entries
            .insert(Self::key(feature_street, segment_street), now + duration);
    }

    /// Whether a decision for the pair is remembered and not yet expired
    pub fn is_remembered(&self, feature_street: &str, segment_street: &str, now: DateTime<Utc>) -> bool {
        let key = Self::key(feature_street, segment_street);
        let expired = match self.entries.get(&key) {
            Some(expiry) if *expiry > now => return true,
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&key);
        }
        false
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Two-stage segment matcher with a decision cache
#[derive(Debug, Default)]
pub struct SegmentMatcher {
    decisions: DecisionCache,
}

/// The closest of `segments`, first one winning ties
fn nearest<'a>(feature: &Feature, segments: impl Iterator<Item = &'a Segment>) -> Option<(&'a Segment, f64)> {
    let mut best: Option<(&Segment, f64)> = None;
    for segment in segments {
        let distance = point_to_line_distance_km(&feature.point, &segment.geometry);
        if !distance.is_finite() {
            continue;
        }
        if best.is_none_or(|(_, current)| distance < current) {
            best = Some((segment, distance));
        }
    }
    best
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SegmentMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> &DecisionCache {
        &self.decisions
    }

    /// Closest segment whose primary or alternate street carries the feature's street name
    pub fn find_exact(&self, feature: &Feature, network: &dyn RoadNetwork) -> Option<MatchResult> {
        if !feature.has_street() {
            return None;
        }
        let wanted = matching_key(feature.street());
        let street_ids: HashSet<StreetId> = network
            .streets()
            .into_iter()
            .filter(|street| !street.name.is_empty() && matching_key(&street.name) == wanted)
            .map(|street| street.id)
            .collect();
        if street_ids.is_empty() {
            return None;
        }

        let segments = network.segments();
        let candidates = segments
            .iter()
            .filter(|segment| segment.street_ids().any(|id| street_ids.contains(&id)));
        nearest(feature, candidates).map(|(segment, distance_km)| MatchResult {
            segment: segment.clone(),
            distance_km,
            exact: true,
        })
    }

    /// Closest segment of any name
    pub fn find_nearest(&self, feature: &Feature, network: &dyn RoadNetwork) -> Option<MatchResult> {
        let segments = network.segments();
        nearest(feature, segments.iter()).map(|(segment, distance_km)| MatchResult {
            segment: segment.clone(),
            distance_km,
            exact: false,
        })
    }

    /// Exact stage, then nearest-any stage, without any confirmation
    pub fn find(&self, feature: &Feature, network: &dyn RoadNetwork) -> Option<MatchResult> {
        self.find_exact(feature, network)
            .or_else(|| self.find_nearest(feature, network))
    }

    /// Decide where `feature` should be attached, asking `confirmer` when needed
    pub async fn resolve(
        &self,
        feature: &Feature,
        network: &dyn RoadNetwork,
        confirmer: &dyn Confirmer,
        now: DateTime<Utc>,
    ) -> MatchOutcome {
        #[cfg(feature = "profiling")]
        profiling::scope!("matcher::resolve");

        if let Some(result) = self.find_exact(feature, network) {
            return MatchOutcome::AttachedExact(result);
        }

        let Some(result) = self.find_nearest(feature, network) else {
            tracing::debug!(feature = %feature.id, "No segment with geometry available");
            return MatchOutcome::RejectedNoSegment;
        };

        if !feature.has_street() {
            return MatchOutcome::AttachedNumberOnly(result);
        }

        let Some(segment_street) = result
            .segment
            .street_ids()
            .find_map(|id| network.street_name(id))
        else {
            tracing::info!(
                feature = %feature.id,
                segment = %result.segment.id,
                "Nearest segment has no street name"
            );
            return MatchOutcome::RejectedNoName(result.segment.id);
        };

        if self
            .decisions
            .is_remembered(feature.street(), &segment_street, now)
        {
            return MatchOutcome::AttachedFallbackCached(result);
        }

        let request = ConfirmationRequest {
            feature_street: feature.street().to_string(),
            segment_street,
            segment: result.segment.id,
            number: feature.number().to_string(),
        };
        match confirmer.confirm(&request).await {
            Confirmation::Accept { remember_for } => {
                self.decisions.remember(
                    &request.feature_street,
                    &request.segment_street,
                    remember_for,
                    now,
                );
                MatchOutcome::AttachedFallbackConfirmed(result)
            }
            Confirmation::Cancel => MatchOutcome::CancelledByUser,
        }
    }
}
