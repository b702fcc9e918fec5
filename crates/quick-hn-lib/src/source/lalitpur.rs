//! Lalitpur Metropolitan City building register
//!
//! The city publishes buildings per administrative ward. A tile request outside the city
//! polygon is answered without any network traffic; otherwise every ward is requested
//! concurrently and wards that fail are logged and skipped.

use super::{HttpClient, SourceAdapter, SourceError, decode_features};
use crate::feature::{AddressProperties, AddressType, Feature, FeatureId};
use crate::ingest::{geometry_from_geojson, property_text};
use crate::normalize::normalize;
use crate::utils;
use async_trait::async_trait;
use futures::future::join_all;
use geo::{LineString, Polygon, Rect};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Ward endpoint; `{ward}` is replaced by the ward number
pub const LALITPUR_WARD_URL: &str = "https://geonep.com.np/LMC/ajax/x_building.php?ward_no={ward}";

/// Number of wards of the metropolitan city
pub const LALITPUR_WARD_COUNT: u32 = 29;

const REGION: [(f64, f64); 11] = [
    (85.29377337876386, 27.603309874523035),
    (85.28907174008309, 27.610757759711703),
    (85.28112722544194, 27.644637619503936),
    (85.2911097667452, 27.673688570775262),
    (85.301321831427, 27.692360556657775),
    (85.30740589291473, 27.694362605619077),
    (85.32757155676471, 27.68690327105091),
    (85.34449915180973, 27.672768378131995),
    (85.35597653295329, 27.63372772622652),
    (85.33227244070862, 27.616131609219202),
    (85.29377337876386, 27.603309874523035),
];

/// Outline of the metropolitan city
pub fn lalitpur_region() -> Polygon<f64> {
    Polygon::new(LineString::from(REGION.to_vec()), vec![])
}

/// Adapter for the per-ward building endpoint
///
/// The adapter answers with nothing while `enabled` is false; the flag is shared with the
/// settings so it can be toggled at runtime.
pub struct LalitpurSource<C> {
    client: C,
    enabled: Arc<AtomicBool>,
    region: Polygon<f64>,
    ward_url: String,
    ward_count: u32,
}

impl<C: HttpClient> LalitpurSource<C> {
    pub fn new(client: C, enabled: Arc<AtomicBool>) -> Self {
        Self {
            client,
            enabled,
            region: lalitpur_region(),
            ward_url: LALITPUR_WARD_URL.to_string(),
            ward_count: LALITPUR_WARD_COUNT,
        }
    }

    pub fn with_ward_url(mut self, template: impl Into<String>) -> Self {
        self.ward_url = template.into();
        self
    }

    pub fn with_ward_count(mut self, ward_count: u32) -> Self {
        self.ward_count = ward_count;
        self
    }

    fn url_for(&self, ward: u32) -> String {
        self.ward_url.replace("{ward}", &ward.to_string())
    }

    async fn fetch_ward(&self, ward: u32, extent: &Rect<f64>) -> Result<Vec<Feature>, SourceError> {
        let body = self.client.get(&self.url_for(ward)).await?;
        let features = decode_features(&body)?;
        Ok(features
            .iter()
            .filter_map(|feature| ward_feature(feature, ward, extent))
            .collect())
    }
}

/// Canonical feature for one building, if it has a number, a street and its point lies in
/// `extent`
fn ward_feature(feature: &geojson::Feature, ward: u32, extent: &Rect<f64>) -> Option<Feature> {
    let properties = feature.properties.as_ref()?;
    let number = property_text(properties, "metric_num")?;
    let street_original = property_text(properties, "rd_naeng")?;
    let gid = property_text(properties, "gid")?;

    let geometry = geometry_from_geojson(&feature.geometry.as_ref()?.value).ok()?;
    // Buildings crossing a tile border belong to the tile holding their point
    let point = utils::representative_point(&geometry)?;
    if !utils::rect_owns(extent, &point) {
        return None;
    }

    let municipality =
        property_text(properties, "tole_ne_en").unwrap_or_else(|| format!("Ward {ward}"));
    Feature::new(
        FeatureId::new(format!("np-{gid}")),
        point,
        AddressProperties {
            street: normalize(&street_original),
            street_original,
            number,
            municipality,
            kind: AddressType::Active,
            nepali_text: None,
        },
    )
    .ok()
}

#[async_trait]
impl<C: HttpClient + 'static> SourceAdapter for LalitpurSource<C> {
    fn name(&self) -> &str {
        "lalitpur"
    }

    async fn fetch(&self, extent: Rect<f64>) -> Result<Vec<Feature>, SourceError> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(Vec::new());
        }
        if utils::region_disjoint(&self.region, &extent) {
            return Ok(Vec::new());
        }

        let results = join_all((1..=self.ward_count).map(|ward| self.fetch_ward(ward, &extent))).await;

        let mut features = Vec::new();
        for (ward, result) in (1..=self.ward_count).zip(results) {
            match result {
                Ok(ward_features) => features.extend(ward_features),
                Err(error) => tracing::warn!(ward, %error, "Ward request failed"),
            }
        }
        tracing::debug!(
            features = features.len(),
            wards = self.ward_count,
            "Lalitpur features loaded"
        );
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::MockHttpClient;

    const WARD_1: &str = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","geometry":{"type":"Polygon","coordinates":[[
            [85.3200,27.6700],[85.3202,27.6700],[85.3202,27.6702],[85.3200,27.6702],[85.3200,27.6700]]]},
         "properties":{"gid":101,"metric_num":"12","rd_naeng":"Mangal  Marg","tole_ne_en":"Mangal Bazar"}},
        {"type":"Feature","geometry":{"type":"Point","coordinates":[85.3205,27.6705]},
         "properties":{"gid":102,"metric_num":"14","rd_naeng":"","tole_ne_en":"Mangal Bazar"}},
        {"type":"Feature","geometry":{"type":"Point","coordinates":[85.3500,27.6400]},
         "properties":{"gid":103,"metric_num":"3","rd_naeng":"Far Road"}}
    ]}"#;

    const WARD_2: &str = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","geometry":{"type":"Point","coordinates":[85.3208,27.6708]},
         "properties":{"gid":"201","metric_num":7,"rd_naeng":"Ring Road"}}
    ]}"#;

    fn tile() -> Rect<f64> {
        utils::extent_to_rect(&[85.32, 27.67, 85.33, 27.675])
    }

    fn source(client: Arc<MockHttpClient>, enabled: bool) -> LalitpurSource<Arc<MockHttpClient>> {
        LalitpurSource::new(client, Arc::new(AtomicBool::new(enabled)))
            .with_ward_url("mock://ward/{ward}")
            .with_ward_count(3)
    }

    #[tokio::test]
    async fn test_fetch_filters_and_isolates_wards() {
        let client = Arc::new(
            MockHttpClient::default()
                .respond("mock://ward/1", WARD_1)
                .respond("mock://ward/2", WARD_2)
                .fail("mock://ward/3", 500),
        );
        let features = source(client.clone(), true).fetch(tile()).await.unwrap();

        assert_eq!(client.request_count(), 3);
        assert_eq!(features.len(), 2);

        assert_eq!(features[0].id.as_str(), "np-101");
        assert_eq!(features[0].street(), "Mangal Marga");
        assert_eq!(features[0].properties.street_original, "Mangal  Marg");
        assert_eq!(features[0].properties.municipality, "Mangal Bazar");
        assert!((features[0].lon() - 85.3201).abs() < 1e-9);

        assert_eq!(features[1].id.as_str(), "np-201");
        assert_eq!(features[1].number(), "7");
        assert_eq!(features[1].properties.municipality, "Ward 2");
        assert_eq!(features[1].street(), "Ring Rd");
    }

    #[tokio::test]
    async fn test_border_building_lands_in_one_tile() {
        // Mostly west of the 85.33 grid line
        const WARD: &str = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":{"type":"Polygon","coordinates":[[
                [85.3296,27.6710],[85.3302,27.6710],[85.3302,27.6714],[85.3296,27.6714],[85.3296,27.6710]]]},
             "properties":{"gid":555,"metric_num":"5","rd_naeng":"Pulchowk Road"}}
        ]}"#;
        let client = Arc::new(MockHttpClient::default().respond("mock://ward/1", WARD));
        let lalitpur = source(client, true).with_ward_count(1);

        let west = lalitpur.fetch(tile()).await.unwrap();
        let east = lalitpur
            .fetch(utils::extent_to_rect(&[85.33, 27.67, 85.34, 27.675]))
            .await
            .unwrap();
        assert_eq!(west.len(), 1);
        assert_eq!(west[0].id.as_str(), "np-555");
        assert!(east.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_source_is_silent() {
        let client = Arc::new(MockHttpClient::default());
        let features = source(client.clone(), false).fetch(tile()).await.unwrap();
        assert!(features.is_empty());
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_outside_region_skips_requests() {
        let client = Arc::new(MockHttpClient::default());
        let kathmandu_north = utils::extent_to_rect(&[85.33, 27.75, 85.34, 27.755]);
        let features = source(client.clone(), true)
            .fetch(kathmandu_north)
            .await
            .unwrap();
        assert!(features.is_empty());
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn test_region_is_closed() {
        let region = lalitpur_region();
        assert!(region.exterior().is_closed());
        assert_eq!(region.exterior().0.len(), 11);
    }
}
