//! Remote address providers
//!
//! A [`SourceAdapter`] turns a geographic rectangle into canonical features. Adapters decide
//! relevance on their own (usually a region-polygon disjoint test) and may fan out into
//! several requests. Failures never cross the adapter boundary into a tile: the repository
//! logs them and carries on with the other adapters.

mod bbox;
mod http;
mod lalitpur;

pub use bbox::{BboxGeoJsonSource, PropertyMapping};
pub use http::HttpClient;
#[cfg(feature = "http")]
pub use http::ReqwestClient;
pub use lalitpur::{LALITPUR_WARD_URL, LalitpurSource, lalitpur_region};

use crate::feature::Feature;
use crate::projection::ProjectionError;
use async_trait::async_trait;
use geo::Rect;
use geojson::GeoJson;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),
}

/// A remote provider of address features
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Features relevant to `extent` (WGS84 degrees)
    async fn fetch(&self, extent: Rect<f64>) -> Result<Vec<Feature>, SourceError>;
}

/// Decode a GeoJSON response body into its features
///
/// A single feature is accepted as a one-element list; a bare geometry yields nothing.
pub(crate) fn decode_features(body: &[u8]) -> Result<Vec<geojson::Feature>, SourceError> {
    let document: GeoJson =
        serde_json::from_slice(body).map_err(|e| SourceError::Decode(e.to_string()))?;
    Ok(match document {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(_) => Vec::new(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Canned HTTP responses for adapter tests

    use super::{HttpClient, SourceError};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockHttpClient {
        responses: HashMap<String, Result<String, u16>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl MockHttpClient {
        pub fn respond(mut self, url: &str, body: &str) -> Self {
            self.responses.insert(url.to_string(), Ok(body.to_string()));
            self
        }

        pub fn fail(mut self, url: &str, status: u16) -> Self {
            self.responses.insert(url.to_string(), Err(status));
            self
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl HttpClient for MockHttpClient {
        async fn get(&self, url: &str) -> Result<Vec<u8>, SourceError> {
            self.requests.lock().unwrap().push(url.to_string());
            match self.responses.get(url) {
                Some(Ok(body)) => Ok(body.clone().into_bytes()),
                Some(Err(status)) => Err(SourceError::Status {
                    status: *status,
                    url: url.to_string(),
                }),
                None => Err(SourceError::Status {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_features() {
        let body = br#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":null,"properties":{"a":1}}]}"#;
        assert_eq!(decode_features(body).unwrap().len(), 1);

        let single = br#"{"type":"Feature","geometry":null,"properties":null}"#;
        assert_eq!(decode_features(single).unwrap().len(), 1);

        assert!(matches!(
            decode_features(b"<html>"),
            Err(SourceError::Decode(_))
        ));
    }
}
