//! Per-feature render style of the overlay layer

use crate::feature::Feature;
use crate::session::StreetIndex;

/// Fill of points whose street is not present in the road network
pub const UNKNOWN_STREET_COLOR: &str = "#bb3333";
/// Fill of points on a currently selected street
pub const SELECTED_STREET_COLOR: &str = "#99ee99";
pub const DEFAULT_COLOR: &str = "#fb9c4f";

const MIN_RADIUS: u32 = 12;

/// How one address point is drawn
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureStyle {
    pub fill_color: &'static str,
    /// Point radius in pixels, grows with the label length
    pub radius: u32,
    /// 0.3 for numbers already present in the host, 1.0 otherwise
    pub opacity: f64,
    /// Whether the point reacts to clicks (pointer cursor)
    pub clickable: bool,
    pub label: String,
    /// Hover text, `street - number`
    pub title: String,
}

/// Style of `feature` given the current street and house-number index
pub fn feature_style(feature: &Feature, index: &StreetIndex) -> FeatureStyle {
    let street = feature.street();
    let number = feature.number();

    let fill_color = if !index.has_street(street) {
        UNKNOWN_STREET_COLOR
    } else if index.is_selected(street) {
        SELECTED_STREET_COLOR
    } else {
        DEFAULT_COLOR
    };

    let present = index.has_number(street, number);
    let radius = (2 + number.chars().count() as u32 * 5).max(MIN_RADIUS);
    let title = if street.is_empty() {
        String::new()
    } else {
        format!("{street} - {number}")
    };

    FeatureStyle {
        fill_color,
        radius,
        opacity: if present { 0.3 } else { 1.0 },
        clickable: !present,
        label: number.to_string(),
        title,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{AddressProperties, FeatureId};
    use crate::host::StreetId;
    use geo::Point;

    fn feature(street: &str, number: &str) -> Feature {
        Feature::new(
            FeatureId::new("f"),
            Point::new(85.3, 27.7),
            AddressProperties {
                street: street.to_string(),
                street_original: street.to_string(),
                number: number.to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_colors() {
        let mut index = StreetIndex::default();
        assert_eq!(
            feature_style(&feature("Jawalakhel Marga", "1"), &index).fill_color,
            UNKNOWN_STREET_COLOR
        );

        index.add_street(StreetId(1), "jawalakhel marga");
        assert_eq!(
            feature_style(&feature("Jawalakhel Marga", "1"), &index).fill_color,
            DEFAULT_COLOR
        );

        index.set_selected(["Jawalakhel Marga"]);
        assert_eq!(
            feature_style(&feature("Jawalakhel Marga", "1"), &index).fill_color,
            SELECTED_STREET_COLOR
        );
    }

    #[test]
    fn test_present_number_is_faded() {
        let mut index = StreetIndex::default();
        index.add_street(StreetId(2), "Kupondole Marga");
        index.add_number("Kupondole Marga", "12/1");

        let style = feature_style(&feature("Kupondole Marga", "12-1"), &index);
        assert_eq!(style.opacity, 0.3);
        assert!(!style.clickable);

        let style = feature_style(&feature("Kupondole Marga", "14"), &index);
        assert_eq!(style.opacity, 1.0);
        assert!(style.clickable);
    }

    #[test]
    fn test_radius_and_title() {
        let index = StreetIndex::default();
        let style = feature_style(&feature("Ring Rd", "7"), &index);
        assert_eq!(style.radius, 12);
        assert_eq!(style.label, "7");
        assert_eq!(style.title, "Ring Rd - 7");

        let style = feature_style(&feature("", "1234"), &index);
        assert_eq!(style.radius, 22);
        assert!(style.title.is_empty());
    }
}
