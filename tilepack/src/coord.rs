//! Geographic extent handling for tile requests.
//!
//! Display pyramids can hand us tile bounds that sit fractionally outside
//! ±180° longitude, or that wrap across the antimeridian entirely. The
//! package format only accepts longitudes in [-180, 180], so extents are
//! normalized here before any bounding box is built from them.

use serde::{Deserialize, Serialize};

/// Left longitude boundary used when normalizing a tile extent, with slack
/// for display engines that produce bounds fractionally past -180.
pub const TILE_LEFT_BOUNDARY: f64 = -180.0 - 1e-12;

/// Right longitude boundary used when normalizing a tile extent, with slack
/// for display engines that produce bounds fractionally past +180.
pub const TILE_RIGHT_BOUNDARY: f64 = 180.0 + 1e-12;

/// A geographic extent in `[west, south, east, north]` order (EPSG:4326).
pub type Extent = [f64; 4];

/// Normalizes the longitude span of a tile extent in place.
///
/// Steps, in order:
/// 1. Reorder so west ≤ east.
/// 2. A span of 360° or more collapses to exactly [-180, 180].
/// 3. A west bound past the tolerant left boundary shifts both bounds right
///    by 360° until it is within tolerance.
/// 4. An east bound past the tolerant right boundary shifts both bounds left
///    by 360° until it is within tolerance.
///
/// Latitude values (indices 1 and 3) are left untouched.
pub fn normalize_extent(extent: &mut Extent) {
    let mut left = extent[0].min(extent[2]);
    let mut right = extent[0].max(extent[2]);

    if right - left >= 360.0 {
        // Whole world, just use +/- 180.
        left = -180.0;
        right = 180.0;
    } else if left < TILE_LEFT_BOUNDARY {
        // Wrapped left, shift right into +/- 180.
        while left < TILE_LEFT_BOUNDARY {
            left += 360.0;
            right += 360.0;
        }
    } else if right > TILE_RIGHT_BOUNDARY {
        // Wrapped right, shift left into +/- 180.
        while right > TILE_RIGHT_BOUNDARY {
            left -= 360.0;
            right -= 360.0;
        }
    }

    extent[0] = left;
    extent[2] = right;
}

/// Geographic bounding box handed to the package's tile matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Minimum longitude (west).
    pub min_lon: f64,
    /// Maximum longitude (east).
    pub max_lon: f64,
    /// Minimum latitude (south).
    pub min_lat: f64,
    /// Maximum latitude (north).
    pub max_lat: f64,
}

impl BoundingBox {
    /// Builds a bounding box from a normalized `[west, south, east, north]`
    /// extent.
    pub fn from_extent(extent: &Extent) -> Self {
        Self {
            min_lon: extent[0],
            max_lon: extent[2],
            min_lat: extent[1],
            max_lat: extent[3],
        }
    }

    /// Longitude span in degrees.
    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    /// Latitude span in degrees.
    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    /// Returns the intersection with `other`, or `None` when the boxes do
    /// not overlap.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_lon = self.min_lon.max(other.min_lon);
        let max_lon = self.max_lon.min(other.max_lon);
        let min_lat = self.min_lat.max(other.min_lat);
        let max_lat = self.max_lat.min(other.max_lat);

        if min_lon < max_lon && min_lat < max_lat {
            Some(BoundingBox {
                min_lon,
                max_lon,
                min_lat,
                max_lat,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_is_noop_within_bounds() {
        let mut extent = [-10.0, -5.0, 10.0, 5.0];
        normalize_extent(&mut extent);
        assert_eq!(extent, [-10.0, -5.0, 10.0, 5.0]);
    }

    #[test]
    fn test_normalize_reorders_swapped_longitudes() {
        let mut extent = [10.0, -5.0, -10.0, 5.0];
        normalize_extent(&mut extent);
        assert_eq!(extent[0], -10.0);
        assert_eq!(extent[2], 10.0);
    }

    #[test]
    fn test_normalize_collapses_whole_world() {
        let mut extent = [-200.0, -90.0, 200.0, 90.0];
        normalize_extent(&mut extent);
        assert_eq!(extent[0], -180.0);
        assert_eq!(extent[2], 180.0);
    }

    #[test]
    fn test_normalize_shifts_wrapped_left() {
        // A tile just west of the antimeridian, expressed past -180.
        let mut extent = [-190.0, -10.0, -185.0, 10.0];
        normalize_extent(&mut extent);
        assert_eq!(extent[0], 170.0);
        assert_eq!(extent[2], 175.0);
    }

    #[test]
    fn test_normalize_shifts_wrapped_right() {
        let mut extent = [185.0, -10.0, 190.0, 10.0];
        normalize_extent(&mut extent);
        assert_eq!(extent[0], -175.0);
        assert_eq!(extent[2], -170.0);
    }

    #[test]
    fn test_normalize_tolerates_float_slack() {
        // Bounds fractionally past the boundary stay put rather than
        // shifting a whole revolution.
        let mut extent = [-180.0 - 1e-13, -90.0, 179.0, 90.0];
        normalize_extent(&mut extent);
        assert!(extent[0] >= TILE_LEFT_BOUNDARY);
        assert!((extent[0] - (-180.0)).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_slack_input_converges() {
        let mut extent = [-181.0, -90.0, 179.0, 90.0];
        normalize_extent(&mut extent);
        assert!(extent[0] >= TILE_LEFT_BOUNDARY);
        assert!(extent[2] <= TILE_RIGHT_BOUNDARY + 360.0);
    }

    #[test]
    fn test_normalize_leaves_latitudes_alone() {
        let mut extent = [-190.0, -42.5, -185.0, 61.25];
        normalize_extent(&mut extent);
        assert_eq!(extent[1], -42.5);
        assert_eq!(extent[3], 61.25);
    }

    #[test]
    fn test_bounding_box_from_extent() {
        let bbox = BoundingBox::from_extent(&[-10.0, -5.0, 10.0, 5.0]);
        assert_eq!(bbox.min_lon, -10.0);
        assert_eq!(bbox.max_lon, 10.0);
        assert_eq!(bbox.min_lat, -5.0);
        assert_eq!(bbox.max_lat, 5.0);
        assert_eq!(bbox.width(), 20.0);
        assert_eq!(bbox.height(), 10.0);
    }

    #[test]
    fn test_bounding_box_intersection() {
        let a = BoundingBox::from_extent(&[-10.0, -10.0, 10.0, 10.0]);
        let b = BoundingBox::from_extent(&[0.0, 0.0, 20.0, 20.0]);

        let i = a.intersection(&b).expect("boxes overlap");
        assert_eq!(i.min_lon, 0.0);
        assert_eq!(i.max_lon, 10.0);
        assert_eq!(i.min_lat, 0.0);
        assert_eq!(i.max_lat, 10.0);

        let c = BoundingBox::from_extent(&[30.0, 30.0, 40.0, 40.0]);
        assert!(a.intersection(&c).is_none());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_normalize_noop_in_range(
                west in -180.0..180.0_f64,
                span in 0.0..10.0_f64,
                south in -90.0..0.0_f64,
                north in 0.0..90.0_f64
            ) {
                let east = (west + span).min(180.0);
                let mut extent = [west, south, east, north];
                let before = extent;
                normalize_extent(&mut extent);

                prop_assert!((extent[0] - before[0]).abs() < 1e-9);
                prop_assert!((extent[2] - before[2]).abs() < 1e-9);
            }

            #[test]
            fn test_normalize_converges_left_bound(
                wraps in 1u32..4,
                west in -180.0..-170.0_f64,
                span in 0.1..20.0_f64
            ) {
                // Shift an in-range interval west by whole revolutions and
                // check normalization brings it back.
                let offset = 360.0 * wraps as f64;
                let mut extent = [west - offset, -10.0, west + span - offset, 10.0];
                normalize_extent(&mut extent);

                prop_assert!(extent[0] >= TILE_LEFT_BOUNDARY);
                prop_assert!((extent[0] - west).abs() < 1e-6);
            }

            #[test]
            fn test_normalize_preserves_span(
                west in -540.0..540.0_f64,
                span in 0.1..100.0_f64
            ) {
                let mut extent = [west, -10.0, west + span, 10.0];
                normalize_extent(&mut extent);

                prop_assert!((extent[2] - extent[0] - span).abs() < 1e-6);
            }
        }
    }
}
