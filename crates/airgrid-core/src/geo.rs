use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Absorbs float noise so that exact grid multiples (e.g. 0.3 with a 0.1 grid) floor into their own cell.
const CELL_EPSILON: f64 = 1e-9;

/// Validated WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    /// Rejects latitudes outside [-90, 90], longitudes outside [-180, 180] and non-finite values.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, FetchError> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid {
            return Err(FetchError::InvalidCoordinates {
                latitude,
                longitude,
            });
        }

        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub const fn latitude(&self) -> f64 {
        self.latitude
    }

    pub const fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn bucket(&self, grid_size: f64) -> GeoBucketKey {
        GeoBucketKey::new(*self, grid_size)
    }
}

impl Display for Coordinates {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4},{:.4}", self.latitude, self.longitude)
    }
}

/// Grid cell a coordinate falls into.
///
/// Stored as integer cell indices so keys hash and compare exactly. Keys are only
/// comparable between caches sharing the same grid size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeoBucketKey {
    lat_cell: i64,
    lon_cell: i64,
}

impl GeoBucketKey {
    /// Floors each coordinate to the nearest lower multiple of `grid_size` degrees.
    pub fn new(coordinates: Coordinates, grid_size: f64) -> Self {
        Self {
            lat_cell: cell_index(coordinates.latitude, grid_size),
            lon_cell: cell_index(coordinates.longitude, grid_size),
        }
    }

    pub const fn lat_cell(&self) -> i64 {
        self.lat_cell
    }

    pub const fn lon_cell(&self) -> i64 {
        self.lon_cell
    }

    /// South-west corner of the cell in degrees.
    pub fn origin(&self, grid_size: f64) -> (f64, f64) {
        (
            self.lat_cell as f64 * grid_size,
            self.lon_cell as f64 * grid_size,
        )
    }
}

impl Display for GeoBucketKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.lat_cell, self.lon_cell)
    }
}

fn cell_index(value: f64, grid_size: f64) -> i64 {
    (value / grid_size + CELL_EPSILON).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(latitude: f64, longitude: f64) -> Coordinates {
        Coordinates::new(latitude, longitude).expect("valid coordinates")
    }

    #[test]
    fn nearby_points_share_a_cell() {
        let amsterdam = coords(52.370, 4.895).bucket(0.5);
        let nearby = coords(52.400, 4.850).bucket(0.5);
        let elsewhere = coords(53.0, 5.0).bucket(0.5);

        assert_eq!(amsterdam, nearby);
        assert_ne!(amsterdam, elsewhere);
        assert_eq!(amsterdam.to_string(), "104:9");
    }

    #[test]
    fn negative_coordinates_floor_downwards() {
        let key = coords(-33.87, -151.21).bucket(1.0);

        assert_eq!(key.lat_cell(), -34);
        assert_eq!(key.lon_cell(), -152);
        assert_eq!(key.origin(1.0), (-34.0, -152.0));
    }

    #[test]
    fn exact_multiples_start_their_own_cell() {
        assert_eq!(coords(0.3, 0.0).bucket(0.1).lat_cell(), 3);
        assert_eq!(coords(0.29, 0.0).bucket(0.1).lat_cell(), 2);
    }

    #[test]
    fn grid_size_changes_the_key_space() {
        let point = coords(52.37, 4.895);

        assert_ne!(point.bucket(0.5), point.bucket(0.1));
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        assert!(Coordinates::new(90.0, 180.0).is_ok());
        assert!(Coordinates::new(-90.0, -180.0).is_ok());
        assert!(matches!(
            Coordinates::new(90.5, 0.0),
            Err(FetchError::InvalidCoordinates { .. })
        ));
        assert!(Coordinates::new(0.0, -180.01).is_err());
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
    }
}
