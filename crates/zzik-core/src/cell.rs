//! Hexagonal spatial cells (H3) for coarse proximity checks.
//!
//! A cell id is an opaque string. Two cells are only ever compared through
//! [`cell_distance`], the number of hops between them in the hex grid.
//!
//! # Resolution reference
//!
//! | res | avg edge | use                        |
//! |-----|----------|----------------------------|
//! | 7   | 1.2 km   | blocks                     |
//! | 9   | 174 m    | buildings                  |
//! | 10  | 66 m     | POI proximity (default)    |
//! | 12  | 9.4 m    | strict same-cell proximity |

use std::fmt;
use std::str::FromStr;

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CoreError, GeoPoint};

/// Resolution used for fraud checks (~66 m average edge).
pub const DEFAULT_RESOLUTION: u8 = 10;

/// Grid distance reported for malformed or incomparable cells.
///
/// Maps to the top fraud band, so a broken comparison always leans suspicious.
pub const UNRELATED_CELLS: u64 = 9_007_199_254_740_991;

/// Opaque spatial cell identifier.
///
/// May wrap a malformed string (e.g. a corrupted stored POI cell); use
/// [`is_valid_cell`] to check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    fn parse(&self) -> Result<CellIndex, CoreError> {
        CellIndex::from_str(&self.0).map_err(|_| CoreError::InvalidCell(self.0.clone()))
    }
}

impl From<String> for CellId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Map a coordinate to its cell at `resolution` (0..=15).
pub fn to_cell(lat: f64, lng: f64, resolution: u8) -> Result<CellId, CoreError> {
    GeoPoint::new(lat, lng)?;
    let res = Resolution::try_from(resolution).map_err(|_| CoreError::InvalidResolution(resolution))?;
    let ll = LatLng::new(lat, lng).map_err(|_| CoreError::InvalidCoordinate { lat, lng })?;
    Ok(CellId(ll.to_cell(res).to_string()))
}

/// Cell at [`DEFAULT_RESOLUTION`].
pub fn to_default_cell(point: GeoPoint) -> Result<CellId, CoreError> {
    to_cell(point.lat, point.lng, DEFAULT_RESOLUTION)
}

/// Number of hops between two cells. Never fails.
///
/// Identical cells are 0 apart. Malformed ids, mixed resolutions, and cells
/// too far apart for the grid algorithm all yield [`UNRELATED_CELLS`].
pub fn cell_distance(a: &CellId, b: &CellId) -> u64 {
    let (ca, cb) = match (a.parse(), b.parse()) {
        (Ok(ca), Ok(cb)) => (ca, cb),
        _ => {
            debug!(a = %a, b = %b, "cell distance on malformed id");
            return UNRELATED_CELLS;
        }
    };
    if ca == cb {
        return 0;
    }
    match ca.grid_distance(cb) {
        Ok(d) => u64::try_from(d).unwrap_or(UNRELATED_CELLS),
        Err(e) => {
            debug!(a = %a, b = %b, error = %e, "grid distance failed");
            UNRELATED_CELLS
        }
    }
}

/// Whether `id` is a well-formed cell index.
pub fn is_valid_cell(id: &str) -> bool {
    CellIndex::from_str(id).is_ok()
}

/// Resolution of a well-formed cell id.
pub fn cell_resolution(id: &str) -> Option<u8> {
    CellIndex::from_str(id).ok().map(|cell| u8::from(cell.resolution()))
}

/// Centre point of a cell.
pub fn cell_center(cell: &CellId) -> Result<GeoPoint, CoreError> {
    let ll = LatLng::from(cell.parse()?);
    Ok(GeoPoint {
        lat: ll.lat(),
        lng: ll.lng(),
    })
}

/// Boundary vertices of a cell, for map overlays.
pub fn cell_boundary(cell: &CellId) -> Result<Vec<GeoPoint>, CoreError> {
    let boundary = cell.parse()?.boundary();
    Ok(boundary
        .iter()
        .map(|ll| GeoPoint {
            lat: ll.lat(),
            lng: ll.lng(),
        })
        .collect())
}
