//! Single-request fraud scorer.
//!
//! Combines GPS accuracy, cell proximity to the POI, velocity since the last
//! check-in, and a short-window cell-jump penalty into one score in `[0, 1]`.
//! Flags explain the score; only the score decides.

use serde::{Deserialize, Serialize};
use zzik_core::cell::{cell_distance, cell_resolution, to_default_cell};
use zzik_core::geo::distance_meters;
use zzik_core::{CellId, Coordinate, DEFAULT_RESOLUTION, GeoPoint, HistoryEntry, UNRELATED_CELLS};

/// Scores at or above this value block the check-in.
pub const BLOCK_THRESHOLD: f64 = 0.5;

/// Velocities below this many seconds since the last check-in get leniency.
const LENIENCY_SECS: f64 = 10.0;
/// Cell jumps only count when the previous check-in is at most this old.
const CELL_JUMP_WINDOW_SECS: f64 = 60.0;
const CELL_JUMP_LIMIT: u64 = 5;
const CELL_JUMP_PENALTY: f64 = 0.3;
const MIN_ELAPSED_SECS: f64 = 1e-3;

/// Input to [`detect_fraud`]. Coordinates must already be validated.
#[derive(Debug, Clone, Copy)]
pub struct FraudInput<'a> {
    pub current: Coordinate,
    pub poi: GeoPoint,
    /// Stored POI cell; recomputed when absent or malformed.
    pub poi_cell: Option<&'a str>,
    /// The user's most recent prior check-in, if any.
    pub previous: Option<&'a HistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagKind {
    GpsAccuracy,
    H3Distance,
    Teleportation,
    CellJump,
}

impl FlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GpsAccuracy => "GPS_ACCURACY",
            Self::H3Distance => "H3_DISTANCE",
            Self::Teleportation => "TELEPORTATION",
            Self::CellJump => "CELL_JUMP",
        }
    }
}

/// Flag severity, also used as the reporting risk band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudFlag {
    #[serde(rename = "type")]
    pub kind: FlagKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudDetails {
    pub gps_accuracy: f64,
    pub cell_distance: u64,
    pub distance_meters: f64,
    /// Metres per second since the previous check-in.
    pub velocity: Option<f64>,
    /// Seconds since the previous check-in.
    pub time_since_last_check_in: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudResult {
    pub passed: bool,
    pub score: f64,
    pub flags: Vec<FraudFlag>,
    pub details: FraudDetails,
}

impl FraudResult {
    pub fn has_flag(&self, kind: FlagKind) -> bool {
        self.flags.iter().any(|f| f.kind == kind)
    }
}

/// Sub-score for the reported GPS accuracy radius.
pub fn accuracy_score(accuracy_m: f64) -> f64 {
    match accuracy_m {
        a if a <= 20.0 => 0.0,
        a if a <= 50.0 => 0.1,
        a if a <= 100.0 => 0.3,
        a if a <= 200.0 => 0.6,
        _ => 1.0,
    }
}

/// Sub-score for the grid distance between the user and the POI.
pub fn cell_score(cells: u64) -> f64 {
    match cells {
        0 => 0.0,
        1 => 0.1,
        2 => 0.4,
        3..=5 => 0.7,
        _ => 1.0,
    }
}

/// Sub-score for the implied velocity since the last check-in.
pub fn velocity_score(velocity: f64, elapsed_secs: f64) -> f64 {
    if elapsed_secs < LENIENCY_SECS {
        return if velocity > 30.0 { 0.3 } else { 0.0 };
    }
    match velocity {
        v if v <= 5.0 => 0.0,
        v if v <= 15.0 => 0.1,
        v if v <= 30.0 => 0.3,
        v if v <= 50.0 => 0.6,
        _ => 1.0,
    }
}

fn stored_or_computed(stored: Option<&str>, point: GeoPoint) -> Option<CellId> {
    match stored {
        Some(id) if cell_resolution(id) == Some(DEFAULT_RESOLUTION) => Some(CellId::from(id)),
        _ => to_default_cell(point).ok(),
    }
}

fn distance_between(a: Option<&CellId>, b: Option<&CellId>) -> u64 {
    match (a, b) {
        (Some(a), Some(b)) => cell_distance(a, b),
        _ => UNRELATED_CELLS,
    }
}

/// Score one check-in attempt.
pub fn detect_fraud(input: &FraudInput<'_>) -> FraudResult {
    let mut flags = Vec::new();
    let current = input.current.point();
    let accuracy = input.current.accuracy_m;

    // GPS accuracy
    let mut total = accuracy_score(accuracy);
    if accuracy > 100.0 {
        flags.push(FraudFlag {
            kind: FlagKind::GpsAccuracy,
            severity: Severity::High,
            message: format!("GPS accuracy too low: {accuracy}m (expected <= 100m)"),
            value: accuracy,
        });
    } else if accuracy > 50.0 {
        flags.push(FraudFlag {
            kind: FlagKind::GpsAccuracy,
            severity: Severity::Medium,
            message: format!("GPS accuracy moderate: {accuracy}m (expected <= 50m)"),
            value: accuracy,
        });
    }

    // Cell proximity
    let user_cell = to_default_cell(current).ok();
    let poi_cell = stored_or_computed(input.poi_cell, input.poi);
    let cells = distance_between(user_cell.as_ref(), poi_cell.as_ref());
    total += cell_score(cells);
    if cells > 2 {
        flags.push(FraudFlag {
            kind: FlagKind::H3Distance,
            severity: Severity::Critical,
            message: format!("user is {cells} cells away from the POI (expected <= 1)"),
            value: cells as f64,
        });
    } else if cells > 1 {
        flags.push(FraudFlag {
            kind: FlagKind::H3Distance,
            severity: Severity::High,
            message: format!("user is {cells} cells away from the POI (expected same cell)"),
            value: cells as f64,
        });
    }

    // Physical distance is diagnostic only.
    let distance = distance_meters(current, input.poi);

    let mut velocity = None;
    let mut elapsed = None;
    let mut penalty = 0.0;
    let layers = if input.previous.is_some() { 4.0 } else { 2.0 };

    if let Some(prev) = input.previous {
        let secs = (input.current.timestamp - prev.checked_at).num_milliseconds() as f64 / 1000.0;
        let moved = distance_meters(prev.location, current);
        let speed = moved / secs.max(MIN_ELAPSED_SECS);
        velocity = Some(speed);
        elapsed = Some(secs);

        total += velocity_score(speed, secs);
        let band = if speed > 50.0 {
            Some((Severity::Critical, "impossible velocity"))
        } else if speed > 30.0 {
            Some((Severity::High, "high velocity"))
        } else if speed > 15.0 {
            Some((Severity::Medium, "fast movement"))
        } else {
            None
        };
        if let Some((severity, label)) = band {
            flags.push(FraudFlag {
                kind: FlagKind::Teleportation,
                severity,
                message: format!("{label}: {speed:.1} m/s over {secs:.0}s"),
                value: speed,
            });
        }

        let prev_cell = stored_or_computed(prev.cell.as_deref(), prev.location);
        let jump = distance_between(prev_cell.as_ref(), user_cell.as_ref());
        if secs <= CELL_JUMP_WINDOW_SECS && jump > CELL_JUMP_LIMIT {
            penalty = CELL_JUMP_PENALTY;
            flags.push(FraudFlag {
                kind: FlagKind::CellJump,
                severity: Severity::High,
                message: format!("rapid cell jump: {jump} cells in {secs:.0}s"),
                value: jump as f64,
            });
        }
    }

    let score = (total / layers + penalty).clamp(0.0, 1.0);
    FraudResult {
        passed: score < BLOCK_THRESHOLD,
        score,
        flags,
        details: FraudDetails {
            gps_accuracy: accuracy,
            cell_distance: cells,
            distance_meters: distance,
            velocity,
            time_since_last_check_in: elapsed,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Allow,
    Block,
}

/// Reporting view of a fraud score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assessment {
    pub risk: Severity,
    pub action: Verdict,
    pub message: &'static str,
}

pub fn assess(score: f64) -> Assessment {
    let (risk, action, message) = if score < 0.3 {
        (Severity::Low, Verdict::Allow, "check-in looks legitimate")
    } else if score < BLOCK_THRESHOLD {
        (Severity::Medium, Verdict::Allow, "suspicious but allowed")
    } else if score < 0.7 {
        (Severity::High, Verdict::Block, "high fraud risk")
    } else {
        (Severity::Critical, Verdict::Block, "fraud detected")
    };
    Assessment {
        risk,
        action,
        message,
    }
}
