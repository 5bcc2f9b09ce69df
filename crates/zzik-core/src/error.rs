use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid coordinate: lat={lat}, lng={lng} (lat must be in [-90, 90], lng in [-180, 180])")]
    InvalidCoordinate { lat: f64, lng: f64 },

    #[error("invalid GPS accuracy: {0}m (must be finite and >= 0)")]
    InvalidAccuracy(f64),

    #[error("invalid resolution: {0} (must be between 0 and 15)")]
    InvalidResolution(u8),

    #[error("invalid cell id: {0:?}")]
    InvalidCell(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
