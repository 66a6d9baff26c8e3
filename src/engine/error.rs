//! Engine error type
//!
//! Fetch and hydration failures surface verbatim in `EngineSnapshot::error`.

#[derive(Debug)]
pub enum EngineError {
    /// Upstream data fetch failed (network, auth, missing site)
    Fetch(String),
    /// Fetched data did not have the expected shape
    DataShape(String),
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    /// A single aggregation view failed
    View { view: String, message: String },
    InvalidRange(String),
    /// Orchestrator task is gone
    Closed,
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Database(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Fetch(e) => write!(f, "Fetch error: {}", e),
            EngineError::DataShape(e) => write!(f, "Data shape error: {}", e),
            EngineError::Database(e) => write!(f, "Database error: {}", e),
            EngineError::Serialization(e) => write!(f, "Serialization error: {}", e),
            EngineError::Io(e) => write!(f, "IO error: {}", e),
            EngineError::View { view, message } => {
                write!(f, "Aggregation '{}' failed: {}", view, message)
            }
            EngineError::InvalidRange(e) => write!(f, "Invalid time range: {}", e),
            EngineError::Closed => write!(f, "Engine task is not running"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Database(e) => Some(e),
            EngineError::Serialization(e) => Some(e),
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}
