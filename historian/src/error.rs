use crate::fetch::FetchError;
use crate::store::EntityError;
use model::ModelError;
use thiserror::Error;

/// Failures surfaced by historian operations.
///
/// Per-item upstream failures inside a sync pass never reach this type; they
/// are logged and the item is skipped.
#[derive(Error, Debug)]
pub enum HistorianError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Upstream error: {0}")]
    Upstream(#[from] FetchError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Store(#[from] EntityError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

pub type HistorianResult<T> = Result<T, HistorianError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_structured() {
        assert_eq!(
            HistorianError::NotFound("Commit").to_string(),
            "Commit not found"
        );
        assert_eq!(HistorianError::Unauthorized.to_string(), "Unauthorized");

        let upstream: HistorianError = FetchError::Client {
            status: 404,
            body: "Not Found".to_string(),
        }
        .into();
        assert_eq!(upstream.to_string(), "Upstream error: HTTP 404: Not Found");
    }
}
