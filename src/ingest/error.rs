//! Ingestion error types

use thiserror::Error;

/// Why an inbound message was not accepted
///
/// None of these are retried: the message is logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Payload is not a JSON object
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A required field is missing or not an integer
    #[error("Missing or invalid field: {0}")]
    Validation(&'static str),

    #[error("No handler for topic {0}")]
    UnknownTopic(String),

    /// The buffer or store refused the message
    #[error("Storage rejected message: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            IngestError::Validation("DEVICE_ID").to_string(),
            "Missing or invalid field: DEVICE_ID"
        );
    }
}
