//! Error taxonomy for the canary workload
//!
//! Every failure the workload can observe maps onto one of these variants.
//! The variant decides the recovery policy: send failures are handed to the
//! producer's error handler, synthetic and parse failures are always raised to
//! the consumer-group machinery, handler failures stop the producer loop.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanaryError {
    /// Broker connect/disconnect failure (unreachable broker, auth failure)
    #[error("Connection error: {0}")]
    Connection(String),

    /// A batch could not be delivered to the broker
    #[error("Send error: {0}")]
    Send(String),

    /// Deliberately injected consumer fault
    #[error("Synthetic failure: {0}")]
    SyntheticFailure(String),

    /// An outbound payload could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Malformed message payload
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The producer's error callback itself failed
    #[error("Error handler failed: {source}")]
    Handler {
        #[source]
        source: Box<CanaryError>,
        /// Description of the send failure the handler was given
        original: String,
    },

    /// Any other broker client failure (commit, seek, subscribe)
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CanaryError {
    /// Short, stable name of the variant, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            CanaryError::Connection(_) => "ConnectionError",
            CanaryError::Send(_) => "SendError",
            CanaryError::SyntheticFailure(_) => "SyntheticFailure",
            CanaryError::Encode(_) => "EncodeError",
            CanaryError::Parse(_) => "ParseError",
            CanaryError::Handler { .. } => "HandlerError",
            CanaryError::Broker(_) => "BrokerError",
            CanaryError::Config(_) => "ConfigError",
            CanaryError::InvalidState(_) => "InvalidState",
            CanaryError::Metrics(_) => "MetricsError",
            CanaryError::Io(_) => "IoError",
        }
    }
}

impl From<rdkafka::error::KafkaError> for CanaryError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        CanaryError::Broker(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CanaryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(CanaryError::Send("x".into()).kind(), "SendError");
        assert_eq!(
            CanaryError::SyntheticFailure("x".into()).kind(),
            "SyntheticFailure"
        );
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(CanaryError::from(parse).kind(), "ParseError");
    }

    #[test]
    fn test_handler_error_keeps_both_causes() {
        let err = CanaryError::Handler {
            source: Box::new(CanaryError::Broker("tracker down".into())),
            original: "Send error: timeout".into(),
        };
        assert_eq!(err.to_string(), "Error handler failed: Broker error: tracker down");
        match err {
            CanaryError::Handler { original, source } => {
                assert_eq!(original, "Send error: timeout");
                assert_eq!(source.kind(), "BrokerError");
            }
            _ => panic!("Expected Handler variant"),
        }
    }
}
