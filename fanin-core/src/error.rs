use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Queue Error - {0}")]
    Queue(#[from] fanin_queue::Error),

    #[error("Decode Error - {0}")]
    Decode(String),

    #[error("Correlation refers to endpoint index {0}, which this worker does not own")]
    UnknownEndpoint(usize),

    #[error("Spout is closed")]
    Closed,

    #[error("Downstream Error - {0}")]
    Downstream(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    #[error("Worker Error - {0}")]
    Worker(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Decode(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanin_queue::Endpoint;

    #[test]
    fn test_queue_error_conversion() {
        let err: Error = fanin_queue::Error::Closed(Endpoint::new("a", 1)).into();
        assert!(matches!(err, Error::Queue(_)));
        assert_eq!(
            err.to_string(),
            "Queue Error - Connection to a:1 is already closed"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Decode(_)));
    }
}
