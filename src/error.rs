use thiserror::Error;

/// Failures talking to the broker. Never fatal to a node; the connection
/// worker keeps retrying.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),

    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    #[error("subscribe failed: {0}")]
    Subscribe(#[source] rumqttc::ClientError),

    #[error("disconnect failed: {0}")]
    Disconnect(#[source] rumqttc::ClientError),

    #[error("could not encode payload for {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A payload that does not match the wire schema of its topic.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload on {topic} is not valid JSON for its schema: {source}")]
    Schema {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("empty tag identifier")]
    EmptyTag,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} not found with {field}={value}")]
    NotFound {
        entity: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("device {0} is already borrowed")]
    AlreadyBorrowed(String),

    #[error("device {0} is not borrowed")]
    NotBorrowed(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("invalid data from reader: {0}")]
    InvalidData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to the kiosk operator.
#[derive(Debug, Error)]
pub enum KioskError {
    #[error("password rejected")]
    Unauthorized,

    #[error("unknown borrower card {0}")]
    UnknownCard(String),

    #[error("unknown device QR code {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
