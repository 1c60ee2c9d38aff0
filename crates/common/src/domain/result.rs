use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Refusing to report to untrusted base URL host: {0}")]
    InsecureBaseUrl(String),

    #[error("Invalid {0} identifier: <REDACTED>")]
    InvalidDestinationIdentifier(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Store is corrupted: {0}")]
    StoreCorrupted(String),

    #[error("Store schema mismatch for table {0}")]
    SchemaMismatch(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for DomainError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
                ) =>
            {
                DomainError::StoreCorrupted(err.to_string())
            }
            other => DomainError::StoreError(other.to_string()),
        }
    }
}
