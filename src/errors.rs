use thiserror::Error;

/// Every failure mode of the lifecycle manager in one enum.
/// Variants carry enough context to tell *which* operation on *which*
/// model/ticker went wrong without chasing the log output.
#[derive(Error, Debug)]
pub enum QuantrsError {
    /// Insufficient, empty or malformed training data. Fatal for the single
    /// training run it occurred in; batch callers skip the ticker.
    #[error("data error: {ticker} - {reason}")]
    Data { ticker: String, reason: String },

    /// No artifact matches the requested selector.
    #[error("model not found: {selector}")]
    ModelNotFound { selector: String },

    /// An artifact exists on disk but fails to deserialize.
    #[error("corrupt artifact: {path} - {reason}")]
    CorruptArtifact { path: String, reason: String },

    /// Illegal registry state transition (deleting a production model,
    /// deleting without confirmation, promoting a record with no artifact).
    #[error("promotion error: {operation} - {reason}")]
    Promotion { operation: String, reason: String },

    /// Relational store / SQLite failures.
    #[error("database error: {operation} - {reason}")]
    Database { operation: String, reason: String },

    /// Configuration failures, forwarded from the config loader.
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Serialization / deserialization failures outside of artifacts.
    #[error("parse error: {data_type} - {reason}")]
    Parsing { data_type: String, reason: String },

    /// Training kill-switch fired between CV folds.
    #[error("training interrupted: {ticker} after fold {fold}")]
    Interrupted { ticker: String, fold: usize },

    #[error("i/o error: {operation} - {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error: {message}")]
    General { message: String },
}

/// Result alias used by every fallible function in the crate.
pub type QuantrsResult<T> = Result<T, QuantrsError>;

impl QuantrsError {
    pub fn data(ticker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Data {
            ticker: ticker.into(),
            reason: reason.into(),
        }
    }

    pub fn model_not_found(selector: impl Into<String>) -> Self {
        Self::ModelNotFound {
            selector: selector.into(),
        }
    }

    pub fn corrupt_artifact(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn promotion(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Promotion {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn database(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn parsing(data_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parsing {
            data_type: data_type.into(),
            reason: reason.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::General {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for QuantrsError {
    fn from(error: rusqlite::Error) -> Self {
        let operation = match &error {
            rusqlite::Error::SqliteFailure(_, _) => "sql execution",
            rusqlite::Error::InvalidParameterName(_) => "parameter binding",
            rusqlite::Error::InvalidPath(_) => "database path",
            rusqlite::Error::InvalidColumnIndex(_) => "column index",
            rusqlite::Error::InvalidColumnName(_) => "column name",
            rusqlite::Error::InvalidColumnType(_, _, _) => "column type",
            _ => "database operation",
        };

        QuantrsError::Database {
            operation: operation.to_string(),
            reason: error.to_string(),
        }
    }
}

impl From<std::io::Error> for QuantrsError {
    fn from(error: std::io::Error) -> Self {
        QuantrsError::Io {
            operation: "file i/o".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for QuantrsError {
    fn from(error: serde_json::Error) -> Self {
        QuantrsError::Parsing {
            data_type: "json".to_string(),
            reason: error.to_string(),
        }
    }
}

impl From<&str> for QuantrsError {
    fn from(message: &str) -> Self {
        QuantrsError::General {
            message: message.to_string(),
        }
    }
}

impl From<String> for QuantrsError {
    fn from(message: String) -> Self {
        QuantrsError::General { message }
    }
}

impl From<tokio::task::JoinError> for QuantrsError {
    fn from(error: tokio::task::JoinError) -> Self {
        QuantrsError::General {
            message: format!("worker task failed: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = QuantrsError::data("TST", "only 3 usable rows");
        assert_eq!(error.to_string(), "data error: TST - only 3 usable rows");
    }

    #[test]
    fn test_promotion_helper() {
        let error = QuantrsError::promotion("delete_model", "model is in production");
        match error {
            QuantrsError::Promotion { operation, .. } => {
                assert_eq!(operation, "delete_model");
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn test_result_alias() {
        fn produces() -> QuantrsResult<u32> {
            Ok(7)
        }
        assert_eq!(produces().expect("should succeed"), 7);
    }
}
