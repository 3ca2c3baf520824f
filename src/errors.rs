use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("SCHEMA_VIOLATION: {0}")]
    SchemaViolation(String),
    #[error("INVALID_DATE: {0}")]
    InvalidDate(String),
    #[error("GOAL_UNRESOLVABLE: {0}")]
    GoalUnresolvable(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("STORAGE: {0}")]
    Storage(String),
}

impl AppError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(value: csv::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<tempfile::PersistError> for AppError {
    fn from(value: tempfile::PersistError) -> Self {
        Self::Io(value.error.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn only_storage_and_io_are_fatal() {
        assert!(AppError::Storage("disk full".to_string()).is_fatal());
        assert!(AppError::Io("denied".to_string()).is_fatal());
        assert!(!AppError::SchemaViolation("bad".to_string()).is_fatal());
        assert!(!AppError::InvalidDate("3000-01-01".to_string()).is_fatal());
        assert!(!AppError::GoalUnresolvable("x".to_string()).is_fatal());
    }

    #[test]
    fn display_carries_error_code() {
        let error = AppError::SchemaViolation("fitness.sessions expects count".to_string());
        assert_eq!(error.to_string(), "SCHEMA_VIOLATION: fitness.sessions expects count");
    }
}
