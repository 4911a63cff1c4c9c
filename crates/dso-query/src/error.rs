use thiserror::Error;

/// Unified error type for all query engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Malformed filter, unknown field or lookup, bad temporal value, bad page number
    #[error("Invalid parameter '{param}': {message}")]
    Validation { param: String, message: String },

    /// Scope check failed for a field, relation or requested embedded field
    #[error("Permission denied for '{subject}': {message}")]
    PermissionDenied { subject: String, message: String },

    /// Page beyond the available data, or an entity/table that no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// A table could not be mapped to an entity type
    #[error("Schema error in table '{table}': {message}")]
    Schema { table: String, message: String },

    /// Internal consistency failure; indicates a programming defect
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Backend query execution failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Coarse classification used by transport layers to pick a response status
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    NotFound,
    Schema,
    Invariant,
    Backend,
}

impl QueryError {
    pub fn validation(param: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::Validation {
            param: param.into(),
            message: message.into(),
        }
    }

    pub fn permission_denied(subject: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::PermissionDenied {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        QueryError::NotFound(msg.into())
    }

    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        QueryError::InvariantViolation(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        QueryError::Backend(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Validation { .. } => ErrorKind::Validation,
            QueryError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            QueryError::NotFound(_) => ErrorKind::NotFound,
            QueryError::Schema { .. } | QueryError::Serialization(_) => ErrorKind::Schema,
            QueryError::InvariantViolation(_) | QueryError::InvalidConfiguration(_) => {
                ErrorKind::Invariant
            }
            QueryError::Backend(_) => ErrorKind::Backend,
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for QueryError {
    fn from(err: serde_yaml::Error) -> Self {
        QueryError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_param() {
        let err = QueryError::validation("naam[foo]", "unsupported lookup");
        assert_eq!(
            err.to_string(),
            "Invalid parameter 'naam[foo]': unsupported lookup"
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            QueryError::permission_denied("ligtInWijk", "missing scope").kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(QueryError::not_found("page 3").kind(), ErrorKind::NotFound);
        assert_eq!(QueryError::invariant("x").kind(), ErrorKind::Invariant);
    }
}
