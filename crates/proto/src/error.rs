use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// LLM provider errors
#[derive(Debug, Error)]
pub enum LlmError {
    /// Remote API failure.
    #[error("{0}")]
    Api(String),

    /// Provider rejected the credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider throttled the request.
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Provider response schema/content was invalid.
    #[error("Invalid response from LLM: {0}")]
    InvalidResponse(String),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Migration execution error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Caller passed an argument the store cannot act on.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Embedding model errors
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The embedding model could not be loaded.
    #[error("Failed to load embedding model: {0}")]
    Load(String),

    /// The model failed to encode a batch.
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// A stored vector blob could not be decoded.
    #[error("Malformed embedding blob: {0}")]
    Malformed(String),
}

/// Agent runtime errors surfaced to callers as hard failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Requested agent is not present in the configuration.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid agent role string value.
    #[error("Invalid agent role: {0}")]
    InvalidRole(String),

    /// Invalid context strategy string value.
    #[error("Invalid context strategy: {0}")]
    InvalidStrategy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("agents.builder.model".to_string());
        assert!(err.to_string().contains("Missing required field"));
    }

    #[test]
    fn auth_error_mentions_authentication() {
        let err = LlmError::Auth("invalid x-api-key".to_string());
        assert!(err.to_string().to_lowercase().contains("authentication"));
    }

    #[test]
    fn api_error_displays_raw_message() {
        let err = LlmError::Api("connection reset".to_string());
        assert_eq!(err.to_string(), "connection reset");
    }

    #[test]
    fn unknown_agent_names_the_agent() {
        let err = RuntimeError::UnknownAgent("reviewer".to_string());
        assert_eq!(err.to_string(), "Unknown agent: reviewer");
    }

    #[test]
    fn database_and_embedding_errors_carry_detail() {
        let err = DatabaseError::InvalidArgument("cleanup days must not be negative, got -5".to_string());
        assert!(err.to_string().contains("got -5"));

        let err = EmbeddingError::Malformed("len 3".to_string());
        assert!(err.to_string().contains("len 3"));
    }
}
