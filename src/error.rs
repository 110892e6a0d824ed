use std::time::Duration;

/// Missing or invalid configuration detected at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("index uri is not set (config [index].uri or ZILLIZ_URI)")]
    MissingIndexUri,

    #[error("index token is not set (config [index].token or ZILLIZ_TOKEN)")]
    MissingIndexToken,

    #[error("invalid config value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Failures talking to the vector index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("index request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("index returned code {code}: {message}")]
    Api { code: i64, message: String },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection {collection} not loaded after {timeout:?}")]
    LoadTimeout { collection: String, timeout: Duration },

    #[error("malformed index response: {0}")]
    Malformed(String),
}

/// Failures producing an embedding.
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("embedding request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("embedding service error: {0}")]
    Api(String),

    #[error("embedding service returned no vector")]
    Empty,

    #[error("embedding dimension changed: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Failures during tokenization, generation, decoding or a chat call.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("backend {0} is not loaded")]
    NotLoaded(String),

    #[error("tokenize: {0}")]
    Tokenize(String),

    #[error("generate: {0}")]
    Generate(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("chat request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("chat: {0}")]
    Chat(String),
}

/// A backend identifier outside the closed backend set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Error: Model '{0}' unknown.")]
pub struct UnknownBackend(pub String);

pub type IndexResult<T> = Result<T, IndexError>;
pub type EncoderResult<T> = Result<T, EncoderError>;
pub type GenerationResult<T> = Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_names_identifier() {
        let err = UnknownBackend("mistral".to_string());
        assert_eq!(err.to_string(), "Error: Model 'mistral' unknown.");
    }

    #[test]
    fn config_error_converts_into_index_error() {
        let err: IndexError = ConfigError::MissingIndexToken.into();
        assert!(err.to_string().contains("ZILLIZ_TOKEN"));
    }
}
