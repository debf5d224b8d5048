use std::fmt;

#[derive(Debug)]
pub enum EmbedError {
    ManifestIntegrity(String),
    Ledger(String),
    Collective(String),
    DatasetLength(String),
    MergeEmpty(String),
    Model(String),
    Shape(String),
    Chunk(String),
    Config(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Io(std::io::Error),
    Other(String),
}

impl EmbedError {
    /// Errors that end the whole run instead of failing a single slide.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            EmbedError::ManifestIntegrity(_)
                | EmbedError::Ledger(_)
                | EmbedError::Collective(_)
                | EmbedError::Config(_)
        )
    }
}

impl fmt::Display for EmbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedError::ManifestIntegrity(e) => write!(f, "Manifest integrity error: {}", e),
            EmbedError::Ledger(e) => write!(f, "Ledger error: {}", e),
            EmbedError::Collective(e) => write!(f, "Collective error: {}", e),
            EmbedError::DatasetLength(e) => write!(f, "Dataset length error: {}", e),
            EmbedError::MergeEmpty(e) => write!(f, "Merge produced no features: {}", e),
            EmbedError::Model(e) => write!(f, "Model error: {}", e),
            EmbedError::Shape(e) => write!(f, "Shape error: {}", e),
            EmbedError::Chunk(e) => write!(f, "Chunk store error: {}", e),
            EmbedError::Config(e) => write!(f, "Config error: {}", e),
            EmbedError::Serialization(e) => write!(f, "Serialization error: {}", e),
            EmbedError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            EmbedError::Json(e) => write!(f, "JSON error: {}", e),
            EmbedError::Io(e) => write!(f, "IO error: {}", e),
            EmbedError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for EmbedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmbedError::Serialization(e) => Some(e.as_ref()),
            EmbedError::Deserialization(e) => Some(e.as_ref()),
            EmbedError::Json(e) => Some(e),
            EmbedError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bincode::error::EncodeError> for EmbedError {
    fn from(err: bincode::error::EncodeError) -> Self {
        EmbedError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for EmbedError {
    fn from(err: bincode::error::DecodeError) -> Self {
        EmbedError::Deserialization(Box::new(err))
    }
}

impl From<serde_json::Error> for EmbedError {
    fn from(err: serde_json::Error) -> Self {
        EmbedError::Json(err)
    }
}

impl From<std::io::Error> for EmbedError {
    fn from(err: std::io::Error) -> Self {
        EmbedError::Io(err)
    }
}

impl From<String> for EmbedError {
    fn from(err: String) -> Self {
        EmbedError::Other(err)
    }
}

impl From<&str> for EmbedError {
    fn from(err: &str) -> Self {
        EmbedError::Other(err.to_string())
    }
}

/// Render an error and every `source()` below it, one cause per line.
pub fn cause_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = format!("0: {}", err);
    let mut depth = 1;
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str(&format!("\n{}: caused by: {}", depth, cause));
        depth += 1;
        current = cause.source();
    }
    out
}
