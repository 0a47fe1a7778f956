use std::fmt;

use thiserror::Error;

/// Nodeboot error types
#[derive(Error, Debug)]
pub enum StageError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Image reference cannot be staged (not a version tag or digest)
    #[error("Invalid image reference {reference}: {message}")]
    InvalidReference { reference: String, message: String },

    /// File name does not map to a supported archive container
    #[error("Unsupported archive {0}: unhandled file type")]
    UnsupportedArchive(String),

    /// Archive could not be read or does not hold the expected content
    #[error("Archive error: {0}")]
    Archive(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Layer cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Image content could not be extracted
    #[error("Failed to extract runtime image {reference}: {source}")]
    Extract {
        reference: String,
        #[source]
        source: Box<StageError>,
    },

    /// Staged content could not be moved into place
    #[error("Placement error: {0}")]
    Placement(String),

    /// Manifest could not be read or written
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Several independent failures
    #[error("{0}")]
    Multiple(MultiError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        StageError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StageError {
    fn from(err: serde_yaml::Error) -> Self {
        StageError::Serialization(err.to_string())
    }
}

impl From<MultiError> for StageError {
    fn from(errs: MultiError) -> Self {
        StageError::Multiple(errs)
    }
}

/// Result type alias for nodeboot operations
pub type Result<T> = std::result::Result<T, StageError>;

/// An ordered collection of independent failures.
///
/// Best-effort passes (placement, manifest rewriting, stream close) push
/// every failure here and keep going; callers inspect it with
/// [`MultiError::is_empty`] or collapse it with [`MultiError::into_result`].
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<StageError>,
}

impl MultiError {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure.
    pub fn push(&mut self, err: impl Into<StageError>) {
        self.errors.push(err.into());
    }

    /// Record the failure of `result`, if any.
    pub fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    /// True when nothing failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Iterate over recorded failures in order.
    pub fn iter(&self) -> impl Iterator<Item = &StageError> {
        self.errors.iter()
    }

    /// `Ok(())` when empty, the error itself when there is exactly one,
    /// and [`StageError::Multiple`] otherwise.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(StageError::Multiple(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl IntoIterator for MultiError {
    type Item = StageError;
    type IntoIter = std::vec::IntoIter<StageError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = StageError::Config("Missing required field".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: Missing required field"
        );
    }

    #[test]
    fn test_invalid_reference_display() {
        let error = StageError::InvalidReference {
            reference: "docker.io/rancher/rke2-runtime:latest".to_string(),
            message: "not a digest or version tag".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid image reference docker.io/rancher/rke2-runtime:latest: not a digest or version tag"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = StageError::Registry {
            registry: "ghcr.io".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - Authentication failed"
        );
    }

    #[test]
    fn test_extract_error_names_reference() {
        let error = StageError::Extract {
            reference: "docker.io/rancher/rke2-runtime:v1.2.3".to_string(),
            source: Box::new(StageError::Placement("bin missing".to_string())),
        };
        let msg = error.to_string();
        assert!(msg.contains("rke2-runtime:v1.2.3"));
        assert!(msg.contains("bin missing"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: StageError = io_error.into();
        assert!(matches!(error, StageError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: StageError = result.unwrap_err().into();
        assert!(matches!(error, StageError::Serialization(_)));
    }

    #[test]
    fn test_multi_error_empty_is_ok() {
        let errs = MultiError::new();
        assert!(errs.is_empty());
        assert!(errs.into_result().is_ok());
    }

    #[test]
    fn test_multi_error_single_unwraps() {
        let mut errs = MultiError::new();
        errs.push(StageError::Other("only".to_string()));
        let err = errs.into_result().unwrap_err();
        assert!(matches!(err, StageError::Other(_)));
    }

    #[test]
    fn test_multi_error_joins_messages() {
        let mut errs = MultiError::new();
        errs.push(StageError::Other("first".to_string()));
        errs.push(StageError::Other("second".to_string()));
        assert_eq!(errs.len(), 2);
        let err = errs.into_result().unwrap_err();
        assert!(matches!(err, StageError::Multiple(_)));
        assert_eq!(err.to_string(), "first, second");
    }

    #[test]
    fn test_multi_error_check() {
        let mut errs = MultiError::new();
        assert_eq!(errs.check(Ok(3)), Some(3));
        assert_eq!(
            errs.check::<i32>(Err(StageError::Other("bad".to_string()))),
            None
        );
        assert_eq!(errs.len(), 1);
    }
}
