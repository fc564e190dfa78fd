//! Error types for the media cache

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum CacheError {
    /// Key absent from the tier, or its backing file is missing
    NotFound,
    /// A value is stored under the key but it is not of the requested type
    TypeMismatch,
    /// The modification-time attribute of a cache file could not be read
    MalformedAttributes(PathBuf),
    /// Listing the cache directory failed
    DirectoryEnumerationFailed(PathBuf, Box<std::io::Error>),
    Io(Box<std::io::Error>),
    Serialization(String),
    Config(String),
}

impl CacheError {
    /// Read misses are expected and should not be reported as failures
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "Entry not found"),
            CacheError::TypeMismatch => write!(f, "Cached value has a different type"),
            CacheError::MalformedAttributes(path) => {
                write!(f, "Malformed file attributes: {}", path.display())
            }
            CacheError::DirectoryEnumerationFailed(path, err) => {
                write!(f, "Failed to enumerate {}: {}", path.display(), err)
            }
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            CacheError::DirectoryEnumerationFailed(_, err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return CacheError::NotFound;
        }
        CacheError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
