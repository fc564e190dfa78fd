//! Error types for the media cache janitor

use std::fmt;

#[derive(Debug)]
pub enum JanitorError {
    Cache(media_cache::CacheError),
    Config(String),
}

impl fmt::Display for JanitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JanitorError::Cache(err) => write!(f, "Cache error: {}", err),
            JanitorError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for JanitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JanitorError::Cache(err) => Some(err),
            JanitorError::Config(_) => None,
        }
    }
}

impl From<media_cache::CacheError> for JanitorError {
    fn from(err: media_cache::CacheError) -> Self {
        JanitorError::Cache(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for JanitorError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        JanitorError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for JanitorError {
    fn from(err: serde_json::Error) -> Self {
        JanitorError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JanitorError>;
