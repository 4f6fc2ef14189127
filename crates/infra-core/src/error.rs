//! Error types for matrix, recipe and publish operations

use thiserror::Error;

/// Errors raised while expanding, building or publishing a matrix entry.
#[derive(Error, Debug)]
pub enum InfraError {
    /// Malformed build spec, matrix file or trigger context.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A package operation inside a recipe failed.
    #[error("Package install failed at step '{step}': {message}")]
    PackageInstall { step: String, message: String },

    /// The container engine could not build an image.
    #[error("Image build failed for {image}: {message}")]
    Build { image: String, message: String },

    /// Authentication or push to the registry failed.
    #[error("Publish failed for {reference}: {message}")]
    Publish { reference: String, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Matrix file parse error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InfraError {
    /// Shorthand for a [`InfraError::Configuration`] error.
    pub fn config(msg: impl Into<String>) -> Self {
        InfraError::Configuration(msg.into())
    }
}

/// Result type for infra operations
pub type Result<T> = std::result::Result<T, InfraError>;
