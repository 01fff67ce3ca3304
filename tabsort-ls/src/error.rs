//! Error types for tabsort-ls
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for tabsort-ls
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O errors (classification logs, data folder)
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A listening port could not be bound
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// tabsort-common error (configuration, data folder)
    #[error("Common error: {0}")]
    Common(#[from] tabsort_common::Error),
}

/// Convenience Result type using tabsort-ls Error
pub type Result<T> = std::result::Result<T, Error>;
