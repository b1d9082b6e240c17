use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the library.
#[derive(Debug, Error)]
pub enum Error {
    /// Used when the user pass a logical invalid parameter to a function.
    /// Raised before any work is done, so the input is left untouched.
    #[error("Parameter error: {0}")]
    InvalidParameter(String),
    /// The global aligner could not find a viable transformation.
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("Parser error: {0}")]
    Parse(String),
    #[error("Write error: {0}")]
    Write(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a error with the kind `InvalidParameter`.
    /// # Arguments
    /// * `msg` - The error message.
    pub fn invalid_parameter<T: ToString>(msg: T) -> Self {
        Error::InvalidParameter(msg.to_string())
    }

    /// Create a error with the kind `RegistrationFailed`.
    pub fn registration_failed<T: ToString>(msg: T) -> Self {
        Error::RegistrationFailed(msg.to_string())
    }

    pub fn parse<T: ToString>(msg: T) -> Self {
        Error::Parse(msg.to_string())
    }

    pub fn write<T: ToString>(msg: T) -> Self {
        Error::Write(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
