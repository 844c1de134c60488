//! Errors surfaced by the command-line runner.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum CliError {
    /// A file could not be read.
    ReadFile { path: PathBuf, details: String },
    /// A file or argument did not hold the expected JSON.
    InvalidJson { origin: String, details: String },
    /// Engine configuration could not be loaded.
    Config { details: String },
    /// An execution id could not be parsed.
    InvalidId { value: String, details: String },
    /// The repository failed.
    Repository { details: String },
    /// The engine rejected the request.
    Engine { details: String },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, details } => {
                write!(f, "failed to read {}: {}", path.display(), details)
            }
            Self::InvalidJson { origin, details } => {
                write!(f, "invalid JSON in {}: {}", origin, details)
            }
            Self::Config { details } => write!(f, "invalid configuration: {}", details),
            Self::InvalidId { value, details } => {
                write!(f, "invalid execution id '{}': {}", value, details)
            }
            Self::Repository { details } => write!(f, "repository error: {}", details),
            Self::Engine { details } => write!(f, "{}", details),
        }
    }
}

impl std::error::Error for CliError {}
