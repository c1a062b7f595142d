//! Errors raised while loading the engine's JSON settings file.
//!
//! Protocol-engine errors live in [`crate::mcp::error`]. Nothing here
//! carries setting values, so configured API keys never reach a log line;
//! only the file path or the offending field name is reported.

use std::path::PathBuf;

use thiserror::Error;

/// Why the settings file could not be turned into a usable [`Config`].
///
/// [`Config`]: crate::config::Config
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file exists but reading it failed (permissions, not a file).
    #[error("cannot read engine settings from {path}")]
    ReadError {
        /// The settings file.
        path: PathBuf,
        /// What the filesystem reported.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON, or has unknown or mistyped keys.
    #[error("engine settings in {path} are not valid JSON for this engine")]
    ParseError {
        /// The settings file.
        path: PathBuf,
        /// Position and cause from the JSON decoder.
        #[source]
        source: serde_json::Error,
    },

    /// An explicitly named settings file does not exist.
    #[error("no engine settings file at {path}")]
    NotFound {
        /// The path given on the command line.
        path: PathBuf,
    },

    /// The file decoded, but a limit or option is out of range.
    #[error("engine settings rejected: {message}")]
    ValidationError {
        /// The field at fault and the accepted range.
        message: String,
    },
}
