//! Error types for configuration operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading, saving or building a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file '{path}': {source}")]
    ReadFile {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a file
    #[error("failed to write file '{path}': {source}")]
    WriteFile {
        /// Path of the file that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// No built-in module has this kind
    #[error("unknown module kind '{kind}' for module '{module}'")]
    UnknownModuleKind {
        /// Module name from the configuration.
        module: String,
        /// Kind that did not match the registry.
        kind: String,
    },

    /// A connection or port reference does not resolve
    #[error("unknown port '{0}'")]
    UnknownPort(String),

    /// Two modules share a name
    #[error("duplicate module name '{0}'")]
    DuplicateModule(String),

    /// Media format cannot be used
    #[error("invalid media format on '{port}': {reason}")]
    InvalidFormat {
        /// Port label (`module:in0`, `module:out1`).
        port: String,
        /// Description of what is wrong.
        reason: String,
    },

    /// Invalid module parameter
    #[error("invalid parameter '{param}' for module '{module}': {reason}")]
    InvalidParameter {
        /// Module name.
        module: String,
        /// Parameter name.
        param: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// A port is left unconnected without being marked external
    #[error("port '{0}' is unconnected and not marked external")]
    Dangling(String),

    /// The engine rejected the topology
    #[error("failed to build topology: {0}")]
    Build(#[from] weir_core::EngineError),
}

impl ConfigError {
    /// Create a read file error.
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::ReadFile {
            path: path.into(),
            source,
        }
    }

    /// Create a write file error.
    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::WriteFile {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid format error.
    pub fn invalid_format(port: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidFormat {
            port: port.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid parameter error.
    pub fn invalid_param(
        module: impl Into<String>,
        param: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ConfigError::InvalidParameter {
            module: module.into(),
            param: param.into(),
            reason: reason.into(),
        }
    }
}
