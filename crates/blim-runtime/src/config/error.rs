//! Errors raised while loading configuration.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed TOML in {}: {source}", path.display())]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("environment variable {name}: {message}")]
    InvalidEnvVar { name: String, message: String },

    /// A value parsed but is outside its legal range.
    #[error("{field} {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn read_file(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn parse_toml(path: &std::path::Path, source: toml::de::Error) -> Self {
        Self::ParseToml {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn invalid_env_var(name: &str, message: impl Into<String>) -> Self {
        Self::InvalidEnvVar {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_value(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }

    /// The file the error came from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::ReadFile { path, .. } | Self::ParseToml { path, .. } => Some(path),
            Self::InvalidEnvVar { .. } | Self::InvalidValue { .. } => None,
        }
    }
}
