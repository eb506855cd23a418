//! Errors raised while assembling a pipeline configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Position of a `config.toml` file in the loading order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// `~/.metflow/config.toml`
    Global,
    /// `<workspace>/.metflow/config.toml`
    Workspace,
    /// A file passed with `--config`
    Explicit,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Global => "global",
            Self::Workspace => "workspace",
            Self::Explicit => "explicit",
        })
    }
}

/// Top-level table of a pipeline `config.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Memory,
    Scheduler,
    Reader,
    Logging,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Scheduler => "scheduler",
            Self::Reader => "reader",
            Self::Logging => "logging",
        })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {layer} config {}: {source}", .path.display())]
    Unreadable {
        layer: Layer,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bad TOML, or a value of the wrong type for its key
    #[error("{layer} config {} is malformed: {source}", .path.display())]
    Malformed {
        layer: Layer,
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The layers parse on their own but not once merged
    #[error("merged configuration is malformed: {0}")]
    Merged(#[source] toml::de::Error),

    #[error("cannot write {}: {source}", .path.display())]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot render configuration as TOML: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("no home directory to hold ~/.metflow")]
    NoHomeDir,

    /// A setting that parses but cannot drive a pipeline
    #[error("[{section}] {field}: {message}")]
    Invalid {
        section: Section,
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: Section,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::Invalid {
            section,
            field,
            message: message.into(),
        }
    }

    /// Section of the rejected setting, for validation failures.
    pub fn section(&self) -> Option<Section> {
        match self {
            Self::Invalid { section, .. } => Some(*section),
            _ => None,
        }
    }

    /// File the error was raised for, if it concerns a single file.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Unreadable { path, .. }
            | Self::Malformed { path, .. }
            | Self::Unwritable { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_invalid_setting_names_section_and_field() {
        let err = ConfigError::invalid(Section::Memory, "budget_mb", "must be greater than zero");

        assert_eq!(err.to_string(), "[memory] budget_mb: must be greater than zero");
        assert_eq!(err.section(), Some(Section::Memory));
        assert_eq!(err.path(), None);
    }

    #[test]
    fn test_unreadable_names_layer_and_path() {
        let err = ConfigError::Unreadable {
            layer: Layer::Workspace,
            path: PathBuf::from("/srv/run/.metflow/config.toml"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };

        assert_eq!(
            err.to_string(),
            "cannot read workspace config /srv/run/.metflow/config.toml: denied"
        );
        assert_eq!(err.path(), Some(Path::new("/srv/run/.metflow/config.toml")));
        assert_eq!(err.section(), None);
    }
}
