use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading agent configs or validating template attributes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read agent config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse agent config: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("invalid attributes for template `{template}`: {source}")]
    Attributes {
        template: String,
        source: serde_yaml::Error,
    },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown template class `{0}`")]
    UnknownClass(String),

    #[error("duplicate template name `{0}`")]
    DuplicateTemplate(String),

    #[error("template `{template}` reads from unknown template `{input}`")]
    UnknownInput { template: String, input: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
