//! Error taxonomy for the pipeline
//!
//! Fatal errors bubble straight to `main`, which maps them to the exit
//! codes wrapper scripts depend on: 1 for usage/configuration errors,
//! 2 for malformed input data, 3 for configuration-value resolution
//! failures. Recoverable errors (bad log lines, unreachable synonym
//! directory) are handled where they are detected and never reach here.

use thiserror::Error;

/// Configuration errors: bad rule files, unknown rules or options,
/// template and alias cycles. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot open rule file {path}{}", format_chain(.chain))]
    FileNotFound { path: String, chain: Vec<String> },

    #[error("circular template inclusion: {}", .chain.join(" -> "))]
    CircularInclude { chain: Vec<String> },

    #[error("circular alias expansion: {}", .chain.join(" -> "))]
    CircularAlias { chain: Vec<String> },

    #[error("{file}:{line}: {reason}")]
    Syntax {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("incorrect option {rule}.{option} in file {file}")]
    UnknownOption {
        file: String,
        rule: String,
        option: String,
    },

    #[error("unknown rule {rule} in file {file}")]
    UnknownRule { file: String, rule: String },

    #[error("template rule in {file} must hold exactly one `files` option")]
    BadTemplate { file: String },

    #[error("invalid value for {rule}.{option}: {reason}")]
    InvalidValue {
        rule: String,
        option: String,
        reason: String,
    },

    #[error("watermark store {path} not found and creation is disabled")]
    StoreMissing { path: String },

    #[error("no producer registered for rule {rule}")]
    UnknownProducer { rule: String },
}

fn format_chain(chain: &[String]) -> String {
    if chain.is_empty() {
        String::new()
    } else {
        format!(" (included from {})", chain.join(" -> "))
    }
}

/// Configuration-value resolution errors: an option missing from a
/// rule's whole ancestor chain, or a failed `%(name)s` substitution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no value for option {option} in rule {rule} or any ancestor")]
    MissingProperty { rule: String, option: String },

    #[error("incorrect reference to %({name})s in {rule}.{option}")]
    BadReference {
        rule: String,
        option: String,
        name: String,
    },

    #[error("interpolation depth exceeded in {rule}.{option}")]
    DepthExceeded { rule: String, option: String },
}

/// Malformed input data. A bad log line is recoverable and handled at
/// the producer; these variants are the fatal shape violations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("event missing required field `{field}`")]
    IncompleteEvent { field: &'static str },

    #[error("malformed entry in {file}: {line}")]
    MalformedStore { file: String, line: String },
}

/// Sink write or commit failures. Always fatal; the relational sink
/// rolls its open transaction back before the process terminates.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot open sink destination {dest}: {source}")]
    Open {
        dest: String,
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// External synonym-directory failures. Never fatal: callers degrade to
/// "no synonyms known" and proceed.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("directory {path} unreachable: {reason}")]
    Unreachable { path: String, reason: String },
}

/// Top-level error for the whole pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Usage(String),
}

impl PipelineError {
    /// Process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Usage(_)
            | PipelineError::Config(_)
            | PipelineError::Sink(_)
            | PipelineError::Io(_) => 1,
            PipelineError::Data(_) => 2,
            PipelineError::Resolve(_) => 3,
        }
    }
}

/// Result type used across the pipeline.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_classes() {
        let config = PipelineError::from(ConfigError::UnknownRule {
            file: "a.cfg".into(),
            rule: "nope".into(),
        });
        assert_eq!(config.exit_code(), 1);

        let data = PipelineError::from(DataError::IncompleteEvent { field: "name" });
        assert_eq!(data.exit_code(), 2);

        let resolve = PipelineError::from(ResolveError::MissingProperty {
            rule: "shell_history".into(),
            option: "files".into(),
        });
        assert_eq!(resolve.exit_code(), 3);
    }

    #[test]
    fn test_circular_include_reports_chain() {
        let err = ConfigError::CircularInclude {
            chain: vec!["a.cfg".into(), "b.cfg".into(), "a.cfg".into()],
        };
        assert_eq!(
            err.to_string(),
            "circular template inclusion: a.cfg -> b.cfg -> a.cfg"
        );
    }
}
