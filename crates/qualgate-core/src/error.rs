//! Error types for the quality gate execution engine.

use thiserror::Error;

/// Errors produced while resolving `${{ scope.name }}` placeholders.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplaceError {
    /// No layer of the given scope contains the requested name.
    #[error("variable '{scope}.{name}' not found in any source")]
    NotFound { scope: String, name: String },

    /// A variable's value refers directly back to itself.
    #[error("self-reference detected for variable '{name}'")]
    SelfReference { name: String },

    /// A chain of variables refers back to an earlier member.
    #[error("circular reference detected for variable '{name}' (chain: {chain:?})")]
    CircularReference { name: String, chain: Vec<String> },

    /// A secret placeholder was found inside config file content.
    /// Config files may be persisted as evidence, so this is a hard error.
    #[error("secret '{name}' must not be used in config file '{file}'")]
    SecretInConfig { file: String, name: String },
}

/// Combined result of a batch substitution pass. Fields that resolved keep
/// their values; every failing placeholder contributes one entry here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("variable replacement failed: {}", errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
pub struct ReplaceBatchError {
    pub errors: Vec<ReplaceError>,
}

/// Errors produced while executing a single check.
///
/// These abort the one check they occur in, never sibling checks.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Creating a working directory failed.
    #[error("failed to create working directory {dir}: {source}")]
    WorkdirCreate {
        dir: String,
        #[source]
        source: std::io::Error,
    },

    /// A step declared a dependency whose output directory does not exist.
    /// The dependency either never ran or failed to produce output.
    #[error("step '{step}' depends on '{dependency}' but its output directory {dir} does not exist")]
    MissingDependencyDir {
        step: String,
        dependency: String,
        dir: String,
    },

    /// Generating a unique step id exhausted the disambiguation bound.
    #[error("could not generate a unique id for step '{title}' after {attempts} attempts")]
    StepIdExhausted { title: String, attempts: usize },

    /// A filesystem operation needed by the executor failed.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    /// Resolving a named config file to its content failed.
    #[error("failed to resolve config file '{name}': {reason}")]
    ConfigResolve { name: String, reason: String },

    /// Variable replacement inside config file content failed.
    #[error(transparent)]
    Replace(#[from] ReplaceBatchError),
}

/// Convenience result alias for executor-level operations.
pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;

/// Errors produced by the orchestrator's task groups.
#[derive(Debug, Error)]
pub enum RunError {
    /// One or more tasks in the given group failed; the whole group
    /// contributes no results.
    #[error("{group} check group failed: {message}")]
    TaskGroup { group: &'static str, message: String },

    /// A spawned check task panicked or was cancelled.
    #[error("check task join failure: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error_displays_scope_and_name() {
        let err = ReplaceError::NotFound {
            scope: "env".to_string(),
            name: "FOO".to_string(),
        };
        assert!(err.to_string().contains("env.FOO"));
    }

    #[test]
    fn test_circular_reference_displays_chain() {
        let err = ReplaceError::CircularReference {
            name: "env.FOO".to_string(),
            chain: vec!["env.FOO".to_string(), "env.BAR".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("env.FOO"));
        assert!(msg.contains("env.BAR"));
    }

    #[test]
    fn test_batch_error_joins_all_entries() {
        let err = ReplaceBatchError {
            errors: vec![
                ReplaceError::NotFound {
                    scope: "vars".to_string(),
                    name: "A".to_string(),
                },
                ReplaceError::SelfReference {
                    name: "env.B".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("vars.A"));
        assert!(msg.contains("env.B"));
        assert!(msg.contains("; "));
    }

    #[test]
    fn test_missing_dependency_dir_names_both_steps() {
        let err = ExecutionError::MissingDependencyDir {
            step: "echo".to_string(),
            dependency: "write".to_string(),
            dir: "/tmp/steps/write/files".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'echo'"));
        assert!(msg.contains("'write'"));
    }
}
