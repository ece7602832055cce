//! Common error types for the Kiln image builder.

use std::fmt;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Boxed error produced by an external tool (shell command, filesystem walk).
pub type ToolError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors across the Kiln build pipeline.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// Malformed build descriptor.
    #[error("Parse error on line {line}: {message}")]
    #[diagnostic(
        code(kiln::descriptor::parse),
        help("Each line holds one instruction; every stage starts with FROM")
    )]
    Parse {
        /// 1-based line number of the offending instruction.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// `COPY --from` names a stage that does not exist.
    #[error("Stage '{stage}' references unknown stage '{reference}'")]
    #[diagnostic(
        code(kiln::graph::unknown_stage),
        help("Reference a stage by its `AS` alias or by its zero-based index")
    )]
    UnknownStageReference {
        /// The stage containing the reference.
        stage: String,
        /// The unresolved reference.
        reference: String,
    },

    /// Stages depend on each other transitively.
    #[error("Circular dependency between stages: {}", stages.join(" -> "))]
    #[diagnostic(code(kiln::graph::cycle))]
    Cycle {
        /// Stages participating in the cycle.
        stages: Vec<String>,
    },

    /// `--target` does not name a stage.
    #[error("Unknown target stage: {target}")]
    #[diagnostic(code(kiln::graph::unknown_target))]
    UnknownTarget {
        /// The requested target.
        target: String,
    },

    /// An instruction failed while executing.
    #[error("Stage '{stage}' failed at `{instruction}`: {source}")]
    #[diagnostic(code(kiln::executor::instruction))]
    InstructionExecution {
        /// Stage name.
        stage: String,
        /// Canonical text of the failing instruction.
        instruction: String,
        /// Underlying tool failure.
        #[source]
        source: ToolError,
    },

    /// The final image lacks required metadata.
    #[error("Image is incomplete: missing {missing}")]
    #[diagnostic(
        code(kiln::packager::incomplete),
        help("Declare an ENTRYPOINT in the target stage or one of its base stages")
    )]
    IncompleteImage {
        /// The missing attribute.
        missing: String,
    },

    /// One or more stages did not complete.
    #[error("Build failed: {} stage(s) did not complete", failures.len())]
    #[diagnostic(code(kiln::build::failed))]
    BuildFailed {
        /// Every failed, skipped or cancelled stage.
        failures: Vec<StageFailure>,
    },

    /// The build was cancelled.
    #[error("Build cancelled")]
    #[diagnostic(code(kiln::build::cancelled))]
    Cancelled,

    /// Layer cache error.
    #[error("Cache error: {message}")]
    #[diagnostic(code(kiln::cache))]
    Cache {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kiln::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(kiln::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/kiln/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl KilnError {
    /// Shorthand for a [`KilnError::Parse`].
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Returns true for errors detected before any instruction runs.
    #[must_use]
    pub const fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::UnknownStageReference { .. }
                | Self::Cycle { .. }
                | Self::UnknownTarget { .. }
        )
    }
}

/// A stage that did not reach completion.
#[derive(Debug, Clone)]
pub struct StageFailure {
    /// Stage name.
    pub stage: String,
    /// Why it did not complete.
    pub cause: StageFailureCause,
}

/// Reason a stage did not complete.
#[derive(Debug, Clone)]
pub enum StageFailureCause {
    /// The stage itself failed.
    Failed(Arc<KilnError>),
    /// A stage it depends on did not complete.
    DependencyFailed {
        /// Name of the dependency.
        dependency: String,
    },
    /// The build was cancelled before the stage finished.
    Cancelled,
}

impl StageFailure {
    /// The stage failed with `error`.
    pub fn failed(stage: impl Into<String>, error: KilnError) -> Self {
        Self {
            stage: stage.into(),
            cause: StageFailureCause::Failed(Arc::new(error)),
        }
    }

    /// The stage was skipped because `dependency` did not complete.
    pub fn skipped(stage: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            cause: StageFailureCause::DependencyFailed {
                dependency: dependency.into(),
            },
        }
    }

    /// The stage was cancelled.
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            cause: StageFailureCause::Cancelled,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            StageFailureCause::Failed(err) => write!(f, "{}: {err}", self.stage),
            StageFailureCause::DependencyFailed { dependency } => {
                write!(f, "{}: skipped, dependency '{dependency}' failed", self.stage)
            }
            StageFailureCause::Cancelled => write!(f, "{}: cancelled", self.stage),
        }
    }
}
