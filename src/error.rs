//! Error taxonomy and the single-run outcome.

use std::fmt;
use thiserror::Error;

/// Misuse of the loop API. Always fatal for the enclosing test.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("addDone: Duplicate done() tag '{0}'")]
    DuplicateTag(String),
    #[error("Unknown done() tag '{0}'")]
    UnknownTag(String),
    #[error("error() for a tagged done() item called, but the tag is empty")]
    EmptyTag,
    #[error("untagged done()/error() called, but there is no default done() item")]
    NoDefaultDone,
    #[error("Nothing to run: not even a single function call has been scheduled")]
    NothingToRun,
    #[error("LoopHandle used from inside a running loop call; use the call's LoopCtx")]
    HandleOnLoopThread,
}

/// A condition the harness exists to detect. Recorded, not propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("Timeout")]
    Timeout,
    #[error("done() already resolved, can't resolve again")]
    AlreadyResolved,
    #[error("Did not resolve in expected order. Expected: {expected}, actual: {actual}")]
    OutOfOrder { expected: u32, actual: u32 },
    /// Raised by user code through `fail()`.
    #[error("{0}")]
    Explicit(String),
    /// A callback bailed out, e.g. through `check!`.
    #[error("{0}")]
    Bailout(String),
}

/// Error returned by a scheduled call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("{0}")]
    Bailout(String),
}

/// Result type of every scheduled call and test body.
pub type CallResult = Result<(), CallError>;

/// Overall completion state of a loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Completion {
    #[default]
    NotComplete,
    Success,
    Error,
    Aborted,
}

impl Completion {
    pub fn is_terminal(self) -> bool {
        self != Completion::NotComplete
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Completion::NotComplete => "ASYNC_COMPLETE_NOT",
            Completion::Success => "ASYNC_COMPLETE_SUCCESS",
            Completion::Error => "ASYNC_COMPLETE_ERROR",
            Completion::Aborted => "ASYNC_COMPLETE_ABORTED",
        }
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished `run()` reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub completion: Completion,
    /// Formatted failure message; `done('<tag>'): <failure>` when tagged.
    pub error: Option<String>,
    /// Marker implicated in the failure, if any.
    pub error_tag: Option<String>,
    pub failure: Option<Failure>,
    pub elapsed_ms: i64,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.completion == Completion::Success
    }

    pub fn is_error(&self) -> bool {
        self.completion == Completion::Error
    }

    pub fn is_aborted(&self) -> bool {
        self.completion == Completion::Aborted
    }
}

/// Format a failure the way it is reported for a tag.
pub(crate) fn format_failure(tag: Option<&str>, failure: &Failure) -> String {
    match tag {
        Some(tag) => format!("done('{}'): {}", tag, failure),
        None => failure.to_string(),
    }
}
