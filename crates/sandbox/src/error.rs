//! Sandbox error types.

use thiserror::Error;

/// A script failed to parse.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("SyntaxError: {message} (line {line})")]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
}

impl SyntaxError {
    pub(crate) fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

/// A tool call made from a script failed.
///
/// The message is surfaced to the script verbatim as the thrown error's
/// `message`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct ToolCallError(pub String);

pub type Result<T> = std::result::Result<T, SyntaxError>;
