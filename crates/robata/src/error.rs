//! Error types for robata operations.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for robata operations.
///
/// Engine-level failures abort only the current turn, never the whole
/// session: a conversation can still accept new prompts after a failed turn,
/// with the exception of [`Error::EngineNotReady`] which requires the caller
/// to load a model first.
#[derive(Error, Debug)]
pub enum Error {
    /// No model has been loaded into the engine yet.
    #[error("no model loaded; load a model before submitting prompts")]
    EngineNotReady,

    /// Every batch slot is occupied by a registered conversation.
    #[error("batch capacity of {capacity} conversations exceeded")]
    EngineCapacityExceeded { capacity: usize },

    /// A distribution was requested before a forward pass consumed the
    /// conversation's most recent appended tokens. Correct orchestration
    /// never triggers this; it indicates a contract violation.
    #[error("conversation has pending tokens no forward pass has consumed yet")]
    NotYetInferred,

    /// The active grammar admits no continuation from the current state.
    #[error("grammar permits no valid continuation")]
    GrammarViolation,

    /// A turn is already generating on this conversation.
    #[error("a turn is already in flight for this conversation")]
    SessionBusy,

    /// The named saved-conversation file does not exist.
    #[error("saved conversation not found: {0}")]
    FileNotFound(PathBuf),

    /// The saved-state blob is truncated, malformed, or was written by an
    /// incompatible engine version or a different model.
    #[error("saved conversation state is corrupt or incompatible: {0}")]
    CorruptState(String),

    /// The grammar definition failed to parse.
    #[error("grammar parse error: {0}")]
    Grammar(String),

    /// The model backend failed during a forward pass.
    #[error("inference error: {0}")]
    Inference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
