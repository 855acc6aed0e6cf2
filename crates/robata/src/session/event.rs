use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The outcome of one generation turn.
///
/// Exactly one event is emitted per submitted prompt, after the turn has
/// run to completion, failed, or been cancelled. Text that decoded before
/// an abnormal end is carried in `partial` rather than discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The turn reached a stop condition. `text` is the full reply, with
    /// any stop marker and everything after it removed.
    Output { conversation: Uuid, text: String },

    /// The turn aborted mid-generation.
    Failed {
        conversation: Uuid,
        error: String,
        partial: String,
    },

    /// The turn was cancelled before reaching a stop condition.
    Cancelled { conversation: Uuid, partial: String },
}

/// An asynchronous stream of [`TurnEvent`]s.
///
/// Wraps a Tokio unbounded channel receiver in the `futures` [`Stream`]
/// interface so callers can consume turn outcomes with stream combinators.
/// The stream ends (`None`) when every sender is dropped, which happens
/// when the session that produced it is torn down.
pub struct EventStream {
    /// The underlying channel receiver
    receiver: mpsc::UnboundedReceiver<TurnEvent>,
}

impl EventStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<TurnEvent>) -> Self {
        Self { receiver }
    }
}

impl Stream for EventStream {
    type Item = TurnEvent;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}
