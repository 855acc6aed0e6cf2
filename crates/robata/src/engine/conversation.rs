use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{TokenDistribution, TokenId};

/// Per-slot state shared between a [`Conversation`] and the engine's step
/// loop. Guarded by a plain mutex: every critical section is a short queue
/// or flag mutation, never held across an await point.
#[derive(Debug, Default)]
pub(crate) struct SlotState {
    /// Tokens already consumed by a forward pass, in order.
    pub history: Vec<TokenId>,

    /// Tokens appended since the last forward pass.
    pub pending: Vec<TokenId>,

    /// True once tokens were appended and no pass has consumed them yet.
    pub awaiting_inference: bool,

    /// Distribution left by the step that last consumed this slot.
    pub distribution: Option<TokenDistribution>,
}

/// The engine's registry of conversation slots. Index = batch position.
pub(crate) type SlotTable = Vec<Option<Arc<Mutex<SlotState>>>>;

/// One independent dialogue thread registered with a [`crate::BatchedEngine`].
///
/// A conversation owns its ordered token history and a queue of pending
/// appends. It must not be sampled from until at least one engine step has
/// run after its most recent append; until then [`Conversation::distribution`]
/// fails with [`Error::NotYetInferred`].
///
/// The slot is released back to the engine when the conversation is dropped.
#[derive(Debug)]
pub struct Conversation {
    id: Uuid,
    index: usize,
    state: Arc<Mutex<SlotState>>,
    slots: Arc<Mutex<SlotTable>>,
}

impl Conversation {
    pub(crate) fn new(
        index: usize,
        state: Arc<Mutex<SlotState>>,
        slots: Arc<Mutex<SlotTable>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            state,
            slots,
        }
    }

    /// Unique identifier of this conversation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().expect("slot state lock poisoned")
    }

    /// Enqueues prompt tokens for the next engine step.
    ///
    /// Empty prompts are ignored; an append with no tokens would mark the
    /// slot as awaiting a pass that can never consume it.
    pub fn append_prompt(&self, tokens: &[TokenId]) {
        if tokens.is_empty() {
            return;
        }
        let mut state = self.state();
        state.pending.extend_from_slice(tokens);
        state.awaiting_inference = true;
        trace!(conversation = %self.id, count = tokens.len(), "prompt tokens appended");
    }

    /// Enqueues a single sampled token fed back as new context.
    pub fn append_token(&self, token: TokenId) {
        let mut state = self.state();
        state.pending.push(token);
        state.awaiting_inference = true;
    }

    /// The next-token distribution left by the last step that consumed this
    /// conversation's pending tokens.
    ///
    /// Fails with [`Error::NotYetInferred`] if tokens were appended since, or
    /// if no step has ever consumed this slot.
    pub fn distribution(&self) -> Result<TokenDistribution> {
        let state = self.state();
        if state.awaiting_inference {
            return Err(Error::NotYetInferred);
        }
        state.distribution.clone().ok_or(Error::NotYetInferred)
    }

    /// Whether appended tokens still await a forward pass.
    pub fn awaiting_inference(&self) -> bool {
        self.state().awaiting_inference
    }

    /// Full transcript in order: consumed history followed by pending
    /// appends. This is what persistence snapshots.
    pub fn transcript(&self) -> Vec<TokenId> {
        let state = self.state();
        let mut tokens = state.history.clone();
        tokens.extend_from_slice(&state.pending);
        tokens
    }

    /// Number of tokens in the transcript.
    pub fn token_count(&self) -> usize {
        let state = self.state();
        state.history.len() + state.pending.len()
    }

    /// Replaces this conversation's state with a restored transcript. The
    /// tokens land in history with no distribution: a restored conversation
    /// must be prompted and stepped before it can be sampled.
    pub(crate) fn restore(&self, tokens: Vec<TokenId>) {
        let mut state = self.state();
        state.history = tokens;
        state.pending.clear();
        state.awaiting_inference = false;
        state.distribution = None;
    }
}

impl Drop for Conversation {
    /// Releases the batch slot so a waiting session can register.
    fn drop(&mut self) {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        if let Some(slot) = slots.get_mut(self.index) {
            *slot = None;
        }
        trace!(conversation = %self.id, slot = self.index, "conversation released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standalone() -> (Conversation, Arc<Mutex<SlotTable>>) {
        let state = Arc::new(Mutex::new(SlotState::default()));
        let slots: Arc<Mutex<SlotTable>> = Arc::new(Mutex::new(vec![Some(state.clone())]));
        (Conversation::new(0, state, slots.clone()), slots)
    }

    #[test]
    fn appends_are_pending_until_a_step_consumes_them() {
        let (conversation, _slots) = standalone();
        conversation.append_prompt(&[1, 2, 3]);
        assert!(conversation.awaiting_inference());
        assert!(matches!(
            conversation.distribution(),
            Err(Error::NotYetInferred)
        ));
        assert_eq!(conversation.transcript(), vec![1, 2, 3]);
    }

    #[test]
    fn empty_prompt_does_not_mark_awaiting() {
        let (conversation, _slots) = standalone();
        conversation.append_prompt(&[]);
        assert!(!conversation.awaiting_inference());
    }

    #[test]
    fn transcript_orders_history_before_pending() {
        let (conversation, _slots) = standalone();
        conversation.restore(vec![10, 11]);
        conversation.append_token(12);
        assert_eq!(conversation.transcript(), vec![10, 11, 12]);
        assert_eq!(conversation.token_count(), 3);
    }

    #[test]
    fn restore_clears_distribution() {
        let (conversation, _slots) = standalone();
        {
            let mut state = conversation.state();
            state.distribution = Some(TokenDistribution::new(vec![0.0]));
        }
        conversation.restore(vec![1]);
        assert!(matches!(
            conversation.distribution(),
            Err(Error::NotYetInferred)
        ));
    }

    #[test]
    fn drop_releases_the_slot() {
        let (conversation, slots) = standalone();
        drop(conversation);
        assert!(slots.lock().unwrap()[0].is_none());
    }
}
