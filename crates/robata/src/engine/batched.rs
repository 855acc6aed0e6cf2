use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use super::conversation::{Conversation, SlotState, SlotTable};
use crate::error::{Error, Result};
use crate::model::{LanguageModel, TokenId};
use crate::persist;

/// The shared batched-execution engine.
///
/// Owns the model and the slot table of registered conversations. All
/// registration and stepping flows through this single owned resource; there
/// is no ambient global context.
///
/// # Stepping
///
/// [`BatchedEngine::step`] performs exactly one forward pass advancing every
/// registered conversation with pending tokens. Steps are serialized through
/// an internal async mutex, so concurrent turns from different sessions
/// naturally coalesce: whichever turn steps first carries every pending
/// conversation with it, and the others find their distribution already
/// fresh.
pub struct BatchedEngine<M: LanguageModel> {
    model: Arc<M>,
    capacity: usize,
    slots: Arc<Mutex<SlotTable>>,
    /// Held across the forward pass; guarantees one step in flight at a time.
    step_gate: AsyncMutex<()>,
}

impl<M: LanguageModel> BatchedEngine<M> {
    /// Creates an engine around a loaded model with room for `capacity`
    /// concurrently registered conversations.
    pub fn new(model: M, capacity: usize) -> Self {
        debug!(capacity, "batched engine created");
        Self {
            model: Arc::new(model),
            capacity,
            slots: Arc::new(Mutex::new(Vec::new())),
            step_gate: AsyncMutex::new(()),
        }
    }

    /// The model this engine runs.
    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    /// Maximum number of concurrently registered conversations.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of conversations currently occupying batch slots.
    pub fn active_conversations(&self) -> usize {
        self.slots
            .lock()
            .expect("slot table lock poisoned")
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Registers a fresh conversation into a free batch slot.
    ///
    /// Fails with [`Error::EngineCapacityExceeded`] when every slot is taken.
    pub fn create_conversation(&self) -> Result<Conversation> {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        let occupied = slots.iter().filter(|slot| slot.is_some()).count();
        if occupied >= self.capacity {
            return Err(Error::EngineCapacityExceeded {
                capacity: self.capacity,
            });
        }
        let state = Arc::new(Mutex::new(SlotState::default()));
        let index = match slots.iter().position(|slot| slot.is_none()) {
            Some(free) => {
                slots[free] = Some(state.clone());
                free
            }
            None => {
                slots.push(Some(state.clone()));
                slots.len() - 1
            }
        };
        let conversation = Conversation::new(index, state, self.slots.clone());
        debug!(conversation = %conversation.id(), slot = index, "conversation registered");
        Ok(conversation)
    }

    /// Performs exactly one forward pass advancing every registered
    /// conversation with pending tokens.
    ///
    /// A step with nothing pending is a no-op returning success. On success
    /// every consumed slot's pending tokens move into its history, its
    /// awaiting flag clears, and a fresh distribution becomes available.
    pub async fn step(&self) -> Result<()> {
        let _gate = self.step_gate.lock().await;

        // Snapshot pending work without holding the table lock across the
        // forward pass. Appends arriving mid-pass stay queued for the next one.
        let work: Vec<(Arc<Mutex<SlotState>>, usize, Vec<TokenId>)> = {
            let slots = self.slots.lock().expect("slot table lock poisoned");
            slots
                .iter()
                .flatten()
                .filter_map(|slot| {
                    let state = slot.lock().expect("slot state lock poisoned");
                    if state.pending.is_empty() {
                        return None;
                    }
                    let mut context = state.history.clone();
                    context.extend_from_slice(&state.pending);
                    Some((slot.clone(), state.pending.len(), context))
                })
                .collect()
        };

        if work.is_empty() {
            trace!("step requested with no pending conversations; no-op");
            return Ok(());
        }

        let contexts: Vec<Vec<TokenId>> = work.iter().map(|(_, _, ctx)| ctx.clone()).collect();
        trace!(sequences = contexts.len(), "forward pass starting");
        let distributions = self.model.forward(&contexts).await?;
        if distributions.len() != work.len() {
            return Err(Error::Inference(format!(
                "model returned {} distributions for a batch of {}",
                distributions.len(),
                work.len()
            )));
        }

        for ((slot, consumed, _), distribution) in work.into_iter().zip(distributions) {
            let mut state = slot.lock().expect("slot state lock poisoned");
            let advanced: Vec<TokenId> = state.pending.drain(..consumed).collect();
            state.history.extend(advanced);
            state.distribution = Some(distribution);
            // Appends that raced in during the pass keep the flag raised.
            state.awaiting_inference = !state.pending.is_empty();
        }
        Ok(())
    }

    /// Serializes a conversation's transcript to a durable state blob.
    pub fn save_conversation(&self, conversation: &Conversation, path: &Path) -> Result<()> {
        persist::write_state(path, self.model.fingerprint(), &conversation.transcript())
    }

    /// Restores a saved conversation into a fresh batch slot.
    ///
    /// The blob is fully validated before any slot is allocated, so a corrupt
    /// or incompatible file leaves the engine unchanged.
    pub fn load_conversation(&self, path: &Path) -> Result<Conversation> {
        let tokens = persist::read_state(path, self.model.fingerprint())?;
        self.restore_conversation(tokens)
    }

    /// Registers a fresh conversation carrying an already-validated
    /// transcript. Callers replacing an existing conversation release it
    /// first, so the swap works with the engine at capacity.
    pub fn restore_conversation(&self, tokens: Vec<TokenId>) -> Result<Conversation> {
        let conversation = self.create_conversation()?;
        conversation.restore(tokens);
        debug!(conversation = %conversation.id(), tokens = conversation.token_count(),
               "conversation restored");
        Ok(conversation)
    }
}
