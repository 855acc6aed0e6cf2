//! # Inference Session
//!
//! Drives complete generation turns against one [`Conversation`].
//!
//! ## Overview
//!
//! A session owns a conversation on a [`BatchedEngine`] and turns submitted
//! prompts into replies. Each turn runs the generate loop on a spawned task:
//! tokenize and queue the prompt, step the engine, sample a token, feed it
//! back, and repeat until a stop marker appears in the decoded output, the
//! token cap is hit, cancellation is requested, or something fails. The
//! outcome is delivered as a single [`TurnEvent`] on the session's event
//! channel.
//!
//! ## Stop conditions
//!
//! The decoded output is scanned after every token for the configured stop
//! markers. The reply is truncated at the start of the earliest marker, so
//! the marker itself never reaches the caller. Markers split across token
//! boundaries are still caught because the scan runs over the accumulated
//! text rather than individual tokens.
//!
//! ## Concurrency
//!
//! One turn at a time per session; submitting while a turn is in flight
//! fails with [`Error::SessionBusy`]. Multiple sessions over the same engine
//! are stepped together in a shared batch.

mod event;
mod worker;

pub use event::{EventStream, TurnEvent};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::InferenceConfig;
use crate::decoder::TokenDecoder;
use crate::engine::{BatchedEngine, Conversation};
use crate::error::{Error, Result};
use crate::model::{LanguageModel, TokenTable};
use crate::sampling::grammar::Grammar;
use crate::sampling::{GrammarSampler, SamplingPolicy, TemperatureSampler};
use worker::TurnHandle;

/// Where a session currently is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No turn in flight.
    Idle,
    /// A prompt is queued but its first inference has not completed.
    Prompting,
    /// Tokens are being generated.
    Generating,
    /// The last turn produced output.
    Completed,
    /// The last turn aborted with an error.
    Failed,
}

/// A conversational session over a batched engine.
pub struct InferenceSession<M: LanguageModel> {
    engine: Arc<BatchedEngine<M>>,
    conversation: Arc<Conversation>,
    config: InferenceConfig,
    grammar: Option<Arc<Grammar>>,
    table: Arc<TokenTable>,
    events: mpsc::UnboundedSender<TurnEvent>,
    phase: Arc<Mutex<Phase>>,
    turn: Option<TurnHandle>,
}

impl<M: LanguageModel> InferenceSession<M> {
    /// Creates a session over `conversation`. Turn outcomes are delivered on
    /// `events`; a grammar, when given, constrains every turn's output.
    pub fn new(
        engine: Arc<BatchedEngine<M>>,
        conversation: Conversation,
        config: InferenceConfig,
        grammar: Option<Arc<Grammar>>,
        events: mpsc::UnboundedSender<TurnEvent>,
    ) -> Self {
        let table = Arc::new(TokenTable::from_model(engine.model().as_ref()));
        Self {
            engine,
            conversation: Arc::new(conversation),
            config,
            grammar,
            table,
            events,
            phase: Arc::new(Mutex::new(Phase::Idle)),
            turn: None,
        }
    }

    /// The conversation this session drives.
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().expect("session phase lock poisoned")
    }

    /// Whether a turn is currently in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self.phase(), Phase::Prompting | Phase::Generating)
    }

    /// Starts a generation turn for `prompt` on a background task.
    ///
    /// Returns immediately; the outcome arrives as a [`TurnEvent`] on the
    /// event channel. Fails with [`Error::SessionBusy`] if the previous turn
    /// has not finished.
    pub fn submit(&mut self, prompt: &str) -> Result<()> {
        if self.is_busy() {
            return Err(Error::SessionBusy);
        }

        let policy: Box<dyn SamplingPolicy> = match &self.grammar {
            Some(grammar) => Box::new(GrammarSampler::new(
                grammar.clone(),
                self.table.clone(),
                self.config.temperature,
                self.config.repetition_penalty,
            )),
            None => Box::new(TemperatureSampler::new(
                self.config.temperature,
                self.config.repetition_penalty,
            )),
        };

        *self.phase.lock().expect("session phase lock poisoned") = Phase::Prompting;

        let engine = self.engine.clone();
        let conversation = self.conversation.clone();
        let config = self.config.clone();
        let decoder = TokenDecoder::new(self.table.clone());
        let events = self.events.clone();
        let phase = self.phase.clone();
        let prompt = prompt.to_owned();

        self.turn = Some(TurnHandle::spawn(move |cancelled| {
            tokio::spawn(async move {
                let event = run_turn(
                    engine,
                    conversation,
                    prompt,
                    config,
                    policy,
                    decoder,
                    cancelled,
                    phase.clone(),
                )
                .await;
                *phase.lock().expect("session phase lock poisoned") = match &event {
                    TurnEvent::Output { .. } => Phase::Completed,
                    TurnEvent::Cancelled { .. } => Phase::Idle,
                    TurnEvent::Failed { .. } => Phase::Failed,
                };
                let _ = events.send(event);
            })
        }));
        Ok(())
    }

    /// Requests the in-flight turn stop at its next step boundary.
    ///
    /// No-op when no turn is running. The turn emits a
    /// [`TurnEvent::Cancelled`] with whatever output had decoded.
    pub fn cancel(&self) {
        if let Some(turn) = &self.turn {
            turn.cancel();
        }
    }

    /// Waits for the in-flight turn (if any) to finish.
    pub async fn wait(&mut self) {
        if let Some(turn) = &mut self.turn {
            turn.join().await;
        }
        self.turn = None;
    }
}

/// One complete generation turn.
#[allow(clippy::too_many_arguments)]
async fn run_turn<M: LanguageModel>(
    engine: Arc<BatchedEngine<M>>,
    conversation: Arc<Conversation>,
    prompt: String,
    config: InferenceConfig,
    mut policy: Box<dyn SamplingPolicy>,
    mut decoder: TokenDecoder,
    cancelled: Arc<AtomicBool>,
    phase: Arc<Mutex<Phase>>,
) -> TurnEvent {
    let id = conversation.id();
    let tokens = engine.model().tokenize(&prompt);
    conversation.append_prompt(&tokens);
    debug!(conversation = %id, prompt_tokens = tokens.len(), "turn started");

    let mut produced = 0usize;
    let reply = loop {
        if cancelled.load(Ordering::SeqCst) {
            settle(&engine, &conversation).await;
            return TurnEvent::Cancelled {
                conversation: id,
                partial: decoder.flush(),
            };
        }

        if let Err(error) = engine.step().await {
            return TurnEvent::Failed {
                conversation: id,
                error: error.to_string(),
                partial: decoder.flush(),
            };
        }
        *phase.lock().expect("session phase lock poisoned") = Phase::Generating;

        let distribution = match conversation.distribution() {
            Ok(distribution) => distribution,
            Err(error) => {
                return TurnEvent::Failed {
                    conversation: id,
                    error: error.to_string(),
                    partial: decoder.flush(),
                };
            }
        };
        let token = match policy.sample(&distribution, &conversation.transcript()) {
            Ok(token) => token,
            Err(error) => {
                return TurnEvent::Failed {
                    conversation: id,
                    error: error.to_string(),
                    partial: decoder.flush(),
                };
            }
        };

        conversation.append_token(token);
        decoder.add(token);
        produced += 1;

        let text = decoder.read();
        if let Some(cut) = earliest_stop(&text, &config.anti_prompts) {
            break text[..cut].to_owned();
        }
        if produced >= config.max_tokens {
            break decoder.flush();
        }
    };

    settle(&engine, &conversation).await;
    debug!(conversation = %id, tokens = produced, "turn completed");
    TurnEvent::Output {
        conversation: id,
        text: reply,
    }
}

/// Runs the inference owed for the turn's final token so the conversation
/// is left with nothing queued. A failure here does not void the reply.
async fn settle<M: LanguageModel>(engine: &BatchedEngine<M>, conversation: &Conversation) {
    if conversation.awaiting_inference() {
        if let Err(error) = engine.step().await {
            warn!(conversation = %conversation.id(), %error, "final settling step failed");
        }
    }
}

/// Byte offset of the earliest stop-marker occurrence in `text`, if any.
fn earliest_stop(text: &str, anti_prompts: &[String]) -> Option<usize> {
    anti_prompts
        .iter()
        .filter_map(|marker| text.find(marker.as_str()))
        .min()
}
