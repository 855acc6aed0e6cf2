//! # Agent
//!
//! Application-facing facade tying a model, an engine, and a session
//! together behind a small lifecycle API.
//!
//! ## Overview
//!
//! An [`Agent`] starts empty. [`Agent::load_model`] brings up a
//! [`BatchedEngine`] over the supplied model, compiles the configured
//! grammar (if any), and opens a session with a fresh conversation. From
//! then on prompts are submitted fire-and-forget and outcomes arrive on the
//! [`EventStream`] handed out at construction. Conversations can be saved
//! to and restored from a state directory between runs, and
//! [`Agent::dispose`] tears everything down, waiting for any in-flight turn
//! to stop first.
//!
//! ## Grammar fallback
//!
//! A configured grammar that cannot be read or parsed is logged and
//! ignored; generation proceeds unconstrained rather than failing model
//! load.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{InferenceConfig, ModelConfig};
use crate::engine::BatchedEngine;
use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::persist;
use crate::sampling::grammar::Grammar;
use crate::session::{EventStream, InferenceSession, TurnEvent};

/// A conversational agent over one model.
pub struct Agent<M: LanguageModel> {
    engine: Option<Arc<BatchedEngine<M>>>,
    session: Option<InferenceSession<M>>,
    grammar: Option<Arc<Grammar>>,
    config: InferenceConfig,
    context_length: usize,
    conversations_dir: PathBuf,
    events: mpsc::UnboundedSender<TurnEvent>,
}

impl<M: LanguageModel> Agent<M> {
    /// Creates an agent with no model loaded. Saved conversations live
    /// under `conversations_dir`. The returned stream yields one
    /// [`TurnEvent`] per submitted prompt, across model reloads.
    pub fn new(conversations_dir: impl Into<PathBuf>) -> (Self, EventStream) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                engine: None,
                session: None,
                grammar: None,
                config: InferenceConfig::default(),
                context_length: 0,
                conversations_dir: conversations_dir.into(),
                events,
            },
            EventStream::new(receiver),
        )
    }

    /// Whether a model is loaded and prompts can be submitted.
    pub fn is_ready(&self) -> bool {
        self.session.is_some()
    }

    /// Brings up an engine over `model` and opens a session with a fresh
    /// conversation. Replaces any previously loaded model.
    pub fn load_model(
        &mut self,
        model: M,
        model_config: &ModelConfig,
        config: InferenceConfig,
    ) -> Result<()> {
        let engine = Arc::new(BatchedEngine::new(model, model_config.batch_capacity));
        let grammar = load_grammar(&config);
        let conversation = engine.create_conversation()?;
        let session = InferenceSession::new(
            engine.clone(),
            conversation,
            config.clone(),
            grammar.clone(),
            self.events.clone(),
        );
        info!(
            model = %model_config.model_path.display(),
            batch_capacity = model_config.batch_capacity,
            constrained = grammar.is_some(),
            "model loaded"
        );
        self.engine = Some(engine);
        self.session = Some(session);
        self.grammar = grammar;
        self.config = config;
        self.context_length = model_config.context_length;
        Ok(())
    }

    /// Starts a generation turn for `prompt`. The outcome arrives on the
    /// event stream.
    pub fn submit_prompt(&mut self, prompt: &str) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::EngineNotReady)?;
        if session.conversation().token_count() >= self.context_length {
            return Err(Error::Inference("context window exhausted".into()));
        }
        session.submit(prompt)
    }

    /// Requests the in-flight turn (if any) stop at its next step boundary.
    pub fn cancel(&self) {
        if let Some(session) = &self.session {
            session.cancel();
        }
    }

    /// Waits for the in-flight turn (if any) to finish.
    pub async fn wait(&mut self) {
        if let Some(session) = &mut self.session {
            session.wait().await;
        }
    }

    /// Discards the current conversation and starts an empty one.
    pub fn reset_conversation(&mut self) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(Error::EngineNotReady)?.clone();
        if self.session.as_ref().is_some_and(|s| s.is_busy()) {
            return Err(Error::SessionBusy);
        }
        // Release the current slot before allocating the replacement, so the
        // swap works with the engine at capacity.
        self.session = None;
        let conversation = engine.create_conversation()?;
        self.session = Some(InferenceSession::new(
            engine,
            conversation,
            self.config.clone(),
            self.grammar.clone(),
            self.events.clone(),
        ));
        Ok(())
    }

    /// Saves the current conversation under `name` in the state directory.
    pub fn save_conversation(&self, name: &str) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(Error::EngineNotReady)?;
        let session = self.session.as_ref().ok_or(Error::EngineNotReady)?;
        let path = persist::state_path(&self.conversations_dir, name);
        engine.save_conversation(session.conversation(), &path)
    }

    /// Replaces the current conversation with one restored from `name`.
    ///
    /// The restored history becomes the new session's context; the first
    /// prompt after loading continues from where it left off.
    pub fn load_conversation(&mut self, name: &str) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(Error::EngineNotReady)?.clone();
        if self.session.as_ref().is_some_and(|s| s.is_busy()) {
            return Err(Error::SessionBusy);
        }
        let path = persist::state_path(&self.conversations_dir, name);
        let tokens = persist::read_state(&path, engine.model().fingerprint())?;
        // The blob is validated; only now release the current slot, so a bad
        // file leaves the agent unchanged while the swap still works with
        // the engine at capacity.
        self.session = None;
        let conversation = engine.restore_conversation(tokens)?;
        self.session = Some(InferenceSession::new(
            engine,
            conversation,
            self.config.clone(),
            self.grammar.clone(),
            self.events.clone(),
        ));
        Ok(())
    }

    /// Names of every saved conversation in the state directory.
    pub fn list_saved_conversations(&self) -> Result<Vec<String>> {
        persist::list_states(&self.conversations_dir)
    }

    /// Tears the agent down, cancelling any in-flight turn and waiting for
    /// it to stop before releasing the engine.
    pub async fn dispose(&mut self) {
        if let Some(session) = &mut self.session {
            session.cancel();
            session.wait().await;
        }
        self.session = None;
        self.engine = None;
        self.grammar = None;
        info!("agent disposed");
    }
}

/// Compiles the configured grammar, falling back to unconstrained sampling
/// when it cannot be read or parsed.
fn load_grammar(config: &InferenceConfig) -> Option<Arc<Grammar>> {
    let path = config.grammar_path.as_ref()?;
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) => {
            warn!(path = %path.display(), %error, "grammar file unreadable; sampling unconstrained");
            return None;
        }
    };
    match Grammar::parse(&text, "root") {
        Ok(grammar) => Some(Arc::new(grammar)),
        Err(error) => {
            warn!(path = %path.display(), %error, "grammar rejected; sampling unconstrained");
            None
        }
    }
}
