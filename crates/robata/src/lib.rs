//! # Robata
//!
//! Conversational session management over **batched** autoregressive inference.
//!
//! ## Overview
//!
//! This library turns a stream of user prompts into a stream of generated text
//! by maintaining long-lived conversation contexts and feeding them through a
//! shared batched inference engine. A single forward pass of the model advances
//! every conversation that has pending tokens, amortizing the cost of a model
//! step across all active dialogues.
//!
//! Key components include:
//!
//! - A model abstraction treating tokenization and the forward pass as a black box
//! - A batched engine that steps many conversations together
//! - Configurable sampling, including grammar-constrained structured output
//! - Incremental token decoding that never emits partial characters
//! - Durable save/restore of conversation state across process restarts
//!
//! ## Architecture
//!
//! ### Assumptions
//!
//! Robata reserves two structural meanings regardless of the model behind it:
//!  - A conversation's token history is strictly ordered; appends happen before
//!    sampling, and sampling happens before the next append
//!  - Exactly one forward pass is in flight at a time; every conversation with
//!    pending tokens at that moment is advanced by the same pass
//!
//! ### The model seam
//!
//! The [`model::LanguageModel`] trait defines the interface any inference
//! backend must satisfy: tokenize, per-token byte lookup, and one batched
//! forward pass producing a next-token distribution per sequence. The session
//! and engine logic stay independent of the numeric implementation.
//!
//! ### Sessions and turns
//!
//! [`session::InferenceSession`] drives one user turn at a time through the
//! engine: append the prompt, step, sample, decode, check stop conditions.
//! Turn results are published on an event stream the presentation layer
//! subscribes to. [`agent::Agent`] ties the pieces together into the
//! application-facing surface: model loading, prompt submission, conversation
//! persistence, and awaited teardown.
//!
//! ## Implementation Details
//!
//! Conversations register into slots of the shared engine. When a turn appends
//! tokens, the slot is marked as awaiting inference; the next engine step
//! consumes every awaiting slot in one batch and leaves a fresh next-token
//! distribution behind for each. Completed or released conversations free
//! their slot for waiting sessions.

pub mod agent;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod model;
pub mod persist;
pub mod sampling;
pub mod session;

pub use agent::Agent;
pub use config::{InferenceConfig, ModelConfig};
pub use decoder::TokenDecoder;
pub use engine::{BatchedEngine, Conversation};
pub use error::{Error, Result};
pub use model::{LanguageModel, TokenDistribution, TokenId, TokenTable};
pub use sampling::grammar::{Grammar, GrammarState};
pub use sampling::{GrammarSampler, SamplingPolicy, TemperatureSampler};
pub use session::{EventStream, InferenceSession, Phase, TurnEvent};
