//! # Batched Conversation Engine
//!
//! A module for advancing many independent conversations through a shared
//! model with single batched forward passes.
//!
//! ## Overview
//!
//! Autoregressive generation produces tokens one forward pass at a time, and
//! a forward pass costs roughly the same whether it advances one sequence or
//! many. The engine exploits this: every conversation that has appended
//! tokens since the last pass is collected into one batch, advanced together,
//! and left with a fresh next-token distribution.
//!
//! ## Key Components
//!
//! * [`BatchedEngine`] - Owns the shared model and the slot table of
//!   registered conversations; the only component that runs forward passes
//! * [`Conversation`] - One independent dialogue thread: ordered token
//!   history, pending appends, and the distribution left by the last step
//!
//! ## Stepping Discipline
//!
//! Exactly one forward pass is in flight at a time. [`BatchedEngine::step`]
//! snapshots every slot with pending tokens, runs the pass, then commits the
//! consumed tokens into each slot's history alongside its new distribution.
//! A step with nothing pending is a no-op. Conversations registered while a
//! pass is in flight simply wait for the next one.
//!
//! ## Persistence
//!
//! A conversation's transcript can be saved to, and restored from, a
//! versioned binary blob keyed by the model fingerprint, so state survives
//! process restarts but never silently crosses incompatible models.

mod batched;
mod conversation;

pub use batched::BatchedEngine;
pub use conversation::Conversation;
