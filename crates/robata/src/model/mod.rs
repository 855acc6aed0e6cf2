//! # Model Seam
//!
//! This module provides the interface between the batching/session machinery
//! and the numeric inference backend, allowing the orchestration logic to
//! remain independent of how the model is actually executed.
//!
//! The backend is treated as a black box exposing three primitives: tokenize
//! text into ids, render an id back into bytes, and run one batched forward
//! pass producing a next-token distribution per sequence. Weight loading and
//! the numeric kernels live entirely behind [`LanguageModel`].

use async_trait::async_trait;

use crate::error::Result;

#[cfg(test)]
pub(crate) mod mock;

/// Identifier of a single token in the model's vocabulary.
pub type TokenId = u32;

/// The model's next-token distribution for one sequence: raw unnormalized
/// logits over the vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDistribution {
    logits: Vec<f32>,
}

impl TokenDistribution {
    /// Wraps raw logits produced by a forward pass.
    pub fn new(logits: Vec<f32>) -> Self {
        Self { logits }
    }

    /// The raw logits, indexed by token id.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Number of entries (the vocabulary size the model reported).
    pub fn len(&self) -> usize {
        self.logits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logits.is_empty()
    }

    /// The highest-scoring token id. Ties resolve to the lowest id.
    pub fn argmax(&self) -> TokenId {
        let mut best = 0usize;
        for (idx, logit) in self.logits.iter().enumerate() {
            if *logit > self.logits[best] {
                best = idx;
            }
        }
        best as TokenId
    }
}

/// # LanguageModel
///
/// The interface any inference backend must satisfy to drive conversations.
///
/// ## Input/Output Shape
///
/// `forward` receives one full token context per batched sequence and must
/// return exactly one [`TokenDistribution`] per sequence, in order. The
/// batching engine owns slot bookkeeping; implementations only compute.
///
/// ## Async Behavior
///
/// `forward` is the single genuinely expensive operation in the system and is
/// asynchronous so a long model step never blocks the executor. All other
/// methods are cheap lookups and stay synchronous.
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Splits text into the model's token ids.
    fn tokenize(&self, text: &str) -> Vec<TokenId>;

    /// The raw bytes a token renders to. Byte sequences may end mid-character;
    /// callers must reassemble text through a [`crate::decoder::TokenDecoder`].
    fn token_bytes(&self, token: TokenId) -> Vec<u8>;

    /// Size of the vocabulary.
    fn vocab_size(&self) -> usize;

    /// A stable fingerprint of the loaded weights, embedded in saved
    /// conversation state so restores across incompatible models fail loudly.
    fn fingerprint(&self) -> u64;

    /// Runs one forward pass over a batch of full token contexts, returning
    /// the next-token distribution for each sequence in order.
    async fn forward(&self, batch: &[Vec<TokenId>]) -> Result<Vec<TokenDistribution>>;
}

/// Precomputed id-to-bytes table for the whole vocabulary.
///
/// Built once per loaded model and shared by the decoder and the
/// grammar-constrained sampler, both of which look up token bytes on every
/// generated token.
#[derive(Debug)]
pub struct TokenTable {
    bytes: Vec<Vec<u8>>,
}

impl TokenTable {
    /// Materializes the table from a model's vocabulary.
    pub fn from_model<M: LanguageModel>(model: &M) -> Self {
        let bytes = (0..model.vocab_size())
            .map(|id| model.token_bytes(id as TokenId))
            .collect();
        Self { bytes }
    }

    /// The bytes for a token id. Out-of-vocabulary ids render to nothing.
    pub fn bytes(&self, token: TokenId) -> &[u8] {
        self.bytes
            .get(token as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of tokens in the table.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockModel;
    use super::*;

    #[test]
    fn argmax_returns_highest_scoring_token() {
        let dist = TokenDistribution::new(vec![0.1, 3.0, -2.0, 1.5]);
        assert_eq!(dist.argmax(), 1);
    }

    #[test]
    fn argmax_resolves_ties_to_lowest_id() {
        let dist = TokenDistribution::new(vec![1.0, 1.0, 1.0]);
        assert_eq!(dist.argmax(), 0);
    }

    #[test]
    fn token_table_covers_vocabulary() {
        let model = MockModel::echo();
        let table = TokenTable::from_model(&model);
        assert_eq!(table.len(), model.vocab_size());
        assert_eq!(table.bytes(b'a' as TokenId), b"a");
        // past-the-end lookups render to nothing
        assert!(table.bytes(100_000).is_empty());
    }
}
