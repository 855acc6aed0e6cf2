use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{LanguageModel, TokenDistribution, TokenId};
use crate::error::{Error, Result};

/// A deterministic byte-level model for testing.
///
/// The vocabulary is the 256 byte values; tokenization is the UTF-8 bytes of
/// the input text. The next token for a sequence is a pure function of its
/// context length: position `L` of the script, falling back to a fixed filler
/// token once the script runs out. This makes generated output fully
/// predictable from the prompt length alone.
pub(crate) struct MockModel {
    /// Next token indexed by absolute context length.
    script: Vec<TokenId>,
    /// Emitted once the script is exhausted.
    filler: TokenId,
    fingerprint: u64,
    fail_next: AtomicBool,
    forward_calls: AtomicUsize,
}

impl MockModel {
    /// A model that only ever emits `'.'`.
    pub fn echo() -> Self {
        Self {
            script: vec![],
            filler: b'.' as TokenId,
            fingerprint: 0x1,
            fail_next: AtomicBool::new(false),
            forward_calls: AtomicUsize::new(0),
        }
    }

    /// A model scripted to emit exactly `output` (one byte per token) after a
    /// context of `prompt` has been consumed, then filler bytes forever.
    pub fn emitting_after(prompt: &str, output: &str) -> Self {
        let prompt_len = prompt.len();
        let mut script = vec![b'.' as TokenId; prompt_len];
        script.extend(output.bytes().map(|b| b as TokenId));
        Self {
            script,
            filler: b'.' as TokenId,
            fingerprint: 0x1,
            fail_next: AtomicBool::new(false),
            forward_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: u64) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Makes the next forward pass fail with an inference error.
    pub fn fail_on_next_forward(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of forward passes executed so far.
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.bytes().map(|b| b as TokenId).collect()
    }

    fn token_bytes(&self, token: TokenId) -> Vec<u8> {
        if token < 256 {
            vec![token as u8]
        } else {
            vec![]
        }
    }

    fn vocab_size(&self) -> usize {
        256
    }

    fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    async fn forward(&self, batch: &[Vec<TokenId>]) -> Result<Vec<TokenDistribution>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Inference("injected failure".into()));
        }
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        Ok(batch
            .iter()
            .map(|context| {
                let next = self
                    .script
                    .get(context.len())
                    .copied()
                    .unwrap_or(self.filler);
                let mut logits = vec![-1.0e9_f32; self.vocab_size()];
                logits[next as usize] = 0.0;
                TokenDistribution::new(logits)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_output_follows_context_length() {
        let model = MockModel::emitting_after("hi", "ok");
        let dists = model
            .forward(&[vec![b'h' as TokenId, b'i' as TokenId]])
            .await
            .unwrap();
        assert_eq!(dists[0].argmax(), b'o' as TokenId);

        let dists = model
            .forward(&[vec![
                b'h' as TokenId,
                b'i' as TokenId,
                b'o' as TokenId,
            ]])
            .await
            .unwrap();
        assert_eq!(dists[0].argmax(), b'k' as TokenId);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let model = MockModel::echo();
        model.fail_on_next_forward();
        assert!(model.forward(&[vec![1]]).await.is_err());
        assert!(model.forward(&[vec![1]]).await.is_ok());
        assert_eq!(model.forward_calls(), 1);
    }
}
