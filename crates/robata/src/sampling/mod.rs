//! Token sampling strategies for text generation.
//!
//! After the engine leaves a next-token distribution behind, a sampling
//! policy selects the token that actually enters the conversation. Two
//! policies ship with the crate:
//!
//! - [`TemperatureSampler`] - temperature-scaled softmax sampling with an
//!   optional repetition penalty; temperature `0` degenerates to greedy argmax
//! - [`GrammarSampler`] - the same numeric pipeline, but with every token
//!   that cannot extend a sentence of a formal grammar masked to zero
//!   probability first
//!
//! Both are deterministic under a fixed seed, which the tests rely on.

pub mod grammar;

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use self::grammar::{Grammar, GrammarState};
use crate::error::{Error, Result};
use crate::model::{TokenDistribution, TokenId, TokenTable};

/// Selects the next token from a distribution, given the conversation
/// history so far.
///
/// Policies may carry state across calls within one turn (the grammar
/// sampler advances its parse state with every accepted token) but are
/// constructed fresh per generation request.
pub trait SamplingPolicy: Send {
    fn sample(
        &mut self,
        distribution: &TokenDistribution,
        history: &[TokenId],
    ) -> Result<TokenId>;
}

/// Temperature-scaled sampling over the raw distribution.
pub struct TemperatureSampler {
    temperature: f32,
    repetition_penalty: f32,
    rng: StdRng,
}

impl TemperatureSampler {
    pub fn new(temperature: f32, repetition_penalty: f32) -> Self {
        Self {
            temperature,
            repetition_penalty,
            rng: StdRng::from_os_rng(),
        }
    }

    /// A sampler with a fixed seed, for reproducible draws.
    pub fn with_seed(temperature: f32, repetition_penalty: f32, seed: u64) -> Self {
        Self {
            temperature,
            repetition_penalty,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SamplingPolicy for TemperatureSampler {
    fn sample(
        &mut self,
        distribution: &TokenDistribution,
        history: &[TokenId],
    ) -> Result<TokenId> {
        let mut logits = distribution.logits().to_vec();
        apply_repetition_penalty(&mut logits, history, self.repetition_penalty);
        draw(&mut self.rng, &logits, self.temperature)
    }
}

/// Grammar-constrained sampling.
///
/// Wraps a [`Grammar`] compiled once at session start. Before each draw,
/// every token whose bytes cannot extend a valid sentence from the current
/// parse state is masked out; the chosen token then advances the parse
/// state. When the masked distribution sums to zero the policy fails with
/// [`Error::GrammarViolation`] and the turn aborts.
pub struct GrammarSampler {
    state: GrammarState,
    table: Arc<TokenTable>,
    temperature: f32,
    repetition_penalty: f32,
    rng: StdRng,
}

impl GrammarSampler {
    pub fn new(
        grammar: Arc<Grammar>,
        table: Arc<TokenTable>,
        temperature: f32,
        repetition_penalty: f32,
    ) -> Self {
        Self {
            state: GrammarState::new(grammar),
            table,
            temperature,
            repetition_penalty,
            rng: StdRng::from_os_rng(),
        }
    }

    /// A grammar sampler with a fixed seed, for reproducible draws.
    pub fn with_seed(
        grammar: Arc<Grammar>,
        table: Arc<TokenTable>,
        temperature: f32,
        repetition_penalty: f32,
        seed: u64,
    ) -> Self {
        Self {
            state: GrammarState::new(grammar),
            table,
            temperature,
            repetition_penalty,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SamplingPolicy for GrammarSampler {
    fn sample(
        &mut self,
        distribution: &TokenDistribution,
        history: &[TokenId],
    ) -> Result<TokenId> {
        let mut logits = distribution.logits().to_vec();
        apply_repetition_penalty(&mut logits, history, self.repetition_penalty);

        // TODO: cache the allowed-token set per grammar state; accepts()
        // currently rescans the whole vocabulary on every step.
        for (id, logit) in logits.iter_mut().enumerate() {
            let bytes = self.table.bytes(id as TokenId);
            // Tokens that render to nothing would loop forever under a
            // grammar; mask them alongside out-of-grammar tokens.
            if bytes.is_empty() || !self.state.accepts(bytes) {
                *logit = f32::NEG_INFINITY;
            }
        }

        let token = draw(&mut self.rng, &logits, self.temperature)?;
        if !self.state.advance(self.table.bytes(token)) {
            return Err(Error::GrammarViolation);
        }
        Ok(token)
    }
}

/// CTRL-style repetition penalty: tokens already present in the history have
/// their logits pushed toward less likely.
fn apply_repetition_penalty(logits: &mut [f32], history: &[TokenId], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for token in history {
        if let Some(logit) = logits.get_mut(*token as usize) {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

/// Draws a token id from temperature-scaled logits. Entries at negative
/// infinity are masked out entirely; a fully masked distribution fails with
/// [`Error::GrammarViolation`].
fn draw(rng: &mut StdRng, logits: &[f32], temperature: f32) -> Result<TokenId> {
    if temperature <= 0.0 {
        // Greedy argmax over unmasked entries.
        let mut best: Option<usize> = None;
        for (idx, logit) in logits.iter().enumerate() {
            if logit.is_finite() && best.is_none_or(|b| *logit > logits[b]) {
                best = Some(idx);
            }
        }
        return best.map(|idx| idx as TokenId).ok_or(Error::GrammarViolation);
    }

    let max = logits
        .iter()
        .copied()
        .filter(|logit| logit.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return Err(Error::GrammarViolation);
    }

    let weights: Vec<f32> = logits
        .iter()
        .map(|logit| {
            if logit.is_finite() {
                ((logit - max) / temperature).exp()
            } else {
                0.0
            }
        })
        .collect();
    let total: f32 = weights.iter().sum();
    if total <= 0.0 {
        return Err(Error::GrammarViolation);
    }

    let mut target = rng.random::<f32>() * total;
    for (idx, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        target -= weight;
        if target <= 0.0 {
            return Ok(idx as TokenId);
        }
    }
    // Floating point drift past the end; take the last viable entry.
    Ok(weights.iter().rposition(|w| *w > 0.0).unwrap_or(0) as TokenId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mock::MockModel;

    fn byte_table() -> Arc<TokenTable> {
        Arc::new(TokenTable::from_model(&MockModel::echo()))
    }

    #[test]
    fn zero_temperature_is_greedy_argmax() {
        let mut sampler = TemperatureSampler::with_seed(0.0, 1.0, 7);
        let dist = TokenDistribution::new(vec![0.5, 2.0, -1.0]);
        for _ in 0..5 {
            assert_eq!(sampler.sample(&dist, &[]).unwrap(), 1);
        }
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let dist = TokenDistribution::new(vec![1.0, 1.0, 1.0, 1.0]);
        let mut first = TemperatureSampler::with_seed(0.75, 1.0, 42);
        let mut second = TemperatureSampler::with_seed(0.75, 1.0, 42);
        for _ in 0..20 {
            assert_eq!(
                first.sample(&dist, &[]).unwrap(),
                second.sample(&dist, &[]).unwrap()
            );
        }
    }

    #[test]
    fn sharp_distribution_dominates_sampling() {
        // One token carries essentially all the probability mass.
        let mut logits = vec![-1.0e9_f32; 8];
        logits[3] = 0.0;
        let dist = TokenDistribution::new(logits);
        let mut sampler = TemperatureSampler::with_seed(0.75, 1.0, 1);
        for _ in 0..50 {
            assert_eq!(sampler.sample(&dist, &[]).unwrap(), 3);
        }
    }

    #[test]
    fn repetition_penalty_discourages_history_tokens() {
        let mut sampler = TemperatureSampler::with_seed(0.0, 10.0, 0);
        let dist = TokenDistribution::new(vec![2.0, 1.9]);
        // Without history token 0 wins; with it penalized, token 1 does.
        assert_eq!(sampler.sample(&dist, &[]).unwrap(), 0);
        assert_eq!(sampler.sample(&dist, &[0]).unwrap(), 1);
    }

    #[test]
    fn grammar_masks_disallowed_tokens() {
        let grammar = Arc::new(Grammar::parse(r#"root ::= "ab" | "ac""#, "root").unwrap());
        let uniform = TokenDistribution::new(vec![0.0; 256]);
        let mut sampler = GrammarSampler::with_seed(grammar, byte_table(), 0.75, 1.0, 3);

        // Only 'a' can open a sentence.
        assert_eq!(sampler.sample(&uniform, &[]).unwrap(), b'a' as TokenId);
        // Then only 'b' or 'c'.
        let second = sampler.sample(&uniform, &[]).unwrap();
        assert!(second == b'b' as TokenId || second == b'c' as TokenId);
    }

    #[test]
    fn exhausted_grammar_is_a_violation() {
        let grammar = Arc::new(Grammar::parse(r#"root ::= "a""#, "root").unwrap());
        let uniform = TokenDistribution::new(vec![0.0; 256]);
        let mut sampler = GrammarSampler::with_seed(grammar, byte_table(), 0.75, 1.0, 9);

        assert_eq!(sampler.sample(&uniform, &[]).unwrap(), b'a' as TokenId);
        // The sentence is complete; no token can extend it.
        assert!(matches!(
            sampler.sample(&uniform, &[]),
            Err(Error::GrammarViolation)
        ));
    }

    #[test]
    fn greedy_grammar_sampling_respects_the_mask() {
        let grammar = Arc::new(Grammar::parse(r#"root ::= "z""#, "root").unwrap());
        // Argmax of the raw logits would be token 0; the mask forces 'z'.
        let mut logits = vec![0.0_f32; 256];
        logits[0] = 5.0;
        let dist = TokenDistribution::new(logits);
        let mut sampler = GrammarSampler::with_seed(grammar, byte_table(), 0.0, 1.0, 0);
        assert_eq!(sampler.sample(&dist, &[]).unwrap(), b'z' as TokenId);
    }
}
