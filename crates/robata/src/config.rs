//! Configuration objects consumed at session start.
//!
//! These are owned by the surrounding application and read once when a model
//! is loaded. Beyond presence checks, validation is the application's concern.

use std::path::PathBuf;

use serde::Deserialize;

/// Configuration describing the model to load.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Path to the model weights on disk.
    pub model_path: PathBuf,

    /// Maximum context window, in tokens.
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    /// Number of conversations the engine can step together in one batch.
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,
}

fn default_context_length() -> usize {
    4096
}

fn default_batch_capacity() -> usize {
    4
}

/// Sampling and stop-condition configuration for generation turns.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Temperature for softmax scaling. `0.0` degenerates to greedy argmax.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Repetition penalty (1.0 = none). Values > 1.0 discourage tokens that
    /// already appear in the conversation history.
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// Maximum number of tokens generated per turn.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Markers that terminate a turn early. A turn stops before any of these
    /// enter the emitted output.
    #[serde(default = "default_anti_prompts")]
    pub anti_prompts: Vec<String>,

    /// Optional path to a GBNF grammar definition constraining output to a
    /// formal structure. Parse failure falls back to unconstrained sampling.
    #[serde(default)]
    pub grammar_path: Option<PathBuf>,
}

fn default_temperature() -> f32 {
    0.75
}

fn default_repetition_penalty() -> f32 {
    1.0
}

fn default_max_tokens() -> usize {
    4000
}

fn default_anti_prompts() -> Vec<String> {
    [
        "<|eot_id|>", "<|end|>", "user:", "User:", "USER:", "\nUser:", "\nUSER:",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            temperature: default_temperature(),
            repetition_penalty: default_repetition_penalty(),
            max_tokens: default_max_tokens(),
            anti_prompts: default_anti_prompts(),
            grammar_path: None,
        }
    }
}

impl InferenceConfig {
    /// Greedy decoding (temperature = 0).
    pub fn greedy() -> Self {
        InferenceConfig {
            temperature: 0.0,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_config_defaults_apply() {
        let config: InferenceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.temperature, 0.75);
        assert_eq!(config.max_tokens, 4000);
        assert_eq!(config.repetition_penalty, 1.0);
        assert!(config.anti_prompts.iter().any(|p| p == "User:"));
        assert!(config.grammar_path.is_none());
    }

    #[test]
    fn inference_config_overrides_defaults() {
        let config: InferenceConfig = serde_json::from_str(
            r#"{ "temperature": 0.2, "max_tokens": 16, "anti_prompts": ["STOP"] }"#,
        )
        .unwrap();
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.max_tokens, 16);
        assert_eq!(config.anti_prompts, vec!["STOP".to_string()]);
    }

    #[test]
    fn model_config_defaults_apply() {
        let config: ModelConfig =
            serde_json::from_str(r#"{ "model_path": "/models/tiny.bin" }"#).unwrap();
        assert_eq!(config.context_length, 4096);
        assert_eq!(config.batch_capacity, 4);
    }

    #[test]
    fn greedy_preset_zeroes_temperature() {
        let config = InferenceConfig::greedy();
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.max_tokens, 4000);
    }
}
