//! Registry of short model keys.
//!
//! Keys resolve case-insensitively; anything else is treated as a literal
//! model identifier (hub repo id or local directory).

use std::fmt;

/// Rough hardware class of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeTier {
    /// Runs comfortably on CPU.
    Small,
    Medium,
    /// Needs an accelerator in practice.
    Large,
}

impl fmt::Display for SizeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small => write!(f, "small & fast"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large (needs GPU)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelEntry {
    pub key: &'static str,
    pub model_id: &'static str,
    pub tier: SizeTier,
}

impl ModelEntry {
    const fn new(key: &'static str, model_id: &'static str, tier: SizeTier) -> Self {
        Self {
            key,
            model_id,
            tier,
        }
    }
}

pub const DEFAULT_MODEL_KEY: &str = "qwen";

pub const MODELS: &[ModelEntry] = &[
    ModelEntry::new("qwen", "Qwen/Qwen2.5-0.5B-Instruct", SizeTier::Small),
    ModelEntry::new("qwen-1.5b", "Qwen/Qwen2.5-1.5B-Instruct", SizeTier::Small),
    ModelEntry::new("smollm2", "HuggingFaceTB/SmolLM2-1.7B-Instruct", SizeTier::Small),
    ModelEntry::new("llama-1b", "meta-llama/Llama-3.2-1B-Instruct", SizeTier::Small),
    ModelEntry::new("gemma3", "google/gemma-3-1b-it", SizeTier::Medium),
    ModelEntry::new("llama-3b", "meta-llama/Llama-3.2-3B-Instruct", SizeTier::Medium),
    ModelEntry::new("phi4", "microsoft/phi-4", SizeTier::Medium),
    ModelEntry::new("qwen-7b", "Qwen/Qwen2.5-7B-Instruct", SizeTier::Large),
    ModelEntry::new("mistral", "mistralai/Mistral-7B-Instruct-v0.3", SizeTier::Large),
    ModelEntry::new("llama-8b", "meta-llama/Llama-3.1-8B-Instruct", SizeTier::Large),
];

/// Look up a registered key.
pub fn lookup(key: &str) -> Option<&'static ModelEntry> {
    MODELS.iter().find(|m| m.key.eq_ignore_ascii_case(key))
}

/// Resolve a key to a model identifier, passing unknown keys through unchanged.
pub fn resolve(key: &str) -> String {
    match lookup(key) {
        Some(entry) => entry.model_id.to_string(),
        None => key.to_string(),
    }
}

/// The model identifier used when no key is given.
pub fn default_model_id() -> &'static str {
    lookup(DEFAULT_MODEL_KEY).map_or(MODELS[0].model_id, |m| m.model_id)
}

/// Help text listing every registered key, grouped by tier.
pub fn listing() -> String {
    let mut out = String::from("Available models:\n");
    let mut tier = None;
    for m in MODELS {
        if tier != Some(m.tier) {
            tier = Some(m.tier);
            out.push_str(&format!("\n  # {}\n", m.tier));
        }
        let default = if m.key == DEFAULT_MODEL_KEY { " (default)" } else { "" };
        out.push_str(&format!("  {:12} -> {}{default}\n", m.key, m.model_id));
    }
    out.push_str("\nAny other value is loaded as a model identifier or local directory.");
    out
}
