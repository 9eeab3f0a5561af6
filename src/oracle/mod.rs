//! Language-model oracle: completion scoring and greedy generation.
//!
//! The engine only sees the [`LanguageModelOracle`] trait. The bundled
//! implementation is [`CandleOracle`], which runs a causal LM locally; tests
//! and benchmarks plug in deterministic oracles of their own.
//!
//! ## Token alignment
//!
//! `score(prompt, completion)` encodes `prompt` and `prompt + completion`
//! separately. The completion starts at the token count of the standalone
//! prompt encoding, even when that encoding is not a strict prefix of the
//! joint one (tokenizers can merge across the boundary). That case is logged
//! and accepted as a small source of noise rather than patched heuristically.

pub mod candle;
pub mod registry;

use miette::Diagnostic;
use thiserror::Error;

pub use self::candle::{CandleOracle, DevicePreference, OracleConfig};

/// Errors from the oracle subsystem.
#[derive(Debug, Error, Diagnostic)]
pub enum OracleError {
    #[error("model \"{model}\" is unavailable: {message}")]
    #[diagnostic(
        code(loo::oracle::model_unavailable),
        help(
            "Check the model key or identifier (`loo-agent --help` lists known keys), \
             your network connection, and that gated models have their license accepted \
             with HF_TOKEN exported."
        )
    )]
    ModelUnavailable { model: String, message: String },

    #[error("inference failed: {message}")]
    #[diagnostic(
        code(loo::oracle::inference),
        help("The model rejected the input or produced an invalid result.")
    )]
    Inference { message: String },
}

impl OracleError {
    /// Whether retrying the same call could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Inference { .. })
    }

    pub(crate) fn inference(message: impl ToString) -> Self {
        Self::Inference {
            message: message.to_string(),
        }
    }
}

pub type OracleResult<T> = std::result::Result<T, OracleError>;

/// A text-scoring and text-completion oracle over one loaded model.
///
/// Implementations must be deterministic: the same input always gives the
/// same score or continuation.
pub trait LanguageModelOracle: Send + Sync {
    /// Identifier of the loaded model.
    fn model_id(&self) -> &str;

    /// Sum of the log-probabilities of each `completion` token given `prompt`
    /// and the preceding completion tokens.
    fn score(&self, prompt: &str, completion: &str) -> OracleResult<f64>;

    /// Greedy continuation of `prompt`, trimmed, stopping at end-of-sequence
    /// or after `max_new_tokens`.
    fn generate(&self, prompt: &str, max_new_tokens: usize) -> OracleResult<String>;
}

impl<T: LanguageModelOracle + ?Sized> LanguageModelOracle for &T {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn score(&self, prompt: &str, completion: &str) -> OracleResult<f64> {
        (**self).score(prompt, completion)
    }

    fn generate(&self, prompt: &str, max_new_tokens: usize) -> OracleResult<String> {
        (**self).generate(prompt, max_new_tokens)
    }
}

impl<T: LanguageModelOracle + ?Sized> LanguageModelOracle for Box<T> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn score(&self, prompt: &str, completion: &str) -> OracleResult<f64> {
        (**self).score(prompt, completion)
    }

    fn generate(&self, prompt: &str, max_new_tokens: usize) -> OracleResult<String> {
        (**self).generate(prompt, max_new_tokens)
    }
}

// ---------------------------------------------------------------------------
// Token math
// ---------------------------------------------------------------------------

/// Where the scored completion lies inside a joint token sequence after
/// left-truncation to the context limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringWindow {
    /// Earliest tokens discarded to fit the context.
    pub drop: usize,
    /// First scored position, relative to the kept tokens.
    pub start: usize,
    /// Number of kept tokens.
    pub end: usize,
}

impl ScoringWindow {
    /// Number of completion tokens that will be scored.
    pub fn scored(&self) -> usize {
        self.end - self.start
    }
}

/// Compute the scoring window for a joint sequence of `total_len` tokens whose
/// standalone prompt encoding has `prompt_len` tokens.
///
/// Position 0 of the kept sequence has no predecessor, so it is never scored.
pub fn scoring_window(prompt_len: usize, total_len: usize, max_context: usize) -> ScoringWindow {
    let drop = total_len.saturating_sub(max_context);
    let end = total_len - drop;
    let start = prompt_len.saturating_sub(drop).max(1).min(end);
    ScoringWindow { drop, start, end }
}

/// Log-probability of `token` under the softmax of `logits`, computed in f64.
///
/// Returns `None` when the token is outside the vocabulary.
pub fn log_softmax_at(logits: &[f32], token: u32) -> Option<f64> {
    let target = f64::from(*logits.get(token as usize)?);
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    let sum: f64 = logits.iter().map(|&l| (f64::from(l) - max).exp()).sum();
    Some(target - max - sum.ln())
}

/// Index of the largest logit; ties go to the lowest index.
pub fn greedy_token(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &l) in logits.iter().enumerate() {
        match best {
            Some((_, b)) if l <= b => {}
            _ => best = Some((i, l)),
        }
    }
    best.map(|(i, _)| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_without_truncation() {
        let w = scoring_window(10, 14, 2048);
        assert_eq!(w, ScoringWindow { drop: 0, start: 10, end: 14 });
        assert_eq!(w.scored(), 4);
    }

    #[test]
    fn window_truncates_from_the_left() {
        // 100 joint tokens, 90 of them prompt, context of 50.
        let w = scoring_window(90, 100, 50);
        assert_eq!(w.drop, 50);
        assert_eq!(w.start, 40);
        assert_eq!(w.end, 50);
        assert_eq!(w.scored(), 10);
    }

    #[test]
    fn window_never_scores_position_zero() {
        let w = scoring_window(0, 5, 2048);
        assert_eq!(w.start, 1);
        assert_eq!(w.scored(), 4);

        // Completion alone overflows the context: everything before the
        // kept window is gone, the first kept token still has no predecessor.
        let w = scoring_window(10, 100, 20);
        assert_eq!(w.start, 1);
        assert_eq!(w.scored(), 19);
    }

    #[test]
    fn window_with_prompt_longer_than_joint_encoding() {
        // Boundary merge made the standalone prompt longer than prompt+completion.
        let w = scoring_window(12, 11, 2048);
        assert_eq!(w.scored(), 0);
    }

    #[test]
    fn log_softmax_matches_closed_form() {
        let logits = [1.0f32, 2.0, 3.0];
        let z: f64 = [1.0f64, 2.0, 3.0].iter().map(|x| x.exp()).sum();
        let expected = 3.0 - z.ln();
        let got = log_softmax_at(&logits, 2).unwrap();
        assert!((got - expected).abs() < 1e-9);

        let total: f64 = (0..3).map(|t| log_softmax_at(&logits, t).unwrap().exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn log_softmax_is_stable_for_large_logits() {
        let logits = [1000.0f32, 999.0];
        let lp = log_softmax_at(&logits, 0).unwrap();
        assert!(lp.is_finite());
        assert!(lp < 0.0 && lp > -1.0);
    }

    #[test]
    fn log_softmax_out_of_vocab() {
        assert!(log_softmax_at(&[0.0, 0.0], 2).is_none());
    }

    #[test]
    fn greedy_prefers_lowest_index_on_ties() {
        assert_eq!(greedy_token(&[0.5, 2.0, 2.0, 1.0]), Some(1));
        assert_eq!(greedy_token(&[]), None);
    }

    #[test]
    fn only_inference_errors_are_recoverable() {
        assert!(OracleError::inference("boom").is_recoverable());
        assert!(!OracleError::ModelUnavailable {
            model: "m".into(),
            message: "gone".into()
        }
        .is_recoverable());
    }
}
