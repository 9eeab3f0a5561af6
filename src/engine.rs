//! Leave-one-out attribution engine.
//!
//! For a target text `t` and the prompt `P` built from every visible segment,
//! the score of segment `s` is
//!
//! ```text
//! log p(t | P) - log p(t | P without s)
//! ```
//!
//! Positive scores mark supportive segments, scores near zero mark segments
//! the generation did not depend on, and negative scores mark segments whose
//! presence made the target less likely. One baseline scoring call plus one
//! call per visible segment: O(n) model evaluations.

use std::fmt;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::assemble::ContextAssembler;
use crate::error::{
    EngineError, EngineResult, FailureReason, PartialAttribution, SegmentFailure, TargetError,
};
use crate::oracle::{LanguageModelOracle, OracleError};
use crate::segment::{Segment, SegmentScore};
use crate::trace::AgentTrace;

/// Configuration for an [`AttributionEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Token limit for generated responses.
    pub max_new_tokens: usize,
    /// Extra attempts for a scoring or generation call that fails with an
    /// inference error.
    pub retries: u32,
    /// Wall-clock budget per attribution call. Segments not reached in time
    /// are reported as failed.
    pub budget: Option<Duration>,
    /// Score ablations on the rayon thread pool.
    pub parallel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 150,
            retries: 1,
            budget: None,
            parallel: false,
        }
    }
}

/// What an attribution explains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionKind {
    /// Why the agent made the tool call at this index.
    ToolSelection { tool_index: usize },
    /// What informed the final response; `generated` when the engine produced
    /// the response itself.
    Response { generated: bool },
}

impl fmt::Display for AttributionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolSelection { tool_index } => write!(f, "tool selection (call {tool_index})"),
            Self::Response { generated: true } => write!(f, "response (generated)"),
            Self::Response { generated: false } => write!(f, "response (supplied)"),
        }
    }
}

/// Scores for every segment visible to one target, in segment order.
#[derive(Debug, Clone)]
pub struct AttributionResult {
    pub kind: AttributionKind,
    /// The explained text: a call signature or a response.
    pub subject: String,
    /// Log-probability of the subject under the full context.
    pub baseline: f64,
    pub scores: Vec<SegmentScore>,
    pub elapsed: Duration,
}

impl AttributionResult {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Score recorded under `label`.
    pub fn get(&self, label: &str) -> Option<f64> {
        self.scores.iter().find(|s| s.label == label).map(|s| s.score)
    }

    /// Score of `segment`.
    pub fn score_of(&self, segment: Segment) -> Option<f64> {
        self.scores
            .iter()
            .find(|s| s.segment == segment)
            .map(|s| s.score)
    }

    /// Entries by descending score; equal scores keep segment order.
    pub fn ranked(&self) -> Vec<&SegmentScore> {
        rank(&self.scores)
    }
}

pub(crate) fn rank(scores: &[SegmentScore]) -> Vec<&SegmentScore> {
    let mut ranked: Vec<&SegmentScore> = scores.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

enum Outcome {
    Scored(f64),
    Failed(FailureReason),
    Fatal(OracleError),
}

/// Runs leave-one-out attribution against a borrowed oracle.
pub struct AttributionEngine<'o, O: LanguageModelOracle + ?Sized> {
    oracle: &'o O,
    config: EngineConfig,
}

impl<'o, O: LanguageModelOracle + ?Sized> AttributionEngine<'o, O> {
    pub fn new(oracle: &'o O, config: EngineConfig) -> Self {
        Self { oracle, config }
    }

    /// Explain why the agent made the tool call at `tool_index`.
    ///
    /// Visible segments are every history turn and every tool strictly before
    /// the target; the call itself and later calls are never scored.
    pub fn attribute_tool_selection(
        &self,
        trace: &AgentTrace,
        tool_index: usize,
    ) -> EngineResult<AttributionResult> {
        let started = Instant::now();
        let asm = ContextAssembler::new(trace);
        let tool = trace
            .tool(tool_index)
            .ok_or(TargetError::ToolOutOfRange {
                index: tool_index,
                len: trace.tools().len(),
            })?;
        let subject = tool.call_signature();

        let full = asm.tool_selection(tool_index, None)?;
        let ablated = asm
            .tool_selection_segments(tool_index)?
            .into_iter()
            .map(|s| asm.tool_selection(tool_index, Some(s)).map(|p| (s, p)))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            model = self.oracle.model_id(),
            subject = %subject,
            segments = ablated.len(),
            "explaining tool selection"
        );
        let baseline = self.baseline(&full, &subject)?;
        self.run(
            trace,
            AttributionKind::ToolSelection { tool_index },
            subject,
            baseline,
            &ablated,
            started,
        )
    }

    /// Explain which tool outputs informed `response`, generating the
    /// response greedily from the full context when none is supplied.
    ///
    /// A trace without tool records is rejected before any model call.
    pub fn attribute_response(
        &self,
        trace: &AgentTrace,
        response: Option<&str>,
    ) -> EngineResult<AttributionResult> {
        let started = Instant::now();
        let asm = ContextAssembler::new(trace);

        let full = asm.response(None)?;
        let ablated = asm
            .response_segments()?
            .into_iter()
            .map(|s| match s {
                Segment::Tool(j) => asm.response(Some(j)).map(|p| (s, p)),
                Segment::History(_) => Err(TargetError::NotVisible { segment: s }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (subject, generated) = match response {
            Some(text) => (text.to_string(), false),
            None => {
                let max_new_tokens = self.config.max_new_tokens;
                let text = self
                    .with_retry(&"response generation", || {
                        self.oracle.generate(&full, max_new_tokens)
                    })
                    .map_err(|(e, _)| EngineError::Oracle(e))?;
                tracing::debug!(response = %text, "generated response");
                (text, true)
            }
        };

        tracing::info!(
            model = self.oracle.model_id(),
            generated,
            segments = ablated.len(),
            "explaining response"
        );
        let baseline = self.baseline(&full, &subject)?;
        self.run(
            trace,
            AttributionKind::Response { generated },
            subject,
            baseline,
            &ablated,
            started,
        )
    }

    fn baseline(&self, prompt: &str, subject: &str) -> EngineResult<f64> {
        self.with_retry(&"baseline", || self.oracle.score(prompt, subject))
            .map_err(|(e, _)| {
                if e.is_recoverable() {
                    EngineError::Baseline {
                        subject: subject.to_string(),
                        source: e,
                    }
                } else {
                    EngineError::Oracle(e)
                }
            })
    }

    /// Score every ablated prompt and assemble the result. Outcomes are
    /// matched back to their segment, never to arrival order.
    fn run(
        &self,
        trace: &AgentTrace,
        kind: AttributionKind,
        subject: String,
        baseline: f64,
        ablated: &[(Segment, String)],
        started: Instant,
    ) -> EngineResult<AttributionResult> {
        let score_one = |(segment, prompt): &(Segment, String)| -> (Segment, Outcome) {
            (*segment, self.score_ablation(*segment, prompt, &subject, started))
        };
        let outcomes: Vec<(Segment, Outcome)> = if self.config.parallel {
            ablated.par_iter().map(score_one).collect()
        } else {
            ablated.iter().map(score_one).collect()
        };

        let mut scored = Vec::with_capacity(outcomes.len());
        let mut failed = Vec::new();
        for (segment, outcome) in outcomes {
            let label = segment.label(trace);
            match outcome {
                Outcome::Scored(ablated_score) => {
                    let score = baseline - ablated_score;
                    tracing::debug!(
                        segment = %label,
                        baseline,
                        ablated = ablated_score,
                        score,
                        "scored"
                    );
                    scored.push(SegmentScore {
                        segment,
                        label,
                        score,
                    });
                }
                Outcome::Failed(reason) => {
                    tracing::warn!(segment = %label, %reason, "segment could not be scored");
                    failed.push(SegmentFailure {
                        segment,
                        label,
                        reason,
                    });
                }
                Outcome::Fatal(e) => return Err(EngineError::Oracle(e)),
            }
        }
        debug_assert_eq!(scored.len() + failed.len(), ablated.len());

        let elapsed = started.elapsed();
        if !failed.is_empty() {
            return Err(EngineError::Partial(Box::new(PartialAttribution {
                kind,
                subject,
                baseline,
                scored,
                failed,
                elapsed,
            })));
        }

        tracing::info!(
            %kind,
            segments = scored.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "attribution complete"
        );
        Ok(AttributionResult {
            kind,
            subject,
            baseline,
            scores: scored,
            elapsed,
        })
    }

    fn score_ablation(
        &self,
        segment: Segment,
        prompt: &str,
        subject: &str,
        started: Instant,
    ) -> Outcome {
        if let Some(budget) = self.config.budget {
            if started.elapsed() >= budget {
                return Outcome::Failed(FailureReason::BudgetExhausted { budget });
            }
        }
        match self.with_retry(&segment, || self.oracle.score(prompt, subject)) {
            Ok(score) => Outcome::Scored(score),
            Err((e, attempts)) if e.is_recoverable() => {
                Outcome::Failed(FailureReason::Inference {
                    attempts,
                    message: e.to_string(),
                })
            }
            Err((e, _)) => Outcome::Fatal(e),
        }
    }

    /// Call `f`, retrying recoverable failures up to `config.retries` times.
    /// On failure, returns the last error and the number of attempts made.
    fn with_retry<T>(
        &self,
        what: &dyn fmt::Display,
        f: impl Fn() -> Result<T, OracleError>,
    ) -> Result<T, (OracleError, u32)> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_recoverable() && attempt <= self.config.retries => {
                    tracing::warn!(%what, attempt, error = %e, "oracle call failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}
