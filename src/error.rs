//! Rich diagnostic error types for loo-agent.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Trace and target errors are raised
//! before any model call; oracle errors come from inference; engine errors
//! describe an attribution run as a whole.

use std::fmt;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::AttributionKind;
use crate::oracle::OracleError;
use crate::segment::{Segment, SegmentScore};

/// Top-level error type for loo-agent.
#[derive(Debug, Error, Diagnostic)]
pub enum LooError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Trace errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TraceError {
    #[error("trace query is empty")]
    #[diagnostic(
        code(loo::trace::empty_query),
        help("Every agent trace needs the user query that the agent was answering.")
    )]
    EmptyQuery,

    /// `index` is the position in the trace; `None` for a standalone record.
    #[error(
        "tool record{} has an empty name",
        .index.map(|i| format!(" {i}")).unwrap_or_default()
    )]
    #[diagnostic(
        code(loo::trace::empty_tool_name),
        help("Give each tool record the name of the tool that was invoked.")
    )]
    EmptyToolName { index: Option<usize> },

    #[error("tool name \"{name}\" contains whitespace")]
    #[diagnostic(
        code(loo::trace::invalid_tool_name),
        help("Tool names are rendered as call signatures; use identifiers like `order_lookup`.")
    )]
    InvalidToolName { name: String },

    #[error("tool \"{tool}\" has an argument with an empty key")]
    #[diagnostic(
        code(loo::trace::empty_argument_key),
        help("Every tool argument needs a non-empty name.")
    )]
    EmptyArgumentKey { tool: String },

    #[error("failed to read trace file: {path}")]
    #[diagnostic(
        code(loo::trace::read),
        help("Check that the trace file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse trace: {message}")]
    #[diagnostic(
        code(loo::trace::parse),
        help(
            "Traces are JSON objects with `query`, `history` (role/content objects) \
             and `tools` (name/args/output objects)."
        )
    )]
    Parse { message: String },
}

pub type TraceResult<T> = std::result::Result<T, TraceError>;

// ---------------------------------------------------------------------------
// Target errors
// ---------------------------------------------------------------------------

/// The attribution target does not fit the trace. Raised before any model call.
#[derive(Debug, Error, Diagnostic)]
pub enum TargetError {
    #[error("tool index {index} is out of range: trace has {len} tool calls")]
    #[diagnostic(
        code(loo::target::tool_out_of_range),
        help("Tool indices are zero-based positions in the trace's tool list.")
    )]
    ToolOutOfRange { index: usize, len: usize },

    #[error("{segment} is not visible to this target")]
    #[diagnostic(
        code(loo::target::not_visible),
        help(
            "Tool-selection targets only see history and tools strictly before the \
             target call; response targets only see tool records."
        )
    )]
    NotVisible { segment: Segment },

    #[error("response attribution needs at least one tool record")]
    #[diagnostic(
        code(loo::target::no_tools),
        help("A response is attributed to tool outputs; add the tool calls the agent made.")
    )]
    NoTools,
}

pub type TargetResult<T> = std::result::Result<T, TargetError>;

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Why a segment could not be scored.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Scoring failed on every attempt.
    Inference { attempts: u32, message: String },
    /// The wall-clock budget ran out before the segment was reached.
    BudgetExhausted { budget: Duration },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inference { attempts, message } => {
                write!(f, "inference failed after {attempts} attempt(s): {message}")
            }
            Self::BudgetExhausted { budget } => {
                write!(f, "budget exhausted ({:.1}s)", budget.as_secs_f64())
            }
        }
    }
}

/// A segment that was visible to the target but has no score.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFailure {
    pub segment: Segment,
    pub label: String,
    pub reason: FailureReason,
}

/// The scores that were computed before an attribution run gave up, and
/// the segments that are missing.
#[derive(Debug, Clone)]
pub struct PartialAttribution {
    pub kind: AttributionKind,
    pub subject: String,
    pub baseline: f64,
    pub scored: Vec<SegmentScore>,
    pub failed: Vec<SegmentFailure>,
    pub elapsed: Duration,
}

impl PartialAttribution {
    /// Number of segments that were visible to the target.
    pub fn expected(&self) -> usize {
        self.scored.len() + self.failed.len()
    }
}

impl fmt::Display for PartialAttribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing: Vec<&str> = self.failed.iter().map(|s| s.label.as_str()).collect();
        write!(
            f,
            "attribution incomplete: {} of {} segments could not be scored ({})",
            self.failed.len(),
            self.expected(),
            missing.join(", ")
        )
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidTarget(#[from] TargetError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Oracle(#[from] OracleError),

    #[error("baseline scoring failed for \"{subject}\"")]
    #[diagnostic(
        code(loo::engine::baseline),
        help("Without a baseline no segment can be scored. Check the model logs above.")
    )]
    Baseline {
        subject: String,
        #[source]
        source: OracleError,
    },

    #[error("{0}")]
    #[diagnostic(
        code(loo::engine::partial),
        help(
            "Some ablations failed or the time budget ran out. The scores that were \
             computed are attached; rerun with a larger budget or check the model."
        )
    )]
    Partial(Box<PartialAttribution>),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Convenience alias for top-level operations.
pub type LooResult<T> = std::result::Result<T, LooError>;
