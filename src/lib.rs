// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # loo-agent
//!
//! Leave-one-out context attribution for LLM agents.
//!
//! An agent trace is a user query, a conversation history and an ordered list
//! of tool calls with their outputs. Retrieval is modelled as just another
//! tool. For a target (a tool call, or the final response) each visible
//! segment is removed in turn and the drop in the target's log-probability
//! becomes that segment's score.
//!
//! ## Architecture
//!
//! - **Traces** (`trace`, `segment`): validated agent traces and their ablatable segments
//! - **Prompt assembly** (`assemble`): deterministic prompts with one segment left out
//! - **Oracle** (`oracle`): log-probability scoring and greedy generation, candle-backed
//! - **Engine** (`engine`): baseline + one ablation per segment, retries, budget, rayon
//! - **Presentation** (`present`): ranked tables for terminals
//!
//! ## Library usage
//!
//! ```no_run
//! use loo_agent::engine::{AttributionEngine, EngineConfig};
//! use loo_agent::oracle::{CandleOracle, OracleConfig};
//! use loo_agent::scenarios;
//!
//! let oracle = CandleOracle::load(&OracleConfig::default()).unwrap();
//! let engine = AttributionEngine::new(&oracle, EngineConfig::default());
//! let support = scenarios::customer_support().unwrap();
//! let result = engine.attribute_tool_selection(&support.trace, 1).unwrap();
//! for entry in result.ranked() {
//!     println!("{:+.2}  {}", entry.score, entry.label);
//! }
//! ```

pub mod assemble;
pub mod config;
pub mod engine;
pub mod error;
pub mod oracle;
pub mod present;
pub mod scenarios;
pub mod segment;
pub mod trace;
