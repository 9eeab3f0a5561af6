//! Built-in agent traces for demonstration runs.
//!
//! Each scenario models retrieval as just another tool: a `*_search` call
//! sits next to database and API calls, and all of them are scored the same
//! way.

use crate::error::TraceResult;
use crate::trace::{AgentTrace, HistoryTurn, ToolRecord};

/// Keys accepted by [`by_key`], in run order.
pub const KEYS: &[&str] = &["support", "travel", "research"];

#[derive(Debug, Clone)]
pub struct Scenario {
    pub key: &'static str,
    pub title: &'static str,
    pub summary: &'static str,
    pub trace: AgentTrace,
    /// Tool call whose selection is explained, if any. The response is
    /// always explained.
    pub tool_target: Option<usize>,
}

impl Scenario {
    /// Heading for the tool-selection explanation, e.g. `Why call order_lookup?`.
    pub fn tool_question(&self) -> Option<String> {
        let tool = self.trace.tool(self.tool_target?)?;
        Some(format!("Why call {}?", tool.name()))
    }
}

/// Customer support: policy retrieval plus an order database lookup.
pub fn customer_support() -> TraceResult<Scenario> {
    let trace = AgentTrace::new(
        "I want to return this item, is it too late?",
        vec![
            HistoryTurn::user("Hi, I ordered a laptop last month"),
            HistoryTurn::assistant("Hello! Could you provide your order number?"),
            HistoryTurn::user("Yes, it's ORDER-98234"),
            HistoryTurn::assistant("Let me look that up for you."),
        ],
        vec![
            ToolRecord::new(
                "knowledge_search",
                [("query", "return policy electronics")],
                "Results:\n\
                 1. [Return Policy] Items can be returned within 30 days. \
                 Electronics: 15-day window.\n\
                 2. [Refund Process] Refunds processed within 5-7 business days.",
            )?,
            ToolRecord::new(
                "order_lookup",
                [("order_id", "ORDER-98234")],
                "ORDER-98234: MacBook Pro, purchased 2024-12-10 (18 days ago), Delivered",
            )?,
        ],
    )?;
    Ok(Scenario {
        key: "support",
        title: "Customer Support",
        summary: "RAG for policies + API for order lookup",
        trace,
        tool_target: Some(1),
    })
}

/// Travel agent: destination retrieval plus flight and hotel APIs.
pub fn travel_agent() -> TraceResult<Scenario> {
    let trace = AgentTrace::new(
        "Find me flights and hotel recommendations",
        vec![
            HistoryTurn::user("Planning a trip to Tokyo next month"),
            HistoryTurn::assistant("When are you traveling?"),
            HistoryTurn::user("January 15-22, from San Francisco"),
        ],
        vec![
            ToolRecord::new(
                "destination_search",
                [("query", "Tokyo travel January")],
                "Results:\n\
                 1. [Tokyo Guide] January: cold (2-10°C), less crowded. Airports: NRT, HND.\n\
                 2. [SFO-Tokyo] Direct flights: United, ANA, JAL. ~11 hours. $800-1500 RT.",
            )?,
            ToolRecord::new(
                "flight_search",
                [("origin", "SFO"), ("dest", "TYO"), ("dates", "Jan 15-22")],
                "Best: United UA837 Jan 15 11:30am $892 RT, ANA NH7 1:15pm $945 RT",
            )?,
            ToolRecord::new(
                "hotel_search",
                [("city", "Tokyo"), ("dates", "Jan 15-22")],
                "Top: Shinjuku Granbell $120/night, Shibuya Excel $150/night",
            )?,
        ],
    )?;
    Ok(Scenario {
        key: "travel",
        title: "Travel Agent",
        summary: "RAG for destination + APIs for flights/hotels",
        trace,
        tool_target: Some(1),
    })
}

/// Research assistant: web and paper search. Only the response is explained.
pub fn research_assistant() -> TraceResult<Scenario> {
    let trace = AgentTrace::new(
        "What's the latest on LLM context attribution?",
        vec![
            HistoryTurn::user("I'm writing a survey on interpretability"),
            HistoryTurn::assistant("What aspect interests you?"),
            HistoryTurn::user("How to attribute LLM outputs to context"),
        ],
        vec![
            ToolRecord::new(
                "web_search",
                [("query", "LLM context attribution 2024")],
                "1. [Anthropic] Circuit tracing: 30M interpretable features\n\
                 2. [MIT] ContextCite: SOTA RAG attribution, 32 forward passes",
            )?,
            ToolRecord::new(
                "paper_search",
                [("query", "context attribution LLM 2024")],
                "1. [NeurIPS 2024] ContextCite: Linear surrogates for attribution\n\
                 2. [ACL 2025] TokenShapley: +11-23% accuracy improvement",
            )?,
        ],
    )?;
    Ok(Scenario {
        key: "research",
        title: "Research Agent",
        summary: "Web search + paper search",
        trace,
        tool_target: None,
    })
}

/// Every scenario, in run order.
pub fn all() -> TraceResult<Vec<Scenario>> {
    Ok(vec![customer_support()?, travel_agent()?, research_assistant()?])
}

/// Scenario by key, case-insensitively.
pub fn by_key(key: &str) -> TraceResult<Option<Scenario>> {
    let builder: fn() -> TraceResult<Scenario> = match key.to_ascii_lowercase().as_str() {
        "support" => customer_support,
        "travel" => travel_agent,
        "research" => research_assistant,
        _ => return Ok(None),
    };
    builder().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_build() {
        let all = all().unwrap();
        let keys: Vec<&str> = all.iter().map(|s| s.key).collect();
        assert_eq!(keys, KEYS);
    }

    #[test]
    fn customer_support_shape() {
        let s = customer_support().unwrap();
        assert_eq!(s.trace.history().len(), 4);
        assert_eq!(s.trace.tools().len(), 2);
        assert_eq!(s.tool_question().as_deref(), Some("Why call order_lookup?"));
        assert_eq!(
            s.trace.tools()[1].call_signature(),
            r#"order_lookup({"order_id":"ORDER-98234"})"#
        );
    }

    #[test]
    fn travel_arguments_keep_their_order() {
        let s = travel_agent().unwrap();
        assert_eq!(
            s.trace.tools()[1].call_signature(),
            r#"flight_search({"origin":"SFO","dest":"TYO","dates":"Jan 15-22"})"#
        );
        assert!(s.trace.tools()[0].output().contains("2-10°C"));
    }

    #[test]
    fn multi_line_outputs_have_no_indentation() {
        let s = customer_support().unwrap();
        for line in s.trace.tools()[0].output().lines() {
            assert!(!line.starts_with(' '), "{line:?}");
        }
    }

    #[test]
    fn research_explains_response_only() {
        let s = research_assistant().unwrap();
        assert_eq!(s.tool_target, None);
        assert_eq!(s.tool_question(), None);
    }

    #[test]
    fn lookup_by_key() {
        assert_eq!(by_key("Travel").unwrap().unwrap().title, "Travel Agent");
        assert!(by_key("banking").unwrap().is_none());
    }
}
