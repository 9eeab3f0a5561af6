//! Context segments: the ablatable units of an agent trace.
//!
//! A segment is identified by its source kind and position. The query and the
//! instruction frame are fixed and never segments. Labels are derived from the
//! identity plus a short preview for readers; the preview never feeds into a
//! score.

use std::fmt;

use crate::trace::AgentTrace;

/// Characters of turn content shown in a history label.
pub const LABEL_PREVIEW_CHARS: usize = 35;

/// One ablatable unit of context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// A conversation turn, by position in the history.
    History(usize),
    /// A tool record, by position in call order.
    Tool(usize),
}

impl Segment {
    /// Unique, human-readable label for this segment within `trace`.
    ///
    /// Falls back to the bare identity when the segment is not in the trace.
    pub fn label(self, trace: &AgentTrace) -> String {
        match self {
            Self::History(i) => match trace.history().get(i) {
                Some(turn) => format!("History[{i}]: {}", preview(&turn.content)),
                None => self.to_string(),
            },
            Self::Tool(j) => match trace.tool(j) {
                Some(tool) => format!("Tool[{j}]: {}", tool.name()),
                None => self.to_string(),
            },
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::History(i) => write!(f, "history turn {i}"),
            Self::Tool(j) => write!(f, "tool call {j}"),
        }
    }
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(LABEL_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// The attribution score of one segment: `baseline - ablated` log-probability.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentScore {
    pub segment: Segment,
    pub label: String,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{HistoryTurn, ToolRecord};

    fn trace() -> AgentTrace {
        let tool = |name: &str| {
            ToolRecord::new(name, [("query", "q")], "out").unwrap()
        };
        AgentTrace::new(
            "q",
            vec![
                HistoryTurn::user("Hi, I ordered a laptop last month and it broke"),
                HistoryTurn::assistant("Sorry!"),
            ],
            vec![tool("web_search"), tool("web_search")],
        )
        .unwrap()
    }

    #[test]
    fn history_label_previews_content() {
        let t = trace();
        assert_eq!(
            Segment::History(0).label(&t),
            "History[0]: Hi, I ordered a laptop last month a..."
        );
        assert_eq!(Segment::History(1).label(&t), "History[1]: Sorry!");
    }

    #[test]
    fn repeated_tool_names_get_distinct_labels() {
        let t = trace();
        let a = Segment::Tool(0).label(&t);
        let b = Segment::Tool(1).label(&t);
        assert_eq!(a, "Tool[0]: web_search");
        assert_ne!(a, b);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let long = "é".repeat(40);
        let p = preview(&long);
        assert_eq!(p.chars().count(), LABEL_PREVIEW_CHARS + 3);
    }

    #[test]
    fn missing_segment_falls_back_to_identity() {
        assert_eq!(Segment::Tool(9).label(&trace()), "tool call 9");
    }
}
