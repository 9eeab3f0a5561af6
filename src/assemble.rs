//! Prompt assembly from an agent trace with one segment left out.
//!
//! Two frames exist:
//!
//! - **Tool selection**: conversation block + results of the tools called
//!   *before* the target + query + `Agent calls:` cue.
//! - **Response**: results of every tool + query + `Assistant:` cue.
//!
//! Exclusions are checked against what the frame can see, so asking to drop a
//! segment that is not in the prompt is an error rather than a no-op. Blocks
//! with nothing left to show are omitted entirely.

use crate::error::{TargetError, TargetResult};
use crate::segment::Segment;
use crate::trace::AgentTrace;

pub const CONVERSATION_HEADER: &str = "Conversation:";
pub const TOOL_RESULTS_HEADER: &str = "Tool Results:";
pub const TOOL_CALL_CUE: &str = "Agent calls:";
pub const RESPONSE_CUE: &str = "Assistant:";

/// Builds prompts for one trace. Pure: identical inputs give identical bytes.
#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler<'t> {
    trace: &'t AgentTrace,
}

impl<'t> ContextAssembler<'t> {
    pub fn new(trace: &'t AgentTrace) -> Self {
        Self { trace }
    }

    /// Segments visible when explaining the call at `target`: every history
    /// turn, then every tool strictly before the target.
    pub fn tool_selection_segments(&self, target: usize) -> TargetResult<Vec<Segment>> {
        self.check_target(target)?;
        Ok((0..self.trace.history().len())
            .map(Segment::History)
            .chain((0..target).map(Segment::Tool))
            .collect())
    }

    /// Segments visible when explaining a response: every tool record.
    pub fn response_segments(&self) -> TargetResult<Vec<Segment>> {
        if self.trace.tools().is_empty() {
            return Err(TargetError::NoTools);
        }
        Ok((0..self.trace.tools().len()).map(Segment::Tool).collect())
    }

    /// Prompt for explaining the selection of the tool call at `target`,
    /// optionally leaving out one history turn or one prior tool.
    pub fn tool_selection(&self, target: usize, exclude: Option<Segment>) -> TargetResult<String> {
        self.check_target(target)?;
        let (skip_turn, skip_tool) = match exclude {
            None => (None, None),
            Some(Segment::History(i)) if i < self.trace.history().len() => (Some(i), None),
            Some(Segment::Tool(j)) if j < target => (None, Some(j)),
            Some(segment) => return Err(TargetError::NotVisible { segment }),
        };

        let conversation = self
            .trace
            .history()
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip_turn)
            .map(|(_, turn)| turn.render())
            .collect::<Vec<_>>()
            .join("\n");
        let results = self.tool_results(target, skip_tool);

        let mut parts = Vec::with_capacity(4);
        if !conversation.is_empty() {
            parts.push(format!("{CONVERSATION_HEADER}\n{conversation}"));
        }
        if !results.is_empty() {
            parts.push(format!("{TOOL_RESULTS_HEADER}\n{results}"));
        }
        parts.push(self.query_line());
        parts.push(TOOL_CALL_CUE.to_string());
        Ok(parts.join("\n\n"))
    }

    /// Prompt for explaining the final response, optionally leaving out one
    /// tool record. History is not part of this frame, so only tools can be
    /// excluded.
    pub fn response(&self, exclude_tool: Option<usize>) -> TargetResult<String> {
        let len = self.trace.tools().len();
        if let Some(j) = exclude_tool {
            if j >= len {
                return Err(TargetError::NotVisible {
                    segment: Segment::Tool(j),
                });
            }
        }

        let results = self.tool_results(len, exclude_tool);
        let mut parts = Vec::with_capacity(3);
        if !results.is_empty() {
            parts.push(format!("{TOOL_RESULTS_HEADER}\n{results}"));
        }
        parts.push(self.query_line());
        parts.push(RESPONSE_CUE.to_string());
        Ok(parts.join("\n\n"))
    }

    fn check_target(&self, target: usize) -> TargetResult<()> {
        let len = self.trace.tools().len();
        if target >= len {
            return Err(TargetError::ToolOutOfRange { index: target, len });
        }
        Ok(())
    }

    /// Rendered records of `tools[..upto]`, minus `skip`, separated by blank lines.
    fn tool_results(&self, upto: usize, skip: Option<usize>) -> String {
        self.trace.tools()[..upto]
            .iter()
            .enumerate()
            .filter(|(j, _)| Some(*j) != skip)
            .map(|(_, tool)| tool.render())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn query_line(&self) -> String {
        format!("Query: {}", self.trace.query())
    }
}
