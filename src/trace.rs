//! Agent traces: the structured record of one agent episode.
//!
//! A trace holds the user query, the conversation history leading up to it,
//! and the tool calls the agent made (retrieval is just another tool). Traces
//! are validated on construction and immutable afterwards, so every prompt
//! assembled from the same trace is byte-identical.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TraceError, TraceResult};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Title-case name used when rendering a turn.
    pub fn title(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::Tool => "Tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// One conversational exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

impl HistoryTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// `Role: content`
    pub fn render(&self) -> String {
        format!("{}: {}", self.role, self.content)
    }
}

/// One completed tool invocation.
///
/// Arguments keep their insertion order so the rendered call signature is
/// stable across runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRecord {
    name: String,
    args: Map<String, Value>,
    output: String,
}

impl ToolRecord {
    /// Build a tool record, validating the name and argument keys.
    pub fn new<K, V>(
        name: impl Into<String>,
        args: impl IntoIterator<Item = (K, V)>,
        output: impl Into<String>,
    ) -> TraceResult<Self>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let record = Self {
            name: name.into(),
            args: args
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            output: output.into(),
        };
        record.validate(None)?;
        Ok(record)
    }

    fn validate(&self, index: Option<usize>) -> TraceResult<()> {
        if self.name.trim().is_empty() {
            return Err(TraceError::EmptyToolName { index });
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(TraceError::InvalidToolName {
                name: self.name.clone(),
            });
        }
        if self.args.keys().any(|k| k.trim().is_empty()) {
            return Err(TraceError::EmptyArgumentKey {
                tool: self.name.clone(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Canonical call signature: `name({"key":"value"})`.
    ///
    /// This is the text whose likelihood is explained by tool-selection
    /// attribution.
    pub fn call_signature(&self) -> String {
        // A map of JSON values always serializes.
        let args = Value::Object(self.args.clone()).to_string();
        format!("{}({args})", self.name)
    }

    /// `[signature]\noutput`
    pub fn render(&self) -> String {
        format!("[{}]\n{}", self.call_signature(), self.output)
    }
}

#[derive(Deserialize)]
struct RawToolRecord {
    name: String,
    #[serde(default)]
    args: Map<String, Value>,
    #[serde(default)]
    output: String,
}

#[derive(Deserialize)]
struct RawTrace {
    query: String,
    #[serde(default)]
    history: Vec<HistoryTurn>,
    #[serde(default)]
    tools: Vec<RawToolRecord>,
}

impl TryFrom<RawTrace> for AgentTrace {
    type Error = TraceError;

    fn try_from(raw: RawTrace) -> TraceResult<Self> {
        let tools = raw
            .tools
            .into_iter()
            .map(|t| ToolRecord {
                name: t.name,
                args: t.args,
                output: t.output,
            })
            .collect();
        AgentTrace::new(raw.query, raw.history, tools)
    }
}

/// Complete trace of one agent episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTrace")]
pub struct AgentTrace {
    query: String,
    history: Vec<HistoryTurn>,
    tools: Vec<ToolRecord>,
}

impl AgentTrace {
    /// Build a trace, validating the query and every tool record.
    pub fn new(
        query: impl Into<String>,
        history: Vec<HistoryTurn>,
        tools: Vec<ToolRecord>,
    ) -> TraceResult<Self> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(TraceError::EmptyQuery);
        }
        for (i, tool) in tools.iter().enumerate() {
            tool.validate(Some(i))?;
        }
        Ok(Self {
            query,
            history,
            tools,
        })
    }

    /// Parse a trace from its JSON form.
    pub fn from_json(json: &str) -> TraceResult<Self> {
        serde_json::from_str(json).map_err(|e| TraceError::Parse {
            message: e.to_string(),
        })
    }

    /// Load a trace from a JSON file.
    pub fn load(path: &Path) -> TraceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TraceError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json(&content)
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn history(&self) -> &[HistoryTurn] {
        &self.history
    }

    pub fn tools(&self) -> &[ToolRecord] {
        &self.tools
    }

    pub fn tool(&self, index: usize) -> Option<&ToolRecord> {
        self.tools.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup() -> ToolRecord {
        ToolRecord::new(
            "order_lookup",
            [("order_id", "ORDER-98234")],
            "ORDER-98234: Delivered",
        )
        .unwrap()
    }

    #[test]
    fn call_signature_is_compact_json() {
        assert_eq!(
            lookup().call_signature(),
            r#"order_lookup({"order_id":"ORDER-98234"})"#
        );
    }

    #[test]
    fn arguments_keep_insertion_order() {
        let tool = ToolRecord::new(
            "flight_search",
            [
                ("origin", json!("SFO")),
                ("dest", json!("TYO")),
                ("dates", json!("Jan 15-22")),
            ],
            "",
        )
        .unwrap();
        assert_eq!(
            tool.call_signature(),
            r#"flight_search({"origin":"SFO","dest":"TYO","dates":"Jan 15-22"})"#
        );
    }

    #[test]
    fn render_puts_output_under_signature() {
        assert_eq!(
            lookup().render(),
            "[order_lookup({\"order_id\":\"ORDER-98234\"})]\nORDER-98234: Delivered"
        );
    }

    #[test]
    fn history_turn_renders_title_case_role() {
        assert_eq!(HistoryTurn::user("hi").render(), "User: hi");
        assert_eq!(
            HistoryTurn::new(Role::System, "be brief").render(),
            "System: be brief"
        );
    }

    #[test]
    fn empty_query_rejected() {
        let err = AgentTrace::new("  ", vec![], vec![]).unwrap_err();
        assert!(matches!(err, TraceError::EmptyQuery));
    }

    #[test]
    fn bad_tool_names_rejected() {
        let empty = ToolRecord::new("", Vec::<(String, Value)>::new(), "x").unwrap_err();
        assert!(matches!(empty, TraceError::EmptyToolName { index: None }));
        assert_eq!(empty.to_string(), "tool record has an empty name");

        let spaced = ToolRecord::new("order lookup", Vec::<(String, Value)>::new(), "x");
        assert!(matches!(spaced, Err(TraceError::InvalidToolName { .. })));

        let key = ToolRecord::new("search", [("", "q")], "x");
        assert!(matches!(key, Err(TraceError::EmptyArgumentKey { .. })));
    }

    #[test]
    fn json_trace_goes_through_validation() {
        let ok = AgentTrace::from_json(
            r#"{
                "query": "Where is my order?",
                "history": [{"role": "user", "content": "Hi"}],
                "tools": [{"name": "order_lookup", "args": {"order_id": "A1"}, "output": "Shipped"}]
            }"#,
        )
        .unwrap();
        assert_eq!(ok.history().len(), 1);
        assert_eq!(ok.tools()[0].name(), "order_lookup");
        assert_eq!(ok.history()[0].role, Role::User);

        let bad = AgentTrace::from_json(
            r#"{"query": "q", "tools": [{"name": "", "output": "x"}]}"#,
        );
        assert!(matches!(bad, Err(TraceError::Parse { .. })));
    }

    #[test]
    fn empty_tool_name_reports_its_position() {
        let err = AgentTrace::from_json(
            r#"{"query": "q", "tools": [
                {"name": "search", "output": "x"},
                {"name": " ", "output": "y"}
            ]}"#,
        )
        .unwrap_err();
        match err {
            TraceError::Parse { message } => {
                assert!(message.contains("tool record 1 has an empty name"), "{message}")
            }
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn unknown_role_is_a_parse_error() {
        let bad = AgentTrace::from_json(
            r#"{"query": "q", "history": [{"role": "narrator", "content": "x"}]}"#,
        );
        assert!(matches!(bad, Err(TraceError::Parse { .. })));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("trace.json");
        std::fs::write(&path, r#"{"query": "q", "tools": []}"#).unwrap();
        let trace = AgentTrace::load(&path).unwrap();
        assert_eq!(trace.query(), "q");
        assert!(trace.tools().is_empty());

        let missing = AgentTrace::load(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(TraceError::Read { .. })));
    }
}
