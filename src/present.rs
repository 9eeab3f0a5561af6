//! Rendering of attribution results for terminals.
//!
//! Rendering produces a `String`; the binary decides where it goes.

use std::time::Duration;

use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, Color, ContentArrangement, Table};

use crate::engine::{AttributionKind, AttributionResult, rank};
use crate::error::PartialAttribution;
use crate::segment::{Segment, SegmentScore};

/// Characters of a source label shown in the table.
pub const SOURCE_WIDTH: usize = 45;
/// Characters of a response shown in the header.
pub const RESPONSE_PREVIEW: usize = 180;
/// Scores beyond ±this are highlighted.
pub const HIGHLIGHT_THRESHOLD: f64 = 1.0;

/// Display class of a scored source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    History,
    /// A tool whose name mentions search: the retrieval side of the agent.
    Search,
    Tool,
}

impl SourceKind {
    pub fn classify(score: &SegmentScore) -> Self {
        match score.segment {
            Segment::History(_) => Self::History,
            Segment::Tool(_) if score.label.to_lowercase().contains("search") => Self::Search,
            Segment::Tool(_) => Self::Tool,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::History => "History",
            Self::Search => "Search",
            Self::Tool => "Tool",
        }
    }

    fn color(self) -> Color {
        match self {
            Self::History => Color::Yellow,
            Self::Search => Color::Blue,
            Self::Tool => Color::Cyan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Table,
    Plain,
}

#[derive(Debug, Clone, Copy)]
pub struct ResultPresenter {
    style: Style,
    width: Option<u16>,
}

impl Default for ResultPresenter {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ResultPresenter {
    pub fn new(plain: bool) -> Self {
        Self {
            style: if plain { Style::Plain } else { Style::Table },
            width: None,
        }
    }

    /// Fix the table width instead of following the terminal.
    pub fn with_width(mut self, width: u16) -> Self {
        self.width = Some(width);
        self
    }

    pub fn render(&self, title: &str, result: &AttributionResult) -> String {
        self.render_scores(
            title,
            result.kind,
            &result.subject,
            &result.ranked(),
            result.elapsed,
        )
    }

    /// Render what was scored, then the segments that were not.
    pub fn render_partial(&self, title: &str, partial: &PartialAttribution) -> String {
        let mut out = self.render_scores(
            title,
            partial.kind,
            &partial.subject,
            &rank(&partial.scored),
            partial.elapsed,
        );
        out.push_str(&format!(
            "\nIncomplete: {} of {} segments could not be scored\n",
            partial.failed.len(),
            partial.expected()
        ));
        for failure in &partial.failed {
            out.push_str(&format!("  - {}: {}\n", failure.label, failure.reason));
        }
        out
    }

    fn render_scores(
        &self,
        title: &str,
        kind: AttributionKind,
        subject: &str,
        ranked: &[&SegmentScore],
        elapsed: Duration,
    ) -> String {
        match self.style {
            Style::Plain => {
                let mut out = format!("\n{title}\n{}\n", "=".repeat(50));
                for s in ranked {
                    out.push_str(&format!("  {:+8.2} | {}\n", s.score, s.label));
                }
                out.push_str(&format!("  Time: {:.1}s\n", elapsed.as_secs_f64()));
                out
            }
            Style::Table => {
                let mut out = format!("\n── {title} ──\n{}\n", header(kind, subject));
                out.push_str(&self.table(ranked).to_string());
                out.push_str(&format!("\nCompleted in {:.1}s\n", elapsed.as_secs_f64()));
                out
            }
        }
    }

    fn table(&self, ranked: &[&SegmentScore]) -> Table {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        if let Some(width) = self.width {
            table.set_width(width);
        }
        table.set_header(vec![
            Cell::new("Rank").fg(Color::Cyan),
            Cell::new("Source").fg(Color::Cyan),
            Cell::new("Score").fg(Color::Cyan),
            Cell::new("Type").fg(Color::Cyan),
        ]);
        for (i, s) in ranked.iter().enumerate() {
            let kind = SourceKind::classify(s);
            table.add_row(vec![
                Cell::new(i + 1).set_alignment(CellAlignment::Center),
                Cell::new(truncate(&s.label, SOURCE_WIDTH)),
                score_cell(s.score),
                Cell::new(kind.as_str()).fg(kind.color()),
            ]);
        }
        table
    }
}

fn header(kind: AttributionKind, subject: &str) -> String {
    match kind {
        AttributionKind::ToolSelection { .. } => format!("Tool: {subject}"),
        AttributionKind::Response { .. } => {
            let preview = truncate(subject, RESPONSE_PREVIEW);
            if preview.len() < subject.len() {
                format!("Response: {preview}...")
            } else {
                format!("Response: {preview}")
            }
        }
    }
}

fn score_cell(score: f64) -> Cell {
    let cell = Cell::new(format!("{score:+.2}")).set_alignment(CellAlignment::Right);
    if score > HIGHLIGHT_THRESHOLD {
        cell.fg(Color::Green)
    } else if score < -HIGHLIGHT_THRESHOLD {
        cell.fg(Color::Red)
    } else {
        cell.fg(Color::DarkGrey)
    }
}

/// First `max` characters of `s`.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureReason, SegmentFailure};

    fn score(segment: Segment, label: &str, score: f64) -> SegmentScore {
        SegmentScore {
            segment,
            label: label.into(),
            score,
        }
    }

    fn result() -> AttributionResult {
        AttributionResult {
            kind: AttributionKind::ToolSelection { tool_index: 1 },
            subject: r#"order_lookup({"order_id":"ORDER-98234"})"#.into(),
            baseline: -12.0,
            scores: vec![
                score(Segment::History(0), "History[0]: Hi, I ordered a laptop last month", 0.4),
                score(Segment::History(2), "History[2]: Yes, it's ORDER-98234", 6.25),
                score(Segment::Tool(0), "Tool[0]: knowledge_search", -1.5),
            ],
            elapsed: Duration::from_millis(2340),
        }
    }

    #[test]
    fn classifies_sources() {
        let r = result();
        let kinds: Vec<SourceKind> = r.scores.iter().map(SourceKind::classify).collect();
        assert_eq!(
            kinds,
            vec![SourceKind::History, SourceKind::History, SourceKind::Search]
        );
        let api = score(Segment::Tool(1), "Tool[1]: order_lookup", 0.0);
        assert_eq!(SourceKind::classify(&api), SourceKind::Tool);
    }

    #[test]
    fn plain_output_is_ranked() {
        let out = ResultPresenter::new(true).render("Why call order_lookup?", &result());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "Why call order_lookup?");
        assert_eq!(lines[3], "     +6.25 | History[2]: Yes, it's ORDER-98234");
        assert_eq!(lines[5], "     -1.50 | Tool[0]: knowledge_search");
        assert_eq!(lines[6], "  Time: 2.3s");
    }

    #[test]
    fn table_output_has_header_rows_and_footer() {
        let out = ResultPresenter::default()
            .with_width(120)
            .render("Why call order_lookup?", &result());
        assert!(out.contains("── Why call order_lookup? ──"));
        assert!(out.contains(r#"Tool: order_lookup({"order_id":"ORDER-98234"})"#));
        assert!(out.contains("+6.25"));
        assert!(out.contains("-1.50"));
        assert!(out.contains("Search"));
        assert!(out.contains("Completed in 2.3s"));
        assert!(out.find("+6.25").unwrap() < out.find("+0.40").unwrap());
    }

    #[test]
    fn long_responses_are_previewed() {
        let long = "a".repeat(300);
        assert_eq!(
            header(AttributionKind::Response { generated: true }, &long),
            format!("Response: {}...", "a".repeat(RESPONSE_PREVIEW))
        );
        assert_eq!(
            header(AttributionKind::Response { generated: false }, "short"),
            "Response: short"
        );
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn partial_lists_failures() {
        let r = result();
        let partial = PartialAttribution {
            kind: r.kind,
            subject: r.subject.clone(),
            baseline: r.baseline,
            scored: r.scores[..2].to_vec(),
            failed: vec![SegmentFailure {
                segment: Segment::Tool(0),
                label: "Tool[0]: knowledge_search".into(),
                reason: FailureReason::BudgetExhausted {
                    budget: Duration::from_secs(5),
                },
            }],
            elapsed: r.elapsed,
        };
        let out = ResultPresenter::new(true).render_partial("t", &partial);
        assert!(out.contains("+6.25 | History[2]"));
        assert!(out.contains("Incomplete: 1 of 3 segments could not be scored"));
        assert!(out.contains("  - Tool[0]: knowledge_search: budget exhausted (5.0s)"));
    }
}
