//! Completion detection for agent runs.
//!
//! The agent signals that it is done by emitting a `<task_summary>` block in
//! its final text reply. Only the latest assistant text of a turn is
//! inspected, so a marker quoted in an earlier message never ends a run.

use tracing::debug;

/// Marker the agent must emit once the task is finished.
pub(crate) const SUMMARY_MARKER: &str = "<task_summary>";

const SUMMARY_CLOSE: &str = "</task_summary>";

/// Detects the completion marker in agent output.
#[derive(Debug, Clone)]
pub(crate) struct CompletionDetector {
    marker: String,
}

impl Default for CompletionDetector {
    fn default() -> Self {
        Self::new(SUMMARY_MARKER)
    }
}

impl CompletionDetector {
    /// Create a detector for the given literal marker.
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// Returns the text to record as the summary if it carries the marker.
    ///
    /// The whole text is returned verbatim; matching is a case-sensitive
    /// substring test.
    pub fn detect(&self, last_assistant_text: Option<&str>) -> Option<String> {
        let text = last_assistant_text?;
        if text.contains(&self.marker) {
            debug!("Completion marker found ({} bytes of text)", text.len());
            Some(text.to_string())
        } else {
            None
        }
    }
}

/// Extracts the body between `<task_summary>` and `</task_summary>`.
///
/// Falls back to everything after the opening marker when the block is not
/// closed, and to the whole text when there is no marker.
pub(crate) fn summary_body(summary: &str) -> &str {
    let Some((_, after)) = summary.split_once(SUMMARY_MARKER) else {
        return summary.trim();
    };
    after
        .split_once(SUMMARY_CLOSE)
        .map_or(after, |(body, _)| body)
        .trim()
}
