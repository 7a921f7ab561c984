use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events published during a stage execution.
///
/// Transports may tail these to stream sub-agent output; the pipeline's
/// correctness never depends on anyone consuming them. The sequence is
/// finite and ends with [`StageEvent::Done`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageEvent {
    /// A chunk of sub-agent text output.
    Text { text: String },

    /// The sub-agent invoked a tool.
    ToolUse {
        name: String,
        input: serde_json::Value,
    },

    /// A tool returned to the sub-agent.
    ToolResult { name: String, output: String },

    /// Telemetry reported by the sub-agent body.
    Metrics {
        input_tokens: u64,
        output_tokens: u64,
        tool_calls: u32,
    },

    /// The stage execution finished (in any direction).
    Done,
}

/// Fire-and-forget sender for stage events.
///
/// A disabled sink drops everything; an attached sink drops events when the
/// consumer lags (bounded channel, `try_send`).
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StageEvent>>,
}

impl EventSink {
    /// A sink that discards all events.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A sink feeding the given channel.
    pub fn attached(tx: mpsc::Sender<StageEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Publish one event; never blocks, never fails.
    pub fn emit(&self, event: StageEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}
