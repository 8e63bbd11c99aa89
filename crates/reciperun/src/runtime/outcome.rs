use serde::{Deserialize, Serialize};

/// Result of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    /// Valid per-launch durations in nanoseconds; empty for untimed runs.
    pub durations_ns: Vec<f64>,
    /// Non-fatal findings, in the order they were raised.
    pub warnings: Vec<String>,
    /// Iterations of the final batch.
    pub iterations: u32,
    /// Batches launched.
    pub attempts: usize,
}

impl LaunchOutcome {
    pub(crate) fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn mean_duration_ns(&self) -> Option<f64> {
        if self.durations_ns.is_empty() {
            return None;
        }
        Some(self.durations_ns.iter().sum::<f64>() / self.durations_ns.len() as f64)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
