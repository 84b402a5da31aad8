use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use console::Style;

use crate::engine::TaskKey;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Outcome of one run of the task graph.
#[derive(Debug, Default)]
pub struct Report {
    /// Tasks whose action ran and succeeded.
    pub executed: Vec<TaskKey>,
    /// Tasks found up to date in the journal.
    pub skipped: Vec<TaskKey>,
    /// Tasks whose action failed, with the full error chain.
    pub failed: Vec<(TaskKey, anyhow::Error)>,
    /// Tasks never started because something upstream failed or the run
    /// was cancelled.
    pub cancelled: Vec<TaskKey>,
    pub execution_times: HashMap<TaskKey, TaskExecution>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn was_executed(&self, key: &TaskKey) -> bool {
        self.executed.contains(key)
    }

    pub fn was_skipped(&self, key: &TaskKey) -> bool {
        self.skipped.contains(key)
    }

    pub fn was_cancelled(&self, key: &TaskKey) -> bool {
        self.cancelled.contains(key)
    }

    /// The slowest executed tasks, longest first.
    pub fn slowest(&self, n: usize) -> Vec<(&TaskKey, Duration)> {
        let mut times: Vec<_> = self
            .execution_times
            .iter()
            .map(|(key, exec)| (key, exec.duration))
            .collect();
        times.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        times.truncate(n);
        times
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let red = Style::new().red().bold();
        let dim = Style::new().dim();

        write!(
            f,
            "{} executed, {} up to date",
            self.executed.len(),
            self.skipped.len()
        )?;

        if !self.failed.is_empty() {
            write!(f, ", {}", red.apply_to(format!("{} failed", self.failed.len())))?;
        }
        if !self.cancelled.is_empty() {
            write!(f, ", {}", dim.apply_to(format!("{} cancelled", self.cancelled.len())))?;
        }

        for (key, error) in &self.failed {
            write!(f, "\n{} {key}\n{error:#}", red.apply_to("failed:"))?;
        }

        Ok(())
    }
}
