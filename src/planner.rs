use serde::Serialize;

use crate::task::Task;

/// One planning decision: the hosts a concurrency unit would run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub task: String,
    pub hosts: Vec<String>,
}

/// Append-only record of planned steps, used instead of execution for dry runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Planner {
    steps: Vec<PlanStep>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self, hosts: &[String], task: &Task) {
        self.steps.push(PlanStep {
            task: task.name().to_string(),
            hosts: hosts.to_vec(),
        });
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Stable text table, one row per step; empty steps show `-`.
    pub fn render(&self) -> String {
        let width = self
            .steps
            .iter()
            .map(|s| s.task.len())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        for (idx, step) in self.steps.iter().enumerate() {
            let hosts = if step.hosts.is_empty() {
                "-".to_string()
            } else {
                step.hosts.join(", ")
            };
            out.push_str(&format!("  {idx}. {:<width$}  {hosts}\n", step.task));
        }
        out
    }
}
