use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::host::HostCollection;
use crate::proxy::ProxyRegistry;
use crate::task::Task;

/// Tasks in definition order, looked up by name.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<Arc<Task>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.get(task.name()).is_some() {
            return Err(anyhow!("duplicate task name '{}'", task.name()));
        }
        self.tasks.push(Arc::new(task));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.iter().find(|t| t.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter()
    }

    /// Look up `names` in the given order.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<Task>>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.get(name).ok_or_else(|| {
                    let available = self
                        .tasks
                        .iter()
                        .map(|t| format!("'{}'", t.name()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    anyhow!("unknown task '{name}' (available: [{available}])")
                })
            })
            .collect()
    }
}

/// Everything both the master and its workers need to agree on: hosts,
/// tasks and the master-side functions workers may call.
#[derive(Debug, Default)]
pub struct Recipe {
    pub hosts: HostCollection,
    pub tasks: TaskSet,
    pub proxies: ProxyRegistry,
}

impl Recipe {
    pub fn new(hosts: HostCollection) -> Self {
        Self {
            hosts,
            tasks: TaskSet::new(),
            proxies: ProxyRegistry::new(),
        }
    }

    pub fn task(&mut self, task: Task) -> Result<&mut Self> {
        self.tasks.add(task)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_keeps_requested_order_and_reports_unknown() {
        let mut tasks = TaskSet::new();
        tasks.add(Task::new("a", |_| Ok(()))).unwrap();
        tasks.add(Task::new("b", |_| Ok(()))).unwrap();

        let resolved = tasks.resolve(&["b", "a"]).unwrap();
        let names: Vec<&str> = resolved.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["b", "a"]);

        let err = tasks.resolve(&["c"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown task 'c'") && msg.contains("'a', 'b'"), "{msg}");
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let mut tasks = TaskSet::new();
        tasks.add(Task::new("a", |_| Ok(()))).unwrap();
        assert!(tasks.add(Task::new("a", |_| Ok(()))).is_err());
    }
}
