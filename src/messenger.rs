use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::host::Host;
use crate::task::Task;

/// Fire-and-forget task lifecycle hooks.
pub trait Messenger: Send + Sync {
    fn start_task(&self, task: &Task);
    fn end_task(&self, task: &Task, failed: bool);
    fn end_on_host(&self, host: &Host);
}

/// Prints lifecycle lines to stdout.
///
/// Inside a worker process stdout is forwarded by the master, so host
/// completion lines show up in the master's output too.
#[derive(Debug, Default)]
pub struct ConsoleMessenger {
    verbosity: u8,
    started: Mutex<HashMap<String, Instant>>,
}

impl ConsoleMessenger {
    pub fn new(verbosity: u8) -> Self {
        Self {
            verbosity,
            started: Mutex::new(HashMap::new()),
        }
    }

    fn started(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Messenger for ConsoleMessenger {
    fn start_task(&self, task: &Task) {
        self.started()
            .insert(task.name().to_string(), Instant::now());
        println!("task {}", task.name());
    }

    fn end_task(&self, task: &Task, failed: bool) {
        let elapsed = self.started().remove(task.name()).map(|t| t.elapsed());
        if failed {
            println!("task {} failed", task.name());
        } else if self.verbosity > 0 {
            if let Some(elapsed) = elapsed {
                println!("task {} done in {:.2}s", task.name(), elapsed.as_secs_f64());
            }
        }
        info!(task = task.name(), failed, "task finished");
    }

    fn end_on_host(&self, host: &Host) {
        println!("[{}] done", host.alias());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessengerEvent {
    StartTask { ts_ms: u128, task: String },
    EndTask { ts_ms: u128, task: String, failed: bool },
    EndOnHost { ts_ms: u128, host: String },
}

impl MessengerEvent {
    pub fn summarize(&self) -> String {
        match self {
            MessengerEvent::StartTask { task, .. } => format!("start {task}"),
            MessengerEvent::EndTask { task, failed, .. } => format!("end {task} failed={failed}"),
            MessengerEvent::EndOnHost { host, .. } => format!("host {host}"),
        }
    }
}

/// Records every hook call in order; handy for previews and tests.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<MessengerEvent>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    fn push(&self, event: MessengerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<MessengerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events without timestamps, one line each.
    pub fn summary(&self) -> Vec<String> {
        self.events().iter().map(MessengerEvent::summarize).collect()
    }
}

impl Messenger for Recorder {
    fn start_task(&self, task: &Task) {
        self.push(MessengerEvent::StartTask {
            ts_ms: Self::now_ms(),
            task: task.name().to_string(),
        });
    }

    fn end_task(&self, task: &Task, failed: bool) {
        self.push(MessengerEvent::EndTask {
            ts_ms: Self::now_ms(),
            task: task.name().to_string(),
            failed,
        });
    }

    fn end_on_host(&self, host: &Host) {
        self.push(MessengerEvent::EndOnHost {
            ts_ms: Self::now_ms(),
            host: host.alias().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_keeps_hook_order() {
        let rec = Recorder::new();
        let task = Task::new("deploy", |_| Ok(()));

        rec.start_task(&task);
        rec.end_on_host(&Host::new("web1"));
        rec.end_task(&task, false);

        assert_eq!(
            rec.summary(),
            vec!["start deploy", "host web1", "end deploy failed=false"]
        );
    }

    #[test]
    fn console_messenger_forgets_start_time_on_end() {
        let console = ConsoleMessenger::new(1);
        let task = Task::new("deploy", |_| Ok(()));
        console.start_task(&task);
        assert!(console.started().contains_key("deploy"));
        console.end_task(&task, false);
        assert!(console.started().is_empty());
    }
}
