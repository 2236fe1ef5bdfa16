//! Dispatch of tasks over hosts.
//!
//! For every task the master plans the candidate hosts from its concurrency
//! policy, derives the effective parallelism and then runs the hosts either
//! one by one or in chunks. Each chunk gets a fresh loopback rpc server and
//! one worker process per host; workers talk back to that server to load and
//! save host state and to call proxy functions. The first nonzero exit code
//! aborts the whole run.

use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::{debug, warn};

use crate::host::{Host, HostCollection};
use crate::messenger::Messenger;
use crate::output::Console;
use crate::planner::Planner;
use crate::process::{WorkerCommand, WorkerProcess};
use crate::proxy::ProxyRegistry;
use crate::rpc::{self, Server, Tick, DEFAULT_TICK};
use crate::selector::{LabelSelector, Selector, SelectorError};
use crate::task::{Concurrency, Task};
use crate::worker;

/// Set to `true` to run workers inside the master instead of as processes.
pub const ENV_LOCAL_WORKER: &str = "FLEET_LOCAL_WORKER";
/// Any non-empty value disables the progress spinner.
pub const ENV_CI: &str = "CI";

#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Global parallelism; `None` or `0` means all hosts at once.
    pub limit: Option<usize>,
    pub local_worker: bool,
    /// Executable re-entered in worker mode.
    pub program: PathBuf,
    /// Appended to every worker command line.
    pub worker_args: Vec<OsString>,
    pub verbosity: u8,
    pub decorated: bool,
    pub ci: bool,
    pub tick: Duration,
}

impl MasterOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            limit: None,
            local_worker: false,
            program: program.into(),
            worker_args: Vec::new(),
            verbosity: 0,
            decorated: false,
            ci: false,
            tick: DEFAULT_TICK,
        }
    }

    /// Like [`MasterOptions::new`], with `CI` and `FLEET_LOCAL_WORKER` read from the environment.
    pub fn from_env(program: impl Into<PathBuf>) -> Self {
        let mut options = Self::new(program);
        options.ci = env::var_os(ENV_CI).is_some_and(|v| !v.is_empty());
        options.local_worker = env::var(ENV_LOCAL_WORKER).is_ok_and(|v| v == "true");
        options
    }
}

pub struct Master {
    hosts: HostCollection,
    proxies: ProxyRegistry,
    selector: Box<dyn Selector>,
    messenger: Arc<dyn Messenger>,
    console: Console,
    options: MasterOptions,
}

impl Master {
    pub fn new(
        hosts: HostCollection,
        proxies: ProxyRegistry,
        messenger: Arc<dyn Messenger>,
        console: Console,
        options: MasterOptions,
    ) -> Self {
        Self {
            hosts,
            proxies,
            selector: Box::new(LabelSelector),
            messenger,
            console,
            options,
        }
    }

    pub fn with_selector(mut self, selector: Box<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    /// Canonical host state, including everything workers saved.
    pub fn hosts(&self) -> &HostCollection {
        &self.hosts
    }

    /// Run `tasks` in order over the hosts named in `aliases`.
    ///
    /// With a planner nothing is executed: every concurrency unit is
    /// committed to it instead and no lifecycle notifications are sent.
    /// Returns 0 on success or the first nonzero worker exit code.
    pub fn run(
        &mut self,
        tasks: &[Arc<Task>],
        aliases: &[String],
        mut plan: Option<&mut Planner>,
    ) -> Result<i32> {
        for alias in aliases {
            self.hosts.get(alias)?;
        }
        let global_limit = match self.options.limit {
            Some(limit) if limit > 0 => limit,
            _ => aliases.len(),
        };

        for task in tasks {
            let planning = plan.is_some();
            if !planning {
                self.messenger.start_task(task);
            }

            let candidates = aliases
                .iter()
                .map(|alias| self.hosts.get(alias))
                .collect::<Result<Vec<_>, _>>()?;
            let planned = plan_hosts(task, &candidates, self.selector.as_ref())?;
            let limit = effective_limit(global_limit, task.task_limit(), planned.len());
            debug!(task = task.name(), hosts = ?planned, limit, "planned");

            let code = if planned.is_empty() {
                if let Some(planner) = plan.as_deref_mut() {
                    planner.commit(&[], task);
                }
                0
            } else if limit == 1 || planned.len() == 1 {
                self.run_sequential(task, &planned, plan.as_deref_mut())?
            } else {
                self.run_chunked(task, &planned, limit, plan.as_deref_mut())?
            };
            if code != 0 {
                return Ok(code);
            }

            if !planning {
                self.messenger.end_task(task, false);
            }
        }
        Ok(0)
    }

    fn run_sequential(
        &mut self,
        task: &Task,
        planned: &[String],
        mut plan: Option<&mut Planner>,
    ) -> Result<i32> {
        for alias in planned {
            // Earlier hosts may have changed what this one looks like.
            let unit: &[String] = if self.selects(task, alias)? {
                std::slice::from_ref(alias)
            } else {
                &[]
            };
            if let Some(planner) = plan.as_deref_mut() {
                planner.commit(unit, task);
                continue;
            }
            let code = self.run_chunk(task, unit)?;
            if code != 0 {
                return Ok(code);
            }
        }
        Ok(0)
    }

    fn run_chunked(
        &mut self,
        task: &Task,
        planned: &[String],
        limit: usize,
        mut plan: Option<&mut Planner>,
    ) -> Result<i32> {
        for chunk in planned.chunks(limit) {
            let mut selected = Vec::with_capacity(chunk.len());
            for alias in chunk {
                if self.selects(task, alias)? {
                    selected.push(alias.clone());
                }
            }
            if let Some(planner) = plan.as_deref_mut() {
                planner.commit(&selected, task);
                continue;
            }
            let code = self.run_chunk(task, &selected)?;
            if code != 0 {
                return Ok(code);
            }
        }
        Ok(0)
    }

    fn selects(&self, task: &Task, alias: &str) -> Result<bool> {
        let host = self.hosts.get(alias)?;
        Ok(selected(task, host, self.selector.as_ref())?)
    }

    /// Run one concurrency unit and report its exit code.
    fn run_chunk(&mut self, task: &Task, aliases: &[String]) -> Result<i32> {
        if aliases.is_empty() {
            return Ok(0);
        }
        let code = if self.options.local_worker {
            self.run_chunk_in_process(task, aliases)?
        } else {
            self.run_chunk_in_workers(task, aliases)?
        };
        if code != 0 {
            self.messenger.end_task(task, true);
        }
        Ok(code)
    }

    fn run_chunk_in_process(&mut self, task: &Task, aliases: &[String]) -> Result<i32> {
        for alias in aliases {
            let code = worker::run_in_process(
                task,
                alias,
                &mut self.hosts,
                &self.proxies,
                self.messenger.as_ref(),
            )?;
            if code != 0 {
                return Ok(code);
            }
        }
        Ok(0)
    }

    fn run_chunk_in_workers(&mut self, task: &Task, aliases: &[String]) -> Result<i32> {
        let server = Server::bind_loopback()?.with_tick(self.options.tick);
        debug!(task = task.name(), port = server.port(), hosts = ?aliases, "chunk started");

        let options = &self.options;
        let hosts = &mut self.hosts;
        let proxies = &self.proxies;
        let console = &mut self.console;

        let mut processes = server.run(
            |port| spawn_workers(options, task, aliases, port),
            |path, payload| rpc::route(hosts, proxies, path, payload),
            |processes: &mut Vec<WorkerProcess>| tick(processes, console),
        )?;

        console.clear_spinner();
        for process in processes.iter_mut() {
            for line in process.finish()? {
                console.writeln(&line);
            }
        }

        Ok(processes
            .iter()
            .filter_map(WorkerProcess::exit_code)
            .find(|code| *code != 0)
            .unwrap_or(0))
    }
}

/// Hosts a task is planned on, in collection order.
///
/// `Parallel` takes every candidate and leaves selection to dispatch time.
/// `Once` takes the first selected host; `OncePerNode` the first selected
/// host of every node.
pub fn plan_hosts(
    task: &Task,
    candidates: &[&Host],
    selector: &dyn Selector,
) -> Result<Vec<String>, SelectorError> {
    match task.concurrency() {
        Concurrency::Parallel { .. } => Ok(candidates
            .iter()
            .map(|host| host.alias().to_string())
            .collect()),
        Concurrency::Once => {
            for host in candidates {
                if selected(task, host, selector)? {
                    return Ok(vec![host.alias().to_string()]);
                }
            }
            Ok(Vec::new())
        }
        Concurrency::OncePerNode => {
            let mut nodes = HashSet::new();
            let mut planned = Vec::new();
            for host in candidates {
                if selected(task, host, selector)? && nodes.insert(host.node_key()) {
                    planned.push(host.alias().to_string());
                }
            }
            Ok(planned)
        }
    }
}

/// `min(global, task ?? global, planned)`, never below one.
pub fn effective_limit(global: usize, task: Option<usize>, planned: usize) -> usize {
    global
        .min(task.unwrap_or(global))
        .min(planned)
        .max(1)
}

fn selected(task: &Task, host: &Host, selector: &dyn Selector) -> Result<bool, SelectorError> {
    match task.selector() {
        Some(expr) => selector.matches(expr, host),
        None => Ok(true),
    }
}

fn spawn_workers(
    options: &MasterOptions,
    task: &Task,
    aliases: &[String],
    port: u16,
) -> Result<Vec<WorkerProcess>> {
    let verbosity = if task.is_verbose() {
        options.verbosity.max(1)
    } else {
        options.verbosity
    };

    let mut processes: Vec<WorkerProcess> = Vec::with_capacity(aliases.len());
    for alias in aliases {
        let command = WorkerCommand {
            program: options.program.clone(),
            port,
            task: task.name().to_string(),
            host: alias.clone(),
            verbosity,
            decorated: options.decorated,
            extra_args: options.worker_args.clone(),
        };
        debug!(host = %alias, args = ?command.args(), "spawning worker");
        match WorkerProcess::spawn(alias.as_str(), command.command()) {
            Ok(process) => processes.push(process),
            Err(err) => {
                for process in processes.iter_mut() {
                    if let Err(kill_err) = process.terminate() {
                        warn!(host = process.host(), error = %kill_err, "failed to stop worker");
                    }
                }
                return Err(err).with_context(|| format!("task '{}' aborted", task.name()));
            }
        }
    }
    Ok(processes)
}

/// One server tick: forward output, reap exited workers and stop once all
/// are done or one failed. On failure the still-running siblings are killed.
fn tick(processes: &mut [WorkerProcess], console: &mut Console) -> Result<Tick> {
    for process in processes.iter_mut() {
        for line in process.drain() {
            console.writeln(&line);
        }
    }

    let mut running = 0;
    let mut failed: Option<(String, i32)> = None;
    for process in processes.iter_mut() {
        if !process.poll()? {
            running += 1;
            continue;
        }
        if failed.is_none() {
            if let Some(code) = process.exit_code().filter(|code| *code != 0) {
                failed = Some((process.host().to_string(), code));
            }
        }
    }

    if let Some((host, code)) = failed {
        if running > 0 {
            warn!(%host, code, running, "worker failed, stopping the rest of the chunk");
            for process in processes.iter_mut() {
                process.terminate()?;
            }
        }
        return Ok(Tick::Stop);
    }
    if running == 0 {
        return Ok(Tick::Stop);
    }

    console.spin();
    Ok(Tick::Continue)
}
