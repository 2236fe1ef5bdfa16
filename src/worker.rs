use anyhow::{anyhow, Context as _, Result};
use tracing::{debug, error, info};

use crate::context::{Context, MasterLink};
use crate::host::{Host, HostCollection};
use crate::messenger::Messenger;
use crate::proxy::{InProcessLink, ProxyRegistry};
use crate::recipe::Recipe;
use crate::rpc::RpcClient;
use crate::task::{Task, TaskError, CONNECT_TASK};

/// Run `task` for one hydrated host and map the outcome to an exit code.
///
/// A dirty config is saved back through `link` after a successful (or
/// gracefully stopped) body.
pub fn execute(
    task: &Task,
    host: Host,
    link: &mut dyn MasterLink,
    messenger: &dyn Messenger,
) -> i32 {
    let alias = host.alias().to_string();
    debug!(task = task.name(), host = %alias, source = %task.source_location(), "executing");

    let mut ctx = Context::new(host).with_link(link);
    let outcome = task.run(&mut ctx);

    let outcome = match outcome {
        Ok(()) => Ok(false),
        Err(TaskError::GracefulShutdown(reason)) => {
            info!(task = task.name(), host = %alias, %reason, "graceful shutdown");
            Ok(true)
        }
        Err(err) => Err(err),
    };

    match outcome {
        Ok(stopped) => {
            if ctx.host().config().is_dirty() {
                if let Err(err) = ctx.save() {
                    eprintln!("[{alias}] error: failed to save config: {err}");
                    return 1;
                }
            }
            if !stopped && task.name() != CONNECT_TASK {
                messenger.end_on_host(ctx.host());
            }
            0
        }
        Err(err) => {
            error!(task = task.name(), host = %alias, "task failed");
            eprintln!(
                "[{alias}] error in {} ({}): {err:#}",
                task.name(),
                task.source_location()
            );
            err.exit_code()
        }
    }
}

/// Worker process entry: hydrate the host from the master on `port`, then run.
pub fn run_worker(
    recipe: &Recipe,
    task: &str,
    host: &str,
    port: u16,
    messenger: &dyn Messenger,
) -> Result<i32> {
    let task = recipe
        .tasks
        .get(task)
        .ok_or_else(|| anyhow!("worker asked to run unknown task '{task}'"))?;
    let mut client = RpcClient::connect(port)?;
    let snapshot = client
        .load(host)
        .with_context(|| format!("failed to load host '{host}' from master on port {port}"))?;
    Ok(execute(&task, snapshot, &mut client, messenger))
}

/// In-process fallback: same logic, canonical hosts reached directly.
pub fn run_in_process(
    task: &Task,
    alias: &str,
    hosts: &mut HostCollection,
    proxies: &ProxyRegistry,
    messenger: &dyn Messenger,
) -> Result<i32> {
    let mut link = InProcessLink::new(hosts, proxies);
    let snapshot = link.load(alias)?;
    Ok(execute(task, snapshot, &mut link, messenger))
}
