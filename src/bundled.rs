//! Recipe shipped with the `fleet` binary.
//!
//! Both the master and every worker build it from the same inventory, so task
//! names and proxy functions line up on both sides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::Context;
use crate::host::{HostCollection, LABELS_KEY};
use crate::recipe::Recipe;
use crate::task::{Task, TaskError, CONNECT_TASK};

pub const PROXY_LOCK: &str = "deploy:lock";
pub const PROXY_UNLOCK: &str = "deploy:unlock";
pub const PROXY_NEXT_RELEASE: &str = "release:next";

/// Exit code of `check` on a host marked unhealthy.
pub const UNHEALTHY_EXIT: i32 = 3;
/// Exit code of `lock` when someone else holds the lock.
pub const LOCKED_EXIT: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAnswer {
    pub acquired: bool,
    pub holder: String,
}

pub fn recipe(hosts: HostCollection) -> Result<Recipe> {
    let mut recipe = Recipe::new(hosts);
    register_proxies(&mut recipe);

    recipe
        .task(Task::new(CONNECT_TASK, |ctx| {
            let host = ctx.host();
            if host.hostname().is_empty() {
                return Err(TaskError::exit(1, format!("host '{host}' has no hostname")));
            }
            debug!(host = host.alias(), hostname = host.hostname(), "connected");
            Ok(())
        }))?
        .task(Task::new("info", |ctx| {
            let host = ctx.host();
            let labels = host
                .config()
                .get(LABELS_KEY)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "{}".to_string());
            println!(
                "[{}] hostname={} node={} labels={labels}",
                host.alias(),
                host.hostname(),
                host.node_key()
            );
            Ok(())
        }))?
        .task(Task::new("check", |ctx| {
            if ctx.host().config().get_bool("healthy") == Some(false) {
                return Err(TaskError::exit(UNHEALTHY_EXIT, "host is unhealthy"));
            }
            if let Some(command) = ctx.host().config().get_str("check_cmd") {
                let command = command.to_string();
                ctx.run_local(&command)?;
            }
            Ok(())
        }))?
        .task(
            Task::new("lock", |ctx| {
                let answer: LockAnswer = ctx.proxy(PROXY_LOCK, ())?;
                if !answer.acquired {
                    return Err(TaskError::exit(
                        LOCKED_EXIT,
                        format!("deploy is locked by '{}'", answer.holder),
                    ));
                }
                println!("[{}] lock acquired", ctx.host().alias());
                Ok(())
            })
            .once(),
        )?
        .task(
            Task::new("unlock", |ctx| {
                let released: bool = ctx.proxy(PROXY_UNLOCK, ())?;
                println!(
                    "[{}] lock {}",
                    ctx.host().alias(),
                    if released { "released" } else { "was not held" }
                );
                Ok(())
            })
            .once(),
        )?
        .task(
            Task::new("release", |ctx| {
                let release: u64 = ctx.proxy(PROXY_NEXT_RELEASE, ())?;
                ctx.host_mut().config_mut().set("release", release);
                println!("[{}] release {release}", ctx.host().alias());
                Ok(())
            })
            .once_per_node(),
        )?
        .task(
            Task::new("deploy", |ctx| {
                let command = ctx
                    .host()
                    .config()
                    .get_str("deploy_cmd")
                    .unwrap_or("echo deploying {{alias}} to {{hostname}}")
                    .to_string();
                ctx.run_local(&command)?;
                ctx.host_mut().config_mut().set("deployed", true);
                Ok(())
            })
            .limit(2),
        )?;

    Ok(recipe)
}

fn register_proxies(recipe: &mut Recipe) {
    let holder: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let state = Arc::clone(&holder);
    recipe
        .proxies
        .register(PROXY_LOCK, move |ctx: &mut Context<'_>, _: ()| {
            let mut held = state.lock().unwrap_or_else(PoisonError::into_inner);
            let caller = ctx.host().alias().to_string();
            let holder = held.get_or_insert_with(|| caller.clone()).clone();
            Ok(LockAnswer {
                acquired: holder == caller,
                holder,
            })
        });

    let unlock = holder;
    recipe
        .proxies
        .register(PROXY_UNLOCK, move |_: &mut Context<'_>, _: ()| {
            Ok(unlock
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .is_some())
        });

    // Release numbers are counted per node; the caller remembers its last one.
    let releases: Mutex<HashMap<String, u64>> = Mutex::new(HashMap::new());
    recipe
        .proxies
        .register(PROXY_NEXT_RELEASE, move |ctx: &mut Context<'_>, _: ()| {
            let node = ctx.host().node_key();
            let mut releases = releases.lock().unwrap_or_else(PoisonError::into_inner);
            let next = releases.entry(node).or_insert(0);
            *next += 1;
            let next = *next;
            ctx.host_mut().config_mut().set("last_release", next);
            Ok(next)
        });
}
