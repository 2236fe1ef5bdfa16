//! `fleet` task orchestration library.
//!
//! A master process runs named tasks over a collection of hosts. Each host is
//! handled by a worker process that re-enters the same binary, fetches its
//! host state from the master over a loopback rpc channel, runs the task body
//! and saves changed state back. Parallelism is bounded per task and globally;
//! the first failing host aborts the run.
//!
//! Layout:
//! - `host`, `selector`, `task`, `recipe`: the data model
//! - `context`, `proxy`, `rpc`: what task bodies can reach and how
//! - `master`, `worker`, `process`: dispatch and execution
//! - `messenger`, `planner`, `output`: progress and dry-run reporting
//! - `inventory`, `schema`, `bundled`: what the `fleet` binary runs

pub mod bundled;
pub mod context;
pub mod host;
pub mod inventory;
pub mod master;
pub mod messenger;
pub mod output;
pub mod planner;
pub mod process;
pub mod proxy;
pub mod recipe;
pub mod rpc;
pub mod schema;
pub mod selector;
pub mod shell;
pub mod task;
pub mod worker;
