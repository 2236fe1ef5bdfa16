use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use fleet::bundled;
use fleet::host::HostCollection;
use fleet::inventory::Inventory;
use fleet::master::{Master, MasterOptions};
use fleet::messenger::ConsoleMessenger;
use fleet::output::Console;
use fleet::planner::Planner;
use fleet::recipe::Recipe;
use fleet::schema::schema_json;
use fleet::selector::{LabelSelector, Selector};
use fleet::task::Concurrency;
use fleet::worker;

/// Fleet: run named tasks over a set of hosts, one worker process per host.
#[derive(Parser, Debug)]
#[command(name = "fleet", version)]
#[command(about = "Run tasks over a fleet of hosts", long_about = None)]
struct Cli {
    /// Inventory file describing the hosts
    #[arg(
        long,
        short = 'i',
        global = true,
        env = "FLEET_INVENTORY",
        default_value = "inventory.yaml"
    )]
    inventory: PathBuf,

    /// More output: -v progress, -vvv debug logging
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Force decorated output
    #[arg(long, global = true, conflicts_with = "no_ansi")]
    ansi: bool,

    /// Disable decorated output
    #[arg(long, global = true)]
    no_ansi: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run tasks in order over the inventory hosts
    Run {
        /// Task names
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Only hosts matching this selector (e.g. `role=web&node!=n2`)
        #[arg(long, short = 's')]
        select: Option<String>,

        /// Global concurrency limit; overrides the inventory
        #[arg(long, short = 'l')]
        limit: Option<usize>,

        /// Print which hosts would run each step and exit
        #[arg(long)]
        plan: bool,
    },

    /// Run one task for one host (spawned by the master)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        task: String,

        #[arg(long)]
        host: String,

        #[arg(long)]
        port: u16,
    },

    /// List the available tasks
    List,

    /// Print the inventory JSON schema
    Schema,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 | 2 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match real_main(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            print_error_chain(&err);
            std::process::exit(1);
        }
    }
}

fn real_main(cli: Cli) -> Result<i32> {
    let decorated = if cli.ansi {
        true
    } else if cli.no_ansi {
        false
    } else {
        std::io::stdout().is_terminal()
    };

    match cli.command {
        Command::Run {
            ref tasks,
            ref select,
            limit,
            plan,
        } => {
            let inventory = Inventory::load(&cli.inventory)?;
            let limit = limit.or(inventory.limit);
            let recipe = bundled::recipe(inventory.into_hosts()?)?;
            let tasks = recipe.tasks.resolve(tasks)?;
            let aliases = select_hosts(&recipe.hosts, select.as_deref())?;
            debug!(tasks = ?tasks.iter().map(|t| t.name()).collect::<Vec<_>>(), hosts = ?aliases, "run");

            let program = std::env::current_exe().context("locate the fleet executable")?;
            let mut options = MasterOptions::from_env(program);
            options.limit = limit;
            options.verbosity = cli.verbose;
            options.decorated = decorated;
            options.worker_args = vec!["--inventory".into(), cli.inventory.clone().into()];

            let console = Console::stdout(decorated, options.ci);
            let Recipe { hosts, proxies, .. } = recipe;
            let mut master = Master::new(
                hosts,
                proxies,
                Arc::new(ConsoleMessenger::new(cli.verbose)),
                console,
                options,
            );

            if plan {
                let mut planner = Planner::new();
                master.run(&tasks, &aliases, Some(&mut planner))?;
                print!("{}", planner.render());
                return Ok(0);
            }
            master.run(&tasks, &aliases, None)
        }
        Command::Worker {
            ref task,
            ref host,
            port,
        } => {
            let inventory = Inventory::load(&cli.inventory)?;
            let recipe = bundled::recipe(inventory.into_hosts()?)?;
            let messenger = ConsoleMessenger::new(cli.verbose);
            worker::run_worker(&recipe, task, host, port, &messenger)
        }
        Command::List => {
            let recipe = bundled::recipe(HostCollection::new())?;
            let width = recipe.tasks.iter().map(|t| t.name().len()).max().unwrap_or(0);
            for task in recipe.tasks.iter() {
                let policy = match task.concurrency() {
                    Concurrency::Parallel { limit: None } => "parallel".to_string(),
                    Concurrency::Parallel { limit: Some(n) } => format!("parallel (limit {n})"),
                    Concurrency::Once => "once".to_string(),
                    Concurrency::OncePerNode => "once per node".to_string(),
                };
                match task.selector() {
                    Some(expr) => println!("{:<width$}  {policy}  [{expr}]", task.name()),
                    None => println!("{:<width$}  {policy}", task.name()),
                }
            }
            Ok(0)
        }
        Command::Schema => {
            let text = serde_json::to_string_pretty(schema_json())
                .context("serialize inventory schema")?;
            println!("{text}");
            Ok(0)
        }
    }
}

fn select_hosts(hosts: &HostCollection, select: Option<&str>) -> Result<Vec<String>> {
    let Some(expr) = select else {
        return Ok(hosts.aliases());
    };
    let mut aliases = Vec::new();
    for host in hosts.iter() {
        if LabelSelector.matches(expr, host)? {
            aliases.push(host.alias().to_string());
        }
    }
    if aliases.is_empty() {
        bail!("no hosts match '{expr}'");
    }
    Ok(aliases)
}
