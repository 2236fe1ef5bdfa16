use std::sync::Arc;

use fleet::context::Context;
use fleet::host::{Host, HostCollection};
use fleet::master::{Master, MasterOptions, ENV_CI, ENV_LOCAL_WORKER};
use fleet::messenger::Recorder;
use fleet::output::Console;
use fleet::planner::Planner;
use fleet::recipe::Recipe;
use fleet::task::{Task, TaskError};
use serde_json::json;

mod helpers;
use helpers::EnvVarGuard;

fn web_fleet() -> HostCollection {
    HostCollection::from_hosts(vec![
        Host::new("web1").with_label("node", "n1").with_label("role", "web"),
        Host::new("web2").with_label("node", "n1").with_label("role", "web"),
        Host::new("web3").with_label("node", "n2").with_label("role", "web"),
        Host::new("db1").with_label("node", "n2").with_label("role", "db"),
    ])
    .expect("unique aliases")
}

fn local_master(recipe: Recipe, limit: Option<usize>) -> (Master, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::new());
    let (console, _) = Console::buffer();
    let mut options = MasterOptions::new("fleet");
    options.local_worker = true;
    options.limit = limit;
    let Recipe { hosts, proxies, .. } = recipe;
    let master = Master::new(hosts, proxies, recorder.clone(), console, options);
    (master, recorder)
}

#[test]
fn options_follow_environment() {
    {
        let _env = EnvVarGuard::set_many(&[(ENV_CI, "1"), (ENV_LOCAL_WORKER, "true")]);
        let options = MasterOptions::from_env("fleet");
        assert!(options.ci);
        assert!(options.local_worker);
    }
    {
        let _env = EnvVarGuard::set_many(&[(ENV_CI, ""), (ENV_LOCAL_WORKER, "yes")]);
        let options = MasterOptions::from_env("fleet");
        assert!(!options.ci);
        assert!(!options.local_worker, "only the literal 'true' enables it");
    }
}

#[test]
fn plan_covers_policies_and_selectors() {
    let (mut master, recorder) = local_master(Recipe::new(web_fleet()), Some(2));
    let tasks = vec![
        Arc::new(Task::new("migrate", |_| Ok(())).once().select("role=db")),
        Arc::new(Task::new("release", |_| Ok(())).once_per_node()),
        Arc::new(Task::new("deploy", |_| Ok(())).select("role=web")),
    ];
    let aliases = master.hosts().aliases();
    let mut planner = Planner::new();

    assert_eq!(master.run(&tasks, &aliases, Some(&mut planner)).unwrap(), 0);

    let steps: Vec<(String, Vec<String>)> = planner
        .steps()
        .iter()
        .map(|s| (s.task.clone(), s.hosts.clone()))
        .collect();
    let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    assert_eq!(
        steps,
        vec![
            ("migrate".to_string(), owned(&["db1"])),
            ("release".to_string(), owned(&["web1", "web3"])),
            ("deploy".to_string(), owned(&["web1", "web2"])),
            ("deploy".to_string(), owned(&["web3"])),
        ]
    );
    assert!(recorder.events().is_empty());
}

#[test]
fn proxy_writes_land_on_canonical_hosts() {
    let mut recipe = Recipe::new(web_fleet());
    recipe
        .proxies
        .register("visits:bump", |ctx: &mut Context<'_>, by: u64| {
            let seen = ctx
                .host()
                .config()
                .get("visits")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            ctx.host_mut().config_mut().set("visits", seen + by);
            Ok(seen + by)
        });
    recipe
        .task(Task::new("visit", |ctx| {
            let total: u64 = ctx.proxy("visits:bump", 2)?;
            if total != 2 {
                return Err(TaskError::exit(5, format!("unexpected total {total}")));
            }
            Ok(())
        }))
        .unwrap();
    let visit = recipe.tasks.get("visit").unwrap();
    let (mut master, recorder) = local_master(recipe, None);
    let aliases = master.hosts().aliases();

    assert_eq!(master.run(&[visit], &aliases, None).unwrap(), 0);

    for host in master.hosts().iter() {
        assert_eq!(host.config().get("visits"), Some(&json!(2)), "{host}");
    }
    assert_eq!(recorder.summary().len(), 2 + aliases.len());
}

#[test]
fn graceful_shutdown_does_not_fail_the_run() {
    let mut recipe = Recipe::new(web_fleet());
    recipe
        .task(Task::new("drain", |ctx| {
            if ctx.host().alias() == "web2" {
                return Err(TaskError::GracefulShutdown("nothing to drain".into()));
            }
            Ok(())
        }))
        .unwrap();
    let drain = recipe.tasks.get("drain").unwrap();
    let (mut master, recorder) = local_master(recipe, Some(1));
    let aliases = master.hosts().aliases();

    assert_eq!(master.run(&[drain], &aliases, None).unwrap(), 0);
    let summary = recorder.summary();
    assert!(!summary.iter().any(|e| e == "host web2"), "{summary:?}");
    assert!(summary.iter().any(|e| e == "host web3"), "{summary:?}");
    assert_eq!(summary.last().map(String::as_str), Some("end drain failed=false"));
}
