use std::collections::BTreeMap;

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::context::{Context, MasterLink};
use crate::host::{Host, HostCollection};
use crate::rpc::RpcError;

type Handler = Box<dyn Fn(&mut Context<'_>, Value) -> anyhow::Result<Value> + Send + Sync>;

/// Closed set of master-side functions workers may call by name.
#[derive(Default)]
pub struct ProxyRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler. Arguments and results travel as JSON.
    pub fn register<A, R, F>(&mut self, name: impl Into<String>, handler: F)
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&mut Context<'_>, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let wrapped: Handler = Box::new(
            move |ctx: &mut Context<'_>, raw: Value| -> anyhow::Result<Value> {
                let args: A = serde_json::from_value(raw)
                    .with_context(|| format!("invalid arguments for '{label}'"))?;
                let out = handler(ctx, args)?;
                serde_json::to_value(out)
                    .with_context(|| format!("failed to encode result of '{label}'"))
            },
        );
        self.handlers.insert(name, wrapped);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn call(&self, name: &str, ctx: &mut Context<'_>, arguments: Value) -> Result<Value, RpcError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| RpcError::UnknownFunction(name.to_string()))?;
        handler(ctx, arguments).map_err(|err| RpcError::Handler {
            function: name.to_string(),
            message: format!("{err:#}"),
        })
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Link used when host logic runs inside the master process itself.
pub struct InProcessLink<'a> {
    hosts: &'a mut HostCollection,
    proxies: &'a ProxyRegistry,
}

impl<'a> InProcessLink<'a> {
    pub fn new(hosts: &'a mut HostCollection, proxies: &'a ProxyRegistry) -> Self {
        Self { hosts, proxies }
    }
}

impl MasterLink for InProcessLink<'_> {
    fn load(&mut self, alias: &str) -> Result<Host, RpcError> {
        Ok(self.hosts.get(alias)?.clone())
    }

    fn save(&mut self, alias: &str, config: Map<String, Value>) -> Result<(), RpcError> {
        self.hosts.get_mut(alias)?.config_mut().update(config);
        Ok(())
    }

    fn proxy(&mut self, alias: &str, function: &str, arguments: Value) -> Result<Value, RpcError> {
        invoke(self.hosts, self.proxies, alias, function, arguments)
    }
}

/// Run a registered function bound to the canonical host `alias`.
///
/// Config changes the handler makes are written back to the canonical host
/// once the binding is released, and only when the handler succeeded.
pub fn invoke(
    hosts: &mut HostCollection,
    proxies: &ProxyRegistry,
    alias: &str,
    function: &str,
    arguments: Value,
) -> Result<Value, RpcError> {
    if !proxies.contains(function) {
        return Err(RpcError::UnknownFunction(function.to_string()));
    }
    let host = hosts.get(alias)?.clone();
    debug!(host = alias, function, "proxy call");

    let mut link = InProcessLink::new(hosts, proxies);
    let mut ctx = Context::new(host).with_link(&mut link);
    let answer = proxies.call(function, &mut ctx, arguments);
    let host = ctx.into_root();

    let answer = answer?;
    if host.config().is_dirty() {
        link.save(alias, host.config().changes())?;
    }
    Ok(answer)
}
