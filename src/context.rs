//! Host bindings for code running "as" a host.
//!
//! A [`Context`] always has a root host. [`Context::enter`] binds another host
//! on top of it for the lifetime of the returned [`Scope`]; dropping the scope
//! releases the binding, including on early returns and unwinding, so nested
//! bindings can never outlive the call that created them.

use std::ops::{Deref, DerefMut};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::host::Host;
use crate::rpc::RpcError;
use crate::shell;
use crate::task::TaskError;

/// Channel from code running on behalf of a host back to the master's canonical state.
pub trait MasterLink {
    fn load(&mut self, alias: &str) -> Result<Host, RpcError>;
    fn save(&mut self, alias: &str, config: Map<String, Value>) -> Result<(), RpcError>;
    fn proxy(&mut self, alias: &str, function: &str, arguments: Value)
        -> Result<Value, RpcError>;
}

pub struct Context<'l> {
    root: Host,
    nested: Vec<Host>,
    link: Option<&'l mut dyn MasterLink>,
}

impl<'l> Context<'l> {
    pub fn new(host: Host) -> Self {
        Self {
            root: host,
            nested: Vec::new(),
            link: None,
        }
    }

    pub fn with_link(mut self, link: &'l mut dyn MasterLink) -> Self {
        self.link = Some(link);
        self
    }

    /// Host currently acted as: the innermost binding.
    pub fn host(&self) -> &Host {
        self.nested.last().unwrap_or(&self.root)
    }

    pub fn host_mut(&mut self) -> &mut Host {
        self.nested.last_mut().unwrap_or(&mut self.root)
    }

    /// Number of bindings, root included.
    pub fn depth(&self) -> usize {
        1 + self.nested.len()
    }

    /// Bind `host` until the returned scope is dropped.
    pub fn enter(&mut self, host: Host) -> Scope<'_, 'l> {
        let depth = self.nested.len();
        self.nested.push(host);
        Scope { ctx: self, depth }
    }

    /// Give back the root host, consuming the context.
    pub fn into_root(self) -> Host {
        self.root
    }

    /// Call a registered master-side function as the current host.
    pub fn proxy<A, R>(&mut self, function: &str, arguments: A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let arguments =
            serde_json::to_value(arguments).map_err(|e| RpcError::BadPayload(e.to_string()))?;
        let alias = self.host().alias().to_string();
        let link = self.link.as_deref_mut().ok_or(RpcError::Detached)?;
        let answer = link.proxy(&alias, function, arguments)?;
        serde_json::from_value(answer).map_err(|e| RpcError::BadPayload(e.to_string()))
    }

    /// Fresh snapshot of another host, typically bound with [`Context::enter`].
    pub fn load(&mut self, alias: &str) -> Result<Host, RpcError> {
        let link = self.link.as_deref_mut().ok_or(RpcError::Detached)?;
        link.load(alias)
    }

    /// Write the keys changed on the current host back to the master.
    pub fn save(&mut self) -> Result<(), RpcError> {
        let alias = self.host().alias().to_string();
        let snapshot = self.host().config().changes();
        let link = self.link.as_deref_mut().ok_or(RpcError::Detached)?;
        link.save(&alias, snapshot)?;
        self.host_mut().config_mut().mark_clean();
        Ok(())
    }

    /// Run a shell command on behalf of the current host, echoing its output.
    pub fn run_local(&self, command: &str) -> Result<String, TaskError> {
        shell::run_local(self.host(), command)
    }
}

/// Guard holding one nested host binding.
pub struct Scope<'c, 'l> {
    ctx: &'c mut Context<'l>,
    depth: usize,
}

impl<'l> Deref for Scope<'_, 'l> {
    type Target = Context<'l>;

    fn deref(&self) -> &Self::Target {
        &*self.ctx
    }
}

impl<'l> DerefMut for Scope<'_, 'l> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.ctx
    }
}

impl Drop for Scope<'_, '_> {
    fn drop(&mut self) {
        self.ctx.nested.truncate(self.depth);
    }
}
