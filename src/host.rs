use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Config key holding a host's labels (a mapping of string to string).
pub const LABELS_KEY: &str = "labels";

/// Label used to group hosts that share a physical node.
pub const NODE_LABEL: &str = "node";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("host '{0}' not found")]
    NotFound(String),

    #[error("duplicate host alias '{0}'")]
    Duplicate(String),
}

/// Mutable, insertion-ordered configuration store of a host.
///
/// `set` records the key as changed; only changed keys are saved back to the
/// master, so values written there meanwhile by proxies are not reverted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    values: Map<String, Value>,
    #[serde(skip)]
    changed: BTreeSet<String>,
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self {
            values,
            changed: BTreeSet::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.values.insert(key.clone(), value.into());
        self.changed.insert(key);
    }

    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn mark_clean(&mut self) {
        self.changed.clear();
    }

    /// Keys set since the last [`Config::mark_clean`], with their current values.
    pub fn changes(&self) -> Map<String, Value> {
        self.changed
            .iter()
            .filter_map(|key| Some((key.clone(), self.values.get(key)?.clone())))
            .collect()
    }

    /// Merge a snapshot: keys present in `snapshot` overwrite, all others are kept.
    pub fn update(&mut self, snapshot: Map<String, Value>) {
        for (key, value) in snapshot {
            self.values.insert(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// A deployment target: stable alias, address and mutable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    alias: String,
    hostname: String,
    #[serde(default)]
    config: Config,
}

impl Host {
    /// New host whose hostname defaults to its alias.
    pub fn new(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            hostname: alias.clone(),
            alias,
            config: Config::new(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = match self.config.values.remove(LABELS_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        labels.insert(key.into(), Value::String(value.into()));
        self.config
            .values
            .insert(LABELS_KEY.to_string(), Value::Object(labels));
        self
    }

    /// Builder-style config entry; does not mark the store dirty.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.values.insert(key.into(), value.into());
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn label(&self, key: &str) -> Option<String> {
        let value = self.config.get(LABELS_KEY)?.as_object()?.get(key)?;
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Grouping key for once-per-node tasks: the `node` label, else the hostname.
    pub fn node_key(&self) -> String {
        self.label(NODE_LABEL)
            .unwrap_or_else(|| self.hostname.clone())
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.alias)
    }
}

/// Canonical, ordered set of hosts keyed by alias.
#[derive(Debug, Clone, Default)]
pub struct HostCollection {
    hosts: Vec<Host>,
}

impl HostCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hosts(hosts: impl IntoIterator<Item = Host>) -> Result<Self, HostError> {
        let mut collection = Self::new();
        for host in hosts {
            collection.insert(host)?;
        }
        Ok(collection)
    }

    pub fn insert(&mut self, host: Host) -> Result<(), HostError> {
        if self.contains(host.alias()) {
            return Err(HostError::Duplicate(host.alias.clone()));
        }
        self.hosts.push(host);
        Ok(())
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.hosts.iter().any(|h| h.alias == alias)
    }

    pub fn get(&self, alias: &str) -> Result<&Host, HostError> {
        self.hosts
            .iter()
            .find(|h| h.alias == alias)
            .ok_or_else(|| HostError::NotFound(alias.to_string()))
    }

    pub fn get_mut(&mut self, alias: &str) -> Result<&mut Host, HostError> {
        self.hosts
            .iter_mut()
            .find(|h| h.alias == alias)
            .ok_or_else(|| HostError::NotFound(alias.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.alias.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
