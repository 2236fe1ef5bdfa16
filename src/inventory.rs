use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::host::{Host, HostCollection};
use crate::schema::validate_inventory_yaml;

/// Inventory file: global options plus the hosts, in file order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    /// Global concurrency limit; absent or 0 runs every host of a chunk at once.
    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub hosts: Vec<HostSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HostSpec {
    pub alias: String,

    /// Defaults to the alias.
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Inventory {
    /// Read, schema-check and parse an inventory file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read inventory file: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid inventory: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        validate_inventory_yaml(text)?;
        serde_yaml::from_str(text).context("parse inventory yaml")
    }

    pub fn into_hosts(self) -> Result<HostCollection> {
        let mut hosts = HostCollection::new();
        for spec in self.hosts {
            hosts.insert(spec.into_host())?;
        }
        Ok(hosts)
    }
}

impl HostSpec {
    fn into_host(self) -> Host {
        let mut host = Host::new(&self.alias);
        if let Some(hostname) = self.hostname {
            host = host.with_hostname(hostname);
        }
        for (key, value) in self.config {
            host = host.with_config(key, value);
        }
        for (key, value) in self.labels {
            host = host.with_label(key, value);
        }
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
limit: 2
hosts:
  - alias: web1
    hostname: 10.0.0.1
    labels: { role: web, node: n1 }
    config: { deploy_path: /srv/app }
  - alias: db1
"#;

    #[test]
    fn hosts_keep_file_order_and_defaults() {
        let inventory = Inventory::parse(SAMPLE).unwrap();
        assert_eq!(inventory.limit, Some(2));

        let hosts = inventory.into_hosts().unwrap();
        assert_eq!(hosts.aliases(), vec!["web1", "db1"]);

        let web = hosts.get("web1").unwrap();
        assert_eq!(web.hostname(), "10.0.0.1");
        assert_eq!(web.label("role").as_deref(), Some("web"));
        assert_eq!(web.node_key(), "n1");
        assert_eq!(web.config().get_str("deploy_path"), Some("/srv/app"));
        assert!(!web.config().is_dirty());

        assert_eq!(hosts.get("db1").unwrap().hostname(), "db1");
    }

    #[test]
    fn duplicate_aliases_are_rejected() {
        let text = "hosts:\n  - alias: a\n  - alias: a\n";
        let err = Inventory::parse(text).unwrap().into_hosts().unwrap_err();
        assert!(err.to_string().contains('a'), "{err}");
    }
}
