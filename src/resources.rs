//! Monitoring resources: commands, monitoring groups, monitors and nodes.
//!
//! The registry owns every resource by name; membership between groups,
//! monitors and nodes is kept as name sets on both sides.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::ResourceError;
use crate::models::TaskContext;

const RESERVED_ATTRIBUTES: [&str; 5] = ["name", "address", "node_monitor", "monitoring_groups", "command_string"];

fn default_command_type() -> String {
  "active".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
  pub command_string: String,
  #[serde(default = "default_command_type")]
  pub command_type: String,
  #[serde(flatten)]
  pub extra: TaskContext,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupSpec {
  pub realm: Option<String>,
  pub monitors: Vec<String>,
  pub nodes: Vec<String>,
  #[serde(flatten)]
  pub extra: TaskContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSpec {
  pub command: String,
  #[serde(default)]
  pub realm: Option<String>,
  #[serde(default)]
  pub monitoring_groups: Vec<String>,
  #[serde(flatten)]
  pub extra: TaskContext,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
  pub realm: Option<String>,
  pub address: Option<String>,
  pub node_monitor: Option<String>,
  pub monitoring_groups: Vec<String>,
  #[serde(flatten)]
  pub extra: TaskContext,
}

/// Layout of the resources document. Entries may be `null` when a resource
/// has no attributes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourcesDocument {
  pub commands: BTreeMap<String, CommandSpec>,
  pub monitoring_groups: BTreeMap<String, Option<GroupSpec>>,
  pub monitors: BTreeMap<String, MonitorSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodesDocument {
  pub nodes: BTreeMap<String, Option<NodeSpec>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
  pub name: String,
  pub command_string: String,
  pub command_type: String,
  pub extra: TaskContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringGroup {
  pub name: String,
  pub realm: Option<String>,
  pub monitors: BTreeSet<String>,
  pub nodes: BTreeSet<String>,
  pub extra: TaskContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Monitor {
  pub name: String,
  pub command: String,
  pub realm: Option<String>,
  pub monitoring_groups: BTreeSet<String>,
  pub extra: TaskContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  pub name: String,
  pub realm: Option<String>,
  pub address: String,
  pub node_monitor: Option<String>,
  pub monitoring_groups: BTreeSet<String>,
  pub extra: TaskContext,
}

fn optional(value: &Option<String>) -> Value {
  value.clone().map(Value::String).unwrap_or(Value::Null)
}

fn with_extra(mut context: TaskContext, extra: &TaskContext) -> TaskContext {
  for (k, v) in extra {
    context.insert(k.clone(), v.clone());
  }
  context
}

impl Command {
  fn context(&self) -> TaskContext {
    let mut context = TaskContext::new();
    context.insert("name".into(), self.name.clone().into());
    context.insert("command_type".into(), self.command_type.clone().into());
    context.insert("command_string".into(), self.command_string.clone().into());
    with_extra(context, &self.extra)
  }
}

impl MonitoringGroup {
  fn context(&self) -> TaskContext {
    let mut context = TaskContext::new();
    context.insert("name".into(), self.name.clone().into());
    context.insert("realm".into(), optional(&self.realm));
    with_extra(context, &self.extra)
  }
}

impl Monitor {
  fn context(&self) -> TaskContext {
    let mut context = TaskContext::new();
    context.insert("name".into(), self.name.clone().into());
    context.insert("realm".into(), optional(&self.realm));
    with_extra(context, &self.extra)
  }
}

impl Node {
  fn context(&self) -> TaskContext {
    let mut context = TaskContext::new();
    context.insert("name".into(), self.name.clone().into());
    context.insert("realm".into(), optional(&self.realm));
    context.insert("address".into(), self.address.clone().into());
    context.insert("node_monitor".into(), optional(&self.node_monitor));
    with_extra(context, &self.extra)
  }
}

fn check_reserved(name: &str, extra: &TaskContext) -> Result<(), ResourceError> {
  let used: Vec<&str> = RESERVED_ATTRIBUTES
    .iter()
    .copied()
    .filter(|attr| extra.contains_key(*attr))
    .collect();
  if used.is_empty() {
    return Ok(());
  }
  Err(ResourceError::Reserved { name: name.to_string(), attributes: used.join(", ") })
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
  commands: BTreeMap<String, Command>,
  groups: BTreeMap<String, MonitoringGroup>,
  monitors: BTreeMap<String, Monitor>,
  nodes: BTreeMap<String, Node>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Loads commands, then monitoring groups, then monitors.
  pub fn from_document(document: ResourcesDocument) -> Result<Self, ResourceError> {
    let mut registry = Registry::new();
    for (name, spec) in document.commands {
      registry.add_command(&name, spec)?;
    }
    for (name, spec) in document.monitoring_groups {
      registry.add_group(&name, spec.unwrap_or_default())?;
    }
    for (name, spec) in document.monitors {
      registry.add_monitor(&name, spec)?;
    }
    Ok(registry)
  }

  pub fn command(&self, name: &str) -> Option<&Command> {
    self.commands.get(name)
  }

  pub fn group(&self, name: &str) -> Option<&MonitoringGroup> {
    self.groups.get(name)
  }

  pub fn monitor(&self, name: &str) -> Option<&Monitor> {
    self.monitors.get(name)
  }

  pub fn node(&self, name: &str) -> Option<&Node> {
    self.nodes.get(name)
  }

  pub fn nodes(&self) -> impl Iterator<Item = &Node> {
    self.nodes.values()
  }

  pub fn add_command(&mut self, name: &str, spec: CommandSpec) -> Result<(), ResourceError> {
    check_reserved(name, &spec.extra)?;
    if self.commands.contains_key(name) {
      return Err(ResourceError::Duplicate { kind: "command", name: name.to_string() });
    }
    debug!("Registering command '{}'", name);
    self.commands.insert(
      name.to_string(),
      Command {
        name: name.to_string(),
        command_string: spec.command_string,
        command_type: spec.command_type,
        extra: spec.extra,
      },
    );
    Ok(())
  }

  pub fn add_group(&mut self, name: &str, spec: GroupSpec) -> Result<(), ResourceError> {
    check_reserved(name, &spec.extra)?;
    if self.groups.contains_key(name) {
      return Err(ResourceError::Duplicate { kind: "monitoring group", name: name.to_string() });
    }
    debug!("Registering monitoring group '{}'", name);
    self.groups.insert(
      name.to_string(),
      MonitoringGroup {
        name: name.to_string(),
        realm: spec.realm,
        monitors: BTreeSet::new(),
        nodes: BTreeSet::new(),
        extra: spec.extra,
      },
    );
    for monitor in &spec.monitors {
      self.link_monitor(name, monitor)?;
    }
    for node in &spec.nodes {
      self.link_node(name, node)?;
    }
    Ok(())
  }

  pub fn add_monitor(&mut self, name: &str, spec: MonitorSpec) -> Result<(), ResourceError> {
    check_reserved(name, &spec.extra)?;
    if self.monitors.contains_key(name) {
      return Err(ResourceError::Duplicate { kind: "monitor", name: name.to_string() });
    }
    if !self.commands.contains_key(&spec.command) {
      return Err(ResourceError::UnknownReference {
        kind: "command",
        name: spec.command,
        referenced_by: name.to_string(),
      });
    }
    self.ensure_groups(name, &spec.monitoring_groups)?;
    debug!("Registering monitor '{}'", name);
    self.monitors.insert(
      name.to_string(),
      Monitor {
        name: name.to_string(),
        command: spec.command,
        realm: spec.realm,
        monitoring_groups: BTreeSet::new(),
        extra: spec.extra,
      },
    );
    for group in &spec.monitoring_groups {
      self.link_monitor(group, name)?;
    }
    Ok(())
  }

  pub fn add_node(&mut self, name: &str, spec: NodeSpec) -> Result<(), ResourceError> {
    check_reserved(name, &spec.extra)?;
    if self.nodes.contains_key(name) {
      return Err(ResourceError::Duplicate { kind: "node", name: name.to_string() });
    }
    self.ensure_groups(name, &spec.monitoring_groups)?;
    debug!("Registering node '{}'", name);
    self.nodes.insert(
      name.to_string(),
      Node {
        name: name.to_string(),
        realm: spec.realm,
        address: spec.address.unwrap_or_else(|| name.to_string()),
        node_monitor: spec.node_monitor,
        monitoring_groups: BTreeSet::new(),
        extra: spec.extra,
      },
    );
    for group in &spec.monitoring_groups {
      self.link_node(group, name)?;
    }
    Ok(())
  }

  /// Replaces every node, dropping their group memberships first. Nodes that
  /// fail validation are logged and left out; their errors are returned.
  pub fn replace_nodes(&mut self, nodes: BTreeMap<String, Option<NodeSpec>>) -> Vec<ResourceError> {
    self.nodes.clear();
    for group in self.groups.values_mut() {
      group.nodes.clear();
    }
    let mut rejected = Vec::new();
    for (name, spec) in nodes {
      if let Err(e) = self.add_node(&name, spec.unwrap_or_default()) {
        error!("Skipping node '{}': {}", name, e);
        rejected.push(e);
      }
    }
    info!("Loaded {} nodes", self.nodes.len());
    rejected
  }

  fn ensure_groups(&self, referenced_by: &str, groups: &[String]) -> Result<(), ResourceError> {
    match groups.iter().find(|g| !self.groups.contains_key(*g)) {
      Some(missing) => Err(ResourceError::UnknownReference {
        kind: "monitoring group",
        name: missing.clone(),
        referenced_by: referenced_by.to_string(),
      }),
      None => Ok(()),
    }
  }

  fn link_monitor(&mut self, group: &str, monitor: &str) -> Result<(), ResourceError> {
    let Some(m) = self.monitors.get_mut(monitor) else {
      return Err(ResourceError::UnknownReference {
        kind: "monitor",
        name: monitor.to_string(),
        referenced_by: group.to_string(),
      });
    };
    let Some(g) = self.groups.get_mut(group) else {
      return Err(ResourceError::UnknownReference {
        kind: "monitoring group",
        name: group.to_string(),
        referenced_by: monitor.to_string(),
      });
    };
    m.monitoring_groups.insert(group.to_string());
    g.monitors.insert(monitor.to_string());
    Ok(())
  }

  fn link_node(&mut self, group: &str, node: &str) -> Result<(), ResourceError> {
    let Some(n) = self.nodes.get_mut(node) else {
      return Err(ResourceError::UnknownReference {
        kind: "node",
        name: node.to_string(),
        referenced_by: group.to_string(),
      });
    };
    let Some(g) = self.groups.get_mut(group) else {
      return Err(ResourceError::UnknownReference {
        kind: "monitoring group",
        name: group.to_string(),
        referenced_by: node.to_string(),
      });
    };
    n.monitoring_groups.insert(group.to_string());
    g.nodes.insert(node.to_string());
    Ok(())
  }

  /// Task context for running `monitor` against `node` as a member of
  /// `group`. Each resource's attributes are nested under its own key
  /// (`monitoring_group`, `node`, `monitor`, `command`) and also flattened
  /// into the top level, later resources winning. Command attributes only
  /// fill keys nothing else set. `name` is never flattened.
  pub fn build_context(&self, group: &str, node: &str, monitor: &str) -> Result<TaskContext, ResourceError> {
    let unknown = |kind, name: &str| ResourceError::UnknownReference {
      kind,
      name: name.to_string(),
      referenced_by: node.to_string(),
    };
    let g = self.groups.get(group).ok_or_else(|| unknown("monitoring group", group))?;
    let n = self.nodes.get(node).ok_or_else(|| unknown("node", node))?;
    let m = self.monitors.get(monitor).ok_or_else(|| unknown("monitor", monitor))?;
    let c = self.commands.get(&m.command).ok_or_else(|| unknown("command", &m.command))?;

    let mut context = TaskContext::new();
    for (key, inner) in [
      ("monitoring_group", g.context()),
      ("node", n.context()),
      ("monitor", m.context()),
    ] {
      for (k, v) in &inner {
        if k != "name" {
          context.insert(k.clone(), v.clone());
        }
      }
      context.insert(key.to_string(), Value::Object(inner));
    }
    let command = c.context();
    for (k, v) in &command {
      if k != "name" && !context.contains_key(k) {
        context.insert(k.clone(), v.clone());
      }
    }
    context.insert("command".to_string(), Value::Object(command));
    Ok(context)
  }

  /// Every (group, monitor) pairing for one node, in name order.
  pub fn node_tasks(&self, node: &str) -> Result<Vec<TaskContext>, ResourceError> {
    let n = self.nodes.get(node).ok_or_else(|| ResourceError::UnknownReference {
      kind: "node",
      name: node.to_string(),
      referenced_by: "scheduler".to_string(),
    })?;
    let mut tasks = Vec::new();
    for group in &n.monitoring_groups {
      let Some(g) = self.groups.get(group) else {
        continue;
      };
      for monitor in &g.monitors {
        tasks.push(self.build_context(group, node, monitor)?);
      }
    }
    Ok(tasks)
  }

  /// Task contexts keyed by node name.
  pub fn tasks_by_node(&self) -> Result<BTreeMap<String, Vec<TaskContext>>, ResourceError> {
    self
      .nodes
      .keys()
      .map(|name| Ok((name.clone(), self.node_tasks(name)?)))
      .collect()
  }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ResourceError> {
  let load_error = |reason: String| ResourceError::Load { path: path.display().to_string(), reason };
  let raw = tokio::fs::read(path).await.map_err(|e| load_error(e.to_string()))?;
  serde_json::from_slice(&raw).map_err(|e| load_error(e.to_string()))
}

pub async fn load_resources(path: &Path) -> Result<Registry, ResourceError> {
  info!("Loading resources from {}", path.display());
  let document: ResourcesDocument = read_json(path).await?;
  Registry::from_document(document)
}

/// Source of the node inventory.
#[async_trait]
pub trait NodeBackend: Send + Sync {
  async fn load_nodes(&self) -> Result<BTreeMap<String, Option<NodeSpec>>, ResourceError>;
}

pub struct JsonNodeBackend {
  path: PathBuf,
}

impl JsonNodeBackend {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

#[async_trait]
impl NodeBackend for JsonNodeBackend {
  async fn load_nodes(&self) -> Result<BTreeMap<String, Option<NodeSpec>>, ResourceError> {
    let document: NodesDocument = read_json(&self.path).await?;
    debug!("Loaded {} nodes from {}", document.nodes.len(), self.path.display());
    Ok(document.nodes)
  }
}

/// Fixed node inventory, for single-process runs and tests.
pub struct StaticNodeBackend {
  nodes: BTreeMap<String, Option<NodeSpec>>,
}

impl StaticNodeBackend {
  pub fn new(nodes: BTreeMap<String, Option<NodeSpec>>) -> Self {
    Self { nodes }
  }
}

#[async_trait]
impl NodeBackend for StaticNodeBackend {
  async fn load_nodes(&self) -> Result<BTreeMap<String, Option<NodeSpec>>, ResourceError> {
    Ok(self.nodes.clone())
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use serde_json::json;

  pub(crate) fn registry() -> Registry {
    let document: ResourcesDocument = serde_json::from_value(json!({
      "commands": {
        "check_http": {"command_string": "check_http -H {{ address }} -p {{ port }}", "port": 80},
        "check_passive": {"command_string": "true", "command_type": "passive"},
      },
      "monitoring_groups": {
        "web": {"realm": "prod"},
        "all": null,
      },
      "monitors": {
        "http": {"command": "check_http", "monitoring_groups": ["web"]},
        "heartbeat": {"command": "check_passive", "monitoring_groups": ["all", "web"]},
      },
    }))
    .unwrap();
    Registry::from_document(document).unwrap()
  }

  fn nodes(value: serde_json::Value) -> BTreeMap<String, Option<NodeSpec>> {
    serde_json::from_value::<NodesDocument>(value).unwrap().nodes
  }

  #[test]
  fn monitors_link_to_groups_both_ways() {
    let registry = registry();
    let web = registry.group("web").unwrap();
    assert_eq!(web.monitors.iter().collect::<Vec<_>>(), vec!["heartbeat", "http"]);
    assert!(registry.monitor("heartbeat").unwrap().monitoring_groups.contains("all"));
  }

  #[test]
  fn unknown_references_are_errors() {
    let mut registry = registry();
    let spec = MonitorSpec {
      command: "check_ping".into(),
      realm: None,
      monitoring_groups: vec![],
      extra: TaskContext::new(),
    };
    assert!(matches!(
      registry.add_monitor("ping", spec),
      Err(ResourceError::UnknownReference { kind: "command", .. })
    ));

    let spec = NodeSpec { monitoring_groups: vec!["db".into()], ..Default::default() };
    assert!(matches!(registry.add_node("db1", spec), Err(ResourceError::UnknownReference { .. })));
  }

  #[test]
  fn reserved_and_duplicate_names_are_rejected() {
    let mut registry = registry();
    let mut extra = TaskContext::new();
    extra.insert("name".into(), json!("other"));
    let spec = GroupSpec { extra, ..Default::default() };
    assert!(matches!(registry.add_group("db", spec), Err(ResourceError::Reserved { .. })));
    assert!(matches!(
      registry.add_group("web", GroupSpec::default()),
      Err(ResourceError::Duplicate { .. })
    ));
  }

  #[test]
  fn context_nests_and_flattens_resources() {
    let mut registry = registry();
    assert!(registry.replace_nodes(nodes(json!({"nodes": {"www1": {"monitoring_groups": ["web"], "port": 8080}}}))).is_empty());

    let context = registry.build_context("web", "www1", "http").unwrap();
    assert_eq!(context["node"]["name"], json!("www1"));
    assert_eq!(context["node"]["address"], json!("www1"));
    assert_eq!(context["monitor"]["name"], json!("http"));
    assert_eq!(context["monitoring_group"]["realm"], json!("prod"));
    assert_eq!(context["command"]["command_type"], json!("active"));
    assert_eq!(context["address"], json!("www1"));
    assert_eq!(context["port"], json!(8080));
    assert_eq!(context["command"]["port"], json!(80));
    assert!(!context.contains_key("name"));
  }

  #[test]
  fn command_attributes_are_defaults() {
    let mut registry = registry();
    assert!(registry.replace_nodes(nodes(json!({"nodes": {
        "www1": {"monitoring_groups": ["web"]},
        "www2": {"monitoring_groups": ["web"], "port": 8080},
      }}))).is_empty());

    let www1 = registry.build_context("web", "www1", "http").unwrap();
    let www2 = registry.build_context("web", "www2", "http").unwrap();
    assert_eq!(www1["port"], json!(80));
    assert_eq!(
      crate::executor::render("check_http -H {{ address }} -p {{ port }}", &www2).unwrap(),
      "check_http -H www2 -p 8080"
    );
  }

  #[test]
  fn node_tasks_cover_every_group_monitor_pair() {
    let mut registry = registry();
    assert!(registry.replace_nodes(nodes(json!({"nodes": {
        "www1": {"monitoring_groups": ["web", "all"]},
        "db1": {"monitoring_groups": ["all"]},
        "idle": null,
      }}))).is_empty());

    let tasks = registry.tasks_by_node().unwrap();
    assert_eq!(tasks["www1"].len(), 3);
    assert_eq!(tasks["db1"].len(), 1);
    assert!(tasks["idle"].is_empty());
    assert_eq!(tasks["db1"][0]["monitor"]["name"], json!("heartbeat"));
  }

  #[test]
  fn node_with_unknown_group_is_skipped() {
    let mut registry = registry();
    let rejected = registry.replace_nodes(nodes(json!({"nodes": {
      "www1": {"monitoring_groups": ["web"]},
      "typo": {"monitoring_groups": ["wbe"]},
    }})));
    assert_eq!(rejected.len(), 1);
    assert!(matches!(&rejected[0], ResourceError::UnknownReference { name, .. } if name == "wbe"));
    assert!(registry.node("typo").is_none());
    assert!(registry.node("www1").is_some());
    assert_eq!(registry.tasks_by_node().unwrap().len(), 1);
  }

  #[test]
  fn replacing_nodes_drops_old_memberships() {
    let mut registry = registry();
    assert!(registry.replace_nodes(nodes(json!({"nodes": {"www1": {"monitoring_groups": ["web"]}}}))).is_empty());
    assert!(registry.replace_nodes(nodes(json!({"nodes": {"www2": {"monitoring_groups": ["web"]}}}))).is_empty());
    assert!(registry.node("www1").is_none());
    assert_eq!(registry.group("web").unwrap().nodes.iter().collect::<Vec<_>>(), vec!["www2"]);
  }

  #[tokio::test]
  async fn static_backend_returns_its_nodes() {
    let backend = StaticNodeBackend::new(nodes(json!({"nodes": {"www1": null}})));
    assert!(backend.load_nodes().await.unwrap().contains_key("www1"));
  }
}
