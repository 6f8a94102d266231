// apps/flow-kernel/src/catalog.rs
// Purpose: Flow catalog. Parses YAML flow documents, validates DAG
//          well-formedness and precomputes the schedule plan.
// Architecture: Definition Layer
// Dependencies: serde_yaml, semver, DashMap

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::dag::FlowGraph;
use crate::error::EngineError;
use crate::expr;
use crate::models::{FlowDefinition, MergeStrategy, NodeDef, NodeKind};

// === DOCUMENT MODEL ===
// The on-disk shape. Unknown fields are rejected outright.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlowDocument {
    flow_id: String,
    name: String,
    #[serde(default)]
    description: String,
    version: String,
    entry_point: String,
    exit_points: Vec<String>,
    nodes: Vec<NodeDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeDocument {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeTypeTag,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    config: Option<Value>,

    // agent
    agent_id: Option<String>,

    // decision
    condition: Option<String>,
    #[serde(rename = "then")]
    then_node: Option<String>,
    #[serde(rename = "else")]
    else_node: Option<String>,

    // loop
    body: Option<Vec<String>>,
    until: Option<String>,
    max_iterations: Option<u32>,

    // fork
    branches: Option<Vec<String>>,

    // join
    sources: Option<Vec<String>>,
    strategy: Option<StrategyTag>,
    best_by: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum NodeTypeTag {
    Agent,
    Decision,
    Loop,
    Fork,
    Join,
    Output,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum StrategyTag {
    FirstComplete,
    AllComplete,
    BestBy,
}

// === COMPILED FLOW ===

/// Schedule plan computed once at load time.
#[derive(Debug, Clone)]
pub struct FlowPlan {
    pub order: Vec<String>,
    pub layers: Vec<Vec<String>>,
    pub indegree: HashMap<String, usize>,
    pub graph: FlowGraph,
    /// Loop-body membership: body node id -> owning loop id.
    pub body_owner: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LoadedFlow {
    pub def: FlowDefinition,
    pub plan: FlowPlan,
}

// === VALIDATION ===

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::FlowInvalid(msg.into())
}

fn check_flow_id(flow_id: &str) -> Result<(), EngineError> {
    let ok = !flow_id.is_empty()
        && flow_id.len() <= 64
        && flow_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(invalid(format!(
            "flow_id `{flow_id}` must match ^[a-z0-9_-]{{1,64}}$"
        )))
    }
}

/// Pull the engine-interpreted keys (`timeout`, `max_retries`,
/// `on_error_node`) out of an agent node's config object and range-check
/// them. The remaining config passes through to the agent as-is.
fn split_agent_config(
    node_id: &str,
    config: Option<Value>,
) -> Result<(Value, Option<u64>, Option<u32>, Option<String>), EngineError> {
    let mut config = match config {
        None => return Ok((Value::Object(Default::default()), None, None, None)),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(invalid(format!(
                "node `{node_id}`: config must be an object, got {other}"
            )))
        }
    };

    let timeout = match config.remove("timeout") {
        None => None,
        Some(v) => {
            let secs = v
                .as_u64()
                .ok_or_else(|| invalid(format!("node `{node_id}`: timeout must be an integer")))?;
            if !(30..=600).contains(&secs) {
                return Err(invalid(format!(
                    "node `{node_id}`: timeout {secs}s outside 30..600"
                )));
            }
            Some(secs)
        }
    };

    let max_retries = match config.remove("max_retries") {
        None => None,
        Some(v) => {
            let n = v.as_u64().ok_or_else(|| {
                invalid(format!("node `{node_id}`: max_retries must be an integer"))
            })?;
            if n > 5 {
                return Err(invalid(format!(
                    "node `{node_id}`: max_retries {n} outside 0..5"
                )));
            }
            Some(n as u32)
        }
    };

    let on_error_node = match config.remove("on_error_node") {
        None => None,
        Some(Value::String(target)) => Some(target),
        Some(other) => {
            return Err(invalid(format!(
                "node `{node_id}`: on_error_node must be a node id, got {other}"
            )))
        }
    };

    Ok((Value::Object(config), timeout, max_retries, on_error_node))
}

fn compile_node(doc: NodeDocument) -> Result<NodeDef, EngineError> {
    let id = doc.id.clone();
    let need = |field: &str| invalid(format!("node `{id}`: missing `{field}`"));

    let kind = match doc.node_type {
        NodeTypeTag::Agent => {
            let (config, timeout, max_retries, on_error_node) =
                split_agent_config(&doc.id, doc.config)?;
            NodeKind::Agent {
                agent_id: doc.agent_id.ok_or_else(|| need("agent_id"))?,
                config,
                timeout,
                max_retries,
                on_error_node,
            }
        }
        NodeTypeTag::Decision => NodeKind::Decision {
            condition: doc.condition.ok_or_else(|| need("condition"))?,
            then_node: doc.then_node.ok_or_else(|| need("then"))?,
            else_node: doc.else_node.ok_or_else(|| need("else"))?,
        },
        NodeTypeTag::Loop => {
            let body = doc.body.ok_or_else(|| need("body"))?;
            if body.is_empty() {
                return Err(invalid(format!("node `{id}`: loop body is empty")));
            }
            let max_iterations = doc.max_iterations.ok_or_else(|| need("max_iterations"))?;
            if max_iterations == 0 {
                return Err(invalid(format!("node `{id}`: max_iterations must be >= 1")));
            }
            NodeKind::Loop {
                body,
                until: doc.until.ok_or_else(|| need("until"))?,
                max_iterations,
            }
        }
        NodeTypeTag::Fork => {
            let branches = doc.branches.ok_or_else(|| need("branches"))?;
            if branches.is_empty() {
                return Err(invalid(format!("node `{id}`: fork has no branches")));
            }
            NodeKind::Fork { branches }
        }
        NodeTypeTag::Join => {
            let sources = doc.sources.ok_or_else(|| need("sources"))?;
            if sources.is_empty() {
                return Err(invalid(format!("node `{id}`: join has no sources")));
            }
            let strategy = match doc.strategy.ok_or_else(|| need("strategy"))? {
                StrategyTag::FirstComplete => {
                    if doc.best_by.is_some() {
                        return Err(invalid(format!(
                            "node `{id}`: best_by only valid with strategy best_by"
                        )));
                    }
                    MergeStrategy::FirstComplete
                }
                StrategyTag::AllComplete => {
                    if doc.best_by.is_some() {
                        return Err(invalid(format!(
                            "node `{id}`: best_by only valid with strategy best_by"
                        )));
                    }
                    MergeStrategy::AllComplete
                }
                StrategyTag::BestBy => MergeStrategy::BestBy(
                    doc.best_by.ok_or_else(|| need("best_by"))?,
                ),
            };
            NodeKind::Join { sources, strategy }
        }
        NodeTypeTag::Output => NodeKind::Output {},
    };

    Ok(NodeDef {
        id: doc.id,
        kind,
        depends_on: doc.depends_on,
    })
}

/// Build the scheduling graph: dependency edges plus the control edges a
/// decision, fork, loop or join implies.
fn build_graph(def: &FlowDefinition) -> Result<FlowGraph, EngineError> {
    let mut graph = FlowGraph::new();
    for node in &def.nodes {
        graph.add_node(node.id.clone());
    }

    let edge = |from: &str, to: &str, graph: &mut FlowGraph| -> Result<(), EngineError> {
        graph
            .add_edge(from, to)
            .map_err(|e| invalid(e.to_string()))
    };

    for node in &def.nodes {
        for dep in &node.depends_on {
            edge(dep, &node.id, &mut graph)?;
        }
        match &node.kind {
            NodeKind::Agent { on_error_node, .. } => {
                if let Some(handler) = on_error_node {
                    // the failure path is an edge too; it carries the error
                    // payload when the node fails
                    edge(&node.id, handler, &mut graph)?;
                }
            }
            NodeKind::Decision { then_node, else_node, .. } => {
                edge(&node.id, then_node, &mut graph)?;
                edge(&node.id, else_node, &mut graph)?;
            }
            NodeKind::Fork { branches } => {
                for b in branches {
                    edge(&node.id, b, &mut graph)?;
                }
            }
            NodeKind::Loop { body, .. } => {
                for b in body {
                    edge(&node.id, b, &mut graph)?;
                }
            }
            NodeKind::Join { sources, .. } => {
                for s in sources {
                    edge(s, &node.id, &mut graph)?;
                }
            }
            NodeKind::Output {} => {}
        }
    }

    Ok(graph)
}

/// Full structural validation, producing the immutable plan.
pub fn validate(def: FlowDefinition) -> Result<LoadedFlow, EngineError> {
    check_flow_id(&def.flow_id)?;

    semver::Version::parse(&def.version)
        .map_err(|e| invalid(format!("version `{}` is not semver: {e}", def.version)))?;

    // unique node ids
    let mut seen = HashSet::new();
    for node in &def.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(invalid(format!("duplicate node id `{}`", node.id)));
        }
    }
    let ids: HashSet<&str> = seen;

    let exists = |id: &str, what: &str| -> Result<(), EngineError> {
        if ids.contains(id) {
            Ok(())
        } else {
            Err(invalid(format!("{what} references unknown node `{id}`")))
        }
    };

    // entry / exit shape
    exists(&def.entry_point, "entry_point")?;
    if !def
        .node(&def.entry_point)
        .expect("checked")
        .depends_on
        .is_empty()
    {
        return Err(invalid(format!(
            "entry_point `{}` must not have dependencies",
            def.entry_point
        )));
    }
    if def.exit_points.is_empty() {
        return Err(invalid("exit_points must not be empty"));
    }
    for exit in &def.exit_points {
        exists(exit, "exit_points")?;
    }

    // reference integrity, expression syntax, control-flow shape
    let mut body_owner: HashMap<String, String> = HashMap::new();
    for node in &def.nodes {
        for dep in &node.depends_on {
            exists(dep, &format!("node `{}` depends_on", node.id))?;
        }
        match &node.kind {
            NodeKind::Agent { on_error_node, .. } => {
                if let Some(target) = on_error_node {
                    exists(target, &format!("node `{}` on_error_node", node.id))?;
                }
            }
            NodeKind::Decision { condition, then_node, else_node } => {
                exists(then_node, &format!("node `{}` then", node.id))?;
                exists(else_node, &format!("node `{}` else", node.id))?;
                expr::parse(condition)
                    .map_err(|e| invalid(format!("node `{}`: {e}", node.id)))?;
            }
            NodeKind::Loop { body, until, .. } => {
                for b in body {
                    exists(b, &format!("node `{}` body", node.id))?;
                    if body_owner.insert(b.clone(), node.id.clone()).is_some() {
                        return Err(invalid(format!(
                            "node `{b}` belongs to more than one loop body"
                        )));
                    }
                }
                expr::parse(until).map_err(|e| invalid(format!("node `{}`: {e}", node.id)))?;
            }
            NodeKind::Fork { branches } => {
                for b in branches {
                    exists(b, &format!("node `{}` branches", node.id))?;
                }
            }
            NodeKind::Join { sources, strategy } => {
                for s in sources {
                    exists(s, &format!("node `{}` sources", node.id))?;
                }
                if let MergeStrategy::BestBy(score) = strategy {
                    expr::parse(score)
                        .map_err(|e| invalid(format!("node `{}`: {e}", node.id)))?;
                }
            }
            NodeKind::Output {} => {}
        }
    }

    let graph = build_graph(&def)?;

    let order = graph
        .topological_sort()
        .map_err(|e| invalid(e.to_string()))?;
    let layers = graph.layers().map_err(|e| invalid(e.to_string()))?;
    let indegree = graph.indegree();

    // reachability from the entry point
    let reachable = graph.reachable_from(&def.entry_point);
    for node in &def.nodes {
        if !reachable.contains(&node.id) {
            return Err(invalid(format!(
                "node `{}` is not reachable from entry_point",
                node.id
            )));
        }
    }

    // a loop body may only be entered through its loop, may not leak edges
    // out of the body, and holds agent nodes only
    for (body_node, owner) in &body_owner {
        let allowed: HashSet<&str> = def
            .nodes
            .iter()
            .filter(|n| body_owner.get(&n.id) == Some(owner))
            .map(|n| n.id.as_str())
            .chain(std::iter::once(owner.as_str()))
            .collect();
        for dep in graph.dependencies(body_node) {
            if !allowed.contains(dep.as_str()) {
                return Err(invalid(format!(
                    "loop body node `{body_node}` is reachable from `{dep}` outside loop `{owner}`"
                )));
            }
        }
        for dependent in graph.dependents(body_node) {
            if !allowed.contains(dependent.as_str()) {
                return Err(invalid(format!(
                    "loop body node `{body_node}` feeds `{dependent}` outside loop `{owner}`"
                )));
            }
        }
        let body_def = def.node(body_node).expect("checked");
        if !body_def.is_agent() {
            return Err(invalid(format!(
                "loop body node `{body_node}` must be an agent node"
            )));
        }
    }

    // every fork needs a join downstream of all its branches
    let joins: Vec<&NodeDef> = def
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Join { .. }))
        .collect();
    for node in &def.nodes {
        if let NodeKind::Fork { branches } = &node.kind {
            let matched = joins.iter().any(|join| {
                branches
                    .iter()
                    .all(|b| graph.reachable_from(b).contains(&join.id))
            });
            if !matched {
                return Err(invalid(format!(
                    "fork `{}` has no join covering all branches",
                    node.id
                )));
            }
        }
    }

    Ok(LoadedFlow {
        plan: FlowPlan {
            order,
            layers,
            indegree,
            graph,
            body_owner,
        },
        def,
    })
}

/// Parse a YAML flow document and validate it for the given owner scope.
pub fn parse_yaml(yaml: &str, tenant_id: Option<&str>) -> Result<LoadedFlow, EngineError> {
    let doc: FlowDocument =
        serde_yaml::from_str(yaml).map_err(|e| invalid(format!("parse error: {e}")))?;

    let nodes = doc
        .nodes
        .into_iter()
        .map(compile_node)
        .collect::<Result<Vec<_>, _>>()?;

    validate(FlowDefinition {
        flow_id: doc.flow_id,
        version: doc.version,
        name: doc.name,
        description: doc.description,
        entry_point: doc.entry_point,
        exit_points: doc.exit_points,
        nodes,
        tenant_id: tenant_id.map(String::from),
    })
}

// === CATALOG ===

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
    tenant_id: Option<String>,
    flow_id: String,
}

/// Tenant-scoped flow lookup with a system-scope fallback.
#[derive(Default)]
pub struct FlowCatalog {
    flows: DashMap<FlowKey, Arc<LoadedFlow>>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_yaml(
        &self,
        yaml: &str,
        tenant_id: Option<&str>,
    ) -> Result<Arc<LoadedFlow>, EngineError> {
        let loaded = Arc::new(parse_yaml(yaml, tenant_id)?);
        self.insert(loaded.clone());
        Ok(loaded)
    }

    pub fn insert(&self, flow: Arc<LoadedFlow>) {
        let key = FlowKey {
            tenant_id: flow.def.tenant_id.clone(),
            flow_id: flow.def.flow_id.clone(),
        };
        self.flows.insert(key, flow);
    }

    pub fn get(&self, flow_id: &str, tenant_id: &str) -> Result<Arc<LoadedFlow>, EngineError> {
        let tenant_key = FlowKey {
            tenant_id: Some(tenant_id.to_string()),
            flow_id: flow_id.to_string(),
        };
        if let Some(flow) = self.flows.get(&tenant_key) {
            return Ok(flow.clone());
        }
        let system_key = FlowKey {
            tenant_id: None,
            flow_id: flow_id.to_string(),
        };
        self.flows
            .get(&system_key)
            .map(|f| f.clone())
            .ok_or(EngineError::NotFound)
    }

    pub fn remove(&self, flow_id: &str, tenant_id: Option<&str>) -> bool {
        let key = FlowKey {
            tenant_id: tenant_id.map(String::from),
            flow_id: flow_id.to_string(),
        };
        self.flows.remove(&key).is_some()
    }

    /// Flows visible to a tenant: its own plus system scope.
    pub fn list(&self, tenant_id: &str) -> Vec<FlowDefinition> {
        let mut out: Vec<FlowDefinition> = self
            .flows
            .iter()
            .filter(|e| {
                e.key().tenant_id.is_none() || e.key().tenant_id.as_deref() == Some(tenant_id)
            })
            .map(|e| e.value().def.clone())
            .collect();
        out.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"
flow_id: two-step
name: Two step
description: echo then echo
version: 1.0.0
entry_point: a
exit_points: [b]
nodes:
  - id: a
    type: agent
    agent_id: echo
  - id: b
    type: agent
    agent_id: echo
    depends_on: [a]
"#;

    #[test]
    fn linear_flow_parses_and_plans() {
        let loaded = parse_yaml(LINEAR, None).unwrap();
        assert_eq!(loaded.def.flow_id, "two-step");
        assert_eq!(loaded.plan.order, vec!["a", "b"]);
        assert_eq!(loaded.plan.layers, vec![vec!["a"], vec!["b"]]);
        assert_eq!(loaded.plan.indegree["b"], 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = LINEAR.replace("description: echo then echo", "descriptionz: nope");
        assert!(matches!(
            parse_yaml(&yaml, None),
            Err(EngineError::FlowInvalid(_))
        ));
    }

    #[test]
    fn bad_flow_id_and_version_are_rejected() {
        let yaml = LINEAR.replace("two-step", "Two Step!");
        assert!(parse_yaml(&yaml, None).is_err());

        let yaml = LINEAR.replace("1.0.0", "one-dot-oh");
        assert!(parse_yaml(&yaml, None).is_err());
    }

    #[test]
    fn cycle_is_named() {
        let yaml = r#"
flow_id: loopy
name: Loopy
version: 0.1.0
entry_point: start
exit_points: [b]
nodes:
  - id: start
    type: agent
    agent_id: echo
  - id: a
    type: agent
    agent_id: echo
    depends_on: [start, b]
  - id: b
    type: agent
    agent_id: echo
    depends_on: [a]
"#;
        match parse_yaml(yaml, None) {
            Err(EngineError::FlowInvalid(msg)) => assert!(msg.contains("cycle at"), "{msg}"),
            other => panic!("expected FlowInvalid, got {other:?}"),
        }
    }

    #[test]
    fn entry_with_dependencies_is_rejected() {
        let yaml = LINEAR.replace(
            "  - id: a\n    type: agent\n    agent_id: echo\n",
            "  - id: a\n    type: agent\n    agent_id: echo\n    depends_on: [b]\n",
        );
        assert!(parse_yaml(&yaml, None).is_err());
    }

    #[test]
    fn unreachable_node_is_rejected() {
        let yaml = r#"
flow_id: island
name: Island
version: 0.1.0
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: echo
  - id: stray
    type: agent
    agent_id: echo
"#;
        match parse_yaml(yaml, None) {
            Err(EngineError::FlowInvalid(msg)) => assert!(msg.contains("stray"), "{msg}"),
            other => panic!("expected FlowInvalid, got {other:?}"),
        }
    }

    #[test]
    fn agent_config_extracts_timeout_and_retries() {
        let yaml = r#"
flow_id: tuned
name: Tuned
version: 0.1.0
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: echo
    config:
      timeout: 60
      max_retries: 2
      system_prompt: hello
"#;
        let loaded = parse_yaml(yaml, None).unwrap();
        match &loaded.def.nodes[0].kind {
            NodeKind::Agent { timeout, max_retries, config, .. } => {
                assert_eq!(*timeout, Some(60));
                assert_eq!(*max_retries, Some(2));
                assert_eq!(config["system_prompt"], "hello");
                assert!(config.get("timeout").is_none());
            }
            other => panic!("expected agent, got {other:?}"),
        }
    }

    #[test]
    fn timeout_out_of_range_is_rejected() {
        let yaml = r#"
flow_id: tuned
name: Tuned
version: 0.1.0
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: echo
    config:
      timeout: 5
"#;
        assert!(parse_yaml(yaml, None).is_err());
    }

    #[test]
    fn join_requires_best_by_expression_exactly_when_strategy_says() {
        let base = r#"
flow_id: joined
name: Joined
version: 0.1.0
entry_point: f
exit_points: [j]
nodes:
  - id: f
    type: fork
    branches: [a, b]
  - id: a
    type: agent
    agent_id: echo
    depends_on: [f]
  - id: b
    type: agent
    agent_id: echo
    depends_on: [f]
  - id: j
    type: join
    sources: [a, b]
    depends_on: [a, b]
    strategy: STRAT
"#;
        let ok = base.replace("strategy: STRAT", "strategy: all_complete");
        parse_yaml(&ok, None).unwrap();

        let missing = base.replace("strategy: STRAT", "strategy: best_by");
        assert!(parse_yaml(&missing, None).is_err());

        let with_expr = base.replace(
            "strategy: STRAT",
            "strategy: best_by\n    best_by: output.a.score",
        );
        parse_yaml(&with_expr, None).unwrap();

        let stray = base.replace(
            "strategy: STRAT",
            "strategy: all_complete\n    best_by: output.a.score",
        );
        assert!(parse_yaml(&stray, None).is_err());
    }

    #[test]
    fn fork_without_matching_join_is_rejected() {
        let yaml = r#"
flow_id: forked
name: Forked
version: 0.1.0
entry_point: f
exit_points: [a, b]
nodes:
  - id: f
    type: fork
    branches: [a, b]
  - id: a
    type: agent
    agent_id: echo
    depends_on: [f]
  - id: b
    type: agent
    agent_id: echo
    depends_on: [f]
"#;
        match parse_yaml(yaml, None) {
            Err(EngineError::FlowInvalid(msg)) => assert!(msg.contains("join"), "{msg}"),
            other => panic!("expected FlowInvalid, got {other:?}"),
        }
    }

    #[test]
    fn loop_body_entered_from_outside_is_rejected() {
        let yaml = r#"
flow_id: leaky
name: Leaky
version: 0.1.0
entry_point: a
exit_points: [done]
nodes:
  - id: a
    type: agent
    agent_id: echo
  - id: l
    type: loop
    body: [work]
    until: iteration >= 2
    max_iterations: 5
    depends_on: [a]
  - id: work
    type: agent
    agent_id: echo
    depends_on: [a]
  - id: done
    type: agent
    agent_id: echo
    depends_on: [l]
"#;
        match parse_yaml(yaml, None) {
            Err(EngineError::FlowInvalid(msg)) => assert!(msg.contains("work"), "{msg}"),
            other => panic!("expected FlowInvalid, got {other:?}"),
        }
    }

    #[test]
    fn bad_condition_syntax_fails_at_load_time() {
        let yaml = r#"
flow_id: condy
name: Condy
version: 0.1.0
entry_point: a
exit_points: [b, c]
nodes:
  - id: a
    type: agent
    agent_id: echo
  - id: d
    type: decision
    condition: "output.a.score >"
    then: b
    else: c
    depends_on: [a]
  - id: b
    type: agent
    agent_id: echo
    depends_on: [d]
  - id: c
    type: agent
    agent_id: echo
    depends_on: [d]
"#;
        assert!(parse_yaml(yaml, None).is_err());
    }

    #[test]
    fn normalized_definition_round_trips() {
        let loaded = parse_yaml(LINEAR, None).unwrap();
        let json = serde_json::to_string(&loaded.def).unwrap();
        let back: FlowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.def, back);
        // re-validating the normalized definition yields the same plan
        let revalidated = validate(back).unwrap();
        assert_eq!(revalidated.plan.order, loaded.plan.order);
    }

    #[test]
    fn tenant_lookup_falls_back_to_system_scope() {
        let catalog = FlowCatalog::new();
        catalog.load_yaml(LINEAR, None).unwrap();
        let tenant_yaml = LINEAR.replace("two-step", "tenant-flow");
        catalog.load_yaml(&tenant_yaml, Some("acme")).unwrap();

        assert!(catalog.get("two-step", "acme").is_ok());
        assert!(catalog.get("tenant-flow", "acme").is_ok());
        assert!(matches!(
            catalog.get("tenant-flow", "globex"),
            Err(EngineError::NotFound)
        ));
        assert_eq!(catalog.list("acme").len(), 2);
        assert_eq!(catalog.list("globex").len(), 1);
    }
}
