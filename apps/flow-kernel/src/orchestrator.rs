// apps/flow-kernel/src/orchestrator.rs
// Purpose: Coordinator actor driving one execution: readiness, fan-out,
//          control flow, retries, joins, deadline and cancellation.
// Architecture: Domain Logic Layer
// Dependencies: tokio, tokio-util, rand, chrono
//
// One coordinator owns all per-execution state. Agent dispatches fan out as
// worker tasks and report back over an mpsc channel, so nothing here needs a
// lock. Every store write and event publish happens on the coordinator.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::LoadedFlow;
use crate::config::EngineConfig;
use crate::error::{AgentError, EngineError};
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::expr::{self, EvalScope};
use crate::models::{
    AgentCallRequest, AgentCallResponse, AgentMessage, AgentRecord, ExecutionContext,
    ExecutionOptions, ExecutionStatus, MergeStrategy, NodeDef, NodeKind, NodeResult, NodeStatus,
};
use crate::proxy::AgentProxy;
use crate::registry::AgentRegistry;
use crate::store::{ExecutionStore, TransitionUpdate};

/// What a worker task reports back to its coordinator.
struct NodeOutcome {
    node_id: String,
    iteration: u32,
    attempts: u32,
    started_at: DateTime<Utc>,
    input: Value,
    result: Result<AgentCallResponse, AgentError>,
    cancelled: bool,
}

/// Why the coordinator is draining instead of scheduling.
enum Winding {
    No,
    Cancelled,
    Deadline,
    Fatal(EngineError),
}

struct LoopRun {
    iteration: u32,
    members: Vec<String>,
    /// Unresolved intra-body dependencies for the current iteration.
    pending: HashMap<String, HashSet<String>>,
    until: String,
    max_iterations: u32,
}

pub struct Coordinator {
    flow: Arc<LoadedFlow>,
    store: Arc<dyn ExecutionStore>,
    registry: Arc<AgentRegistry>,
    proxy: Arc<AgentProxy>,
    bus: EventBus,
    config: EngineConfig,
    cancel: CancellationToken,

    ctx: ExecutionContext,
    parallelism: usize,
    deadline: Duration,

    status: HashMap<String, NodeStatus>,
    outputs: HashMap<String, Value>,
    inputs: HashMap<String, Value>,
    scratch: Value,

    /// Unresolved in-edge sources per node (generic scheduling).
    pending_in: HashMap<String, HashSet<String>>,
    /// In-edge sources that fired, in firing order.
    fired_from: HashMap<String, Vec<String>>,

    loops: HashMap<String, LoopRun>,
    /// Error-handler node -> the node it is standing in for.
    handler_for: HashMap<String, String>,

    ready: VecDeque<String>,
    in_flight: HashMap<String, CancellationToken>,
    winding: Winding,

    tx: mpsc::Sender<NodeOutcome>,
    rx: mpsc::Receiver<NodeOutcome>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow: Arc<LoadedFlow>,
        ctx: ExecutionContext,
        options: &ExecutionOptions,
        store: Arc<dyn ExecutionStore>,
        registry: Arc<AgentRegistry>,
        proxy: Arc<AgentProxy>,
        bus: EventBus,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let parallelism = options.parallelism.unwrap_or(config.parallelism).max(1);
        let deadline = options
            .deadline
            .map(Duration::from_secs)
            .unwrap_or(config.execution_deadline);

        let mut pending_in: HashMap<String, HashSet<String>> = HashMap::new();
        for node in &flow.def.nodes {
            let deps: HashSet<String> = flow
                .plan
                .graph
                .dependencies(&node.id)
                .iter()
                .cloned()
                .collect();
            pending_in.insert(node.id.clone(), deps);
        }

        let (tx, rx) = mpsc::channel(parallelism * 2);

        Self {
            flow,
            store,
            registry,
            proxy,
            bus,
            config,
            cancel,
            ctx,
            parallelism,
            deadline,
            status: HashMap::new(),
            outputs: HashMap::new(),
            inputs: HashMap::new(),
            scratch: Value::Object(Map::new()),
            pending_in,
            fired_from: HashMap::new(),
            loops: HashMap::new(),
            handler_for: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            winding: Winding::No,
            tx,
            rx,
        }
    }

    /// Drive the execution to a terminal state. Consumes the coordinator.
    pub async fn run(mut self) {
        let execution_id = self.ctx.execution_id;

        match self
            .store
            .transition(execution_id, ExecutionStatus::Running, TransitionUpdate::started_now())
            .await
        {
            Ok(ctx) => self.ctx = ctx,
            Err(err) => {
                tracing::error!("execution {execution_id} failed to start: {err}");
                return;
            }
        }

        if self.cancel.is_cancelled() {
            // cancelled while queued behind the tenant gate
            self.winding = Winding::Cancelled;
            self.finish().await;
            return;
        }

        self.bus.publish(EngineEvent::execution(
            EventKind::ExecutionStarted,
            execution_id,
            json!({"flow_id": self.ctx.flow_id}),
        ));

        let entry = self.flow.def.entry_point.clone();
        self.ready.push_back(entry);

        let deadline_sleep = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline_sleep);

        loop {
            while matches!(self.winding, Winding::No)
                && self.in_flight.len() < self.parallelism
                && !self.ready.is_empty()
            {
                let node_id = self.ready.pop_front().expect("non-empty");
                self.dispatch(&node_id).await;
            }

            let drained = self.in_flight.is_empty()
                && (self.ready.is_empty() || !matches!(self.winding, Winding::No));
            if drained {
                break;
            }

            tokio::select! {
                // cancellation and deadline take precedence over completions
                // that land in the same tick
                biased;
                _ = self.cancel.cancelled(), if matches!(self.winding, Winding::No) => {
                    self.begin_winding(Winding::Cancelled);
                }
                _ = &mut deadline_sleep, if matches!(self.winding, Winding::No) => {
                    self.begin_winding(Winding::Deadline);
                }
                Some(outcome) = self.rx.recv() => {
                    self.handle_outcome(outcome).await;
                }
            }
        }

        self.finish().await;
    }

    fn begin_winding(&mut self, winding: Winding) {
        // in-flight workers abort at their next suspension point;
        // enqueued-but-not-started nodes are dropped
        for token in self.in_flight.values() {
            token.cancel();
        }
        self.ready.clear();
        self.winding = winding;
    }

    async fn finish(mut self) {
        let execution_id = self.ctx.execution_id;

        let (status, error) = match std::mem::replace(&mut self.winding, Winding::No) {
            Winding::Cancelled => (ExecutionStatus::Cancelled, Some(EngineError::Cancelled)),
            Winding::Deadline => (
                ExecutionStatus::Failed,
                Some(EngineError::DeadlineExceeded(self.deadline)),
            ),
            Winding::Fatal(err) => (ExecutionStatus::Failed, Some(err)),
            Winding::No => {
                let exits = &self.flow.def.exit_points;
                let succeeded = exits
                    .iter()
                    .filter(|e| self.status.get(*e) == Some(&NodeStatus::Succeeded))
                    .count();
                let unresolved = exits.iter().any(|e| {
                    !self
                        .status
                        .get(e)
                        .map(|s| s.is_terminal())
                        .unwrap_or(false)
                });
                if succeeded > 0 && !unresolved {
                    (ExecutionStatus::Succeeded, None)
                } else {
                    (
                        ExecutionStatus::Failed,
                        Some(EngineError::FlowInvalid(
                            "no exit point produced a result".to_string(),
                        )),
                    )
                }
            }
        };

        let output_data = if status == ExecutionStatus::Succeeded {
            let mut map = Map::new();
            for exit in &self.flow.def.exit_points {
                if let Some(out) = self.outputs.get(exit) {
                    map.insert(exit.clone(), out.clone());
                }
            }
            Some(Value::Object(map))
        } else {
            None
        };

        let exec_error = error.as_ref().map(|e| e.to_execution_error());
        if let Err(err) = self
            .store
            .transition(
                execution_id,
                status,
                TransitionUpdate::completed(output_data, exec_error),
            )
            .await
        {
            tracing::error!("execution {execution_id} failed to record terminal state: {err}");
        }

        let kind = match status {
            ExecutionStatus::Succeeded => EventKind::ExecutionSucceeded,
            ExecutionStatus::Cancelled => EventKind::ExecutionCancelled,
            _ => EventKind::ExecutionFailed,
        };
        self.bus.publish(EngineEvent::execution(
            kind,
            execution_id,
            json!({"error": error.map(|e| e.to_string())}),
        ));
    }

    // === DISPATCH ===

    fn node(&self, node_id: &str) -> NodeDef {
        self.flow
            .def
            .node(node_id)
            .expect("validated node id")
            .clone()
    }

    fn iteration_of(&self, node_id: &str) -> u32 {
        self.flow
            .plan
            .body_owner
            .get(node_id)
            .and_then(|owner| self.loops.get(owner))
            .map(|l| l.iteration)
            .unwrap_or(0)
    }

    /// Merged dispatch input: the flow input plus each fired predecessor's
    /// output keyed by its node id.
    fn merged_input(&self, node_id: &str) -> Value {
        let mut map = Map::new();
        map.insert("input".to_string(), self.ctx.input_data.clone());
        if let Some(preds) = self.fired_from.get(node_id) {
            for pred in preds {
                if let Some(out) = self.outputs.get(pred) {
                    map.insert(pred.clone(), out.clone());
                }
            }
        }
        Value::Object(map)
    }

    fn scope(&self, node_id: &str) -> EvalScope<'_> {
        let mut scope = EvalScope::new(&self.ctx.input_data, &self.outputs, &self.scratch);
        if let Some(owner) = self.flow.plan.body_owner.get(node_id) {
            if let Some(run) = self.loops.get(owner) {
                scope = scope.with_iteration(run.iteration as u64);
            }
        }
        scope
    }

    async fn append_edge_message(&self, from: &str, to: &str, payload: Value) {
        let msg = AgentMessage::new(self.ctx.execution_id, from, to, payload);
        if let Err(err) = self.store.append_message(&msg).await {
            tracing::warn!("message append failed for {from}->{to}: {err}");
        }
    }

    async fn dispatch(&mut self, node_id: &str) {
        let node = self.node(node_id);
        let iteration = self.iteration_of(node_id);
        let input = self.merged_input(node_id);
        self.inputs.insert(node_id.to_string(), input.clone());

        // one message per traversed in-edge
        let fired: Vec<String> = self.fired_from.get(node_id).cloned().unwrap_or_default();
        for pred in &fired {
            let payload = self.outputs.get(pred).cloned().unwrap_or(Value::Null);
            self.append_edge_message(pred, node_id, payload).await;
        }

        self.status.insert(node_id.to_string(), NodeStatus::Running);
        self.bus.publish(EngineEvent::node(
            EventKind::NodeStarted,
            self.ctx.execution_id,
            node_id,
            json!({"iteration": iteration}),
        ));

        match node.kind.clone() {
            NodeKind::Agent { agent_id, config, timeout, max_retries, .. } => {
                self.dispatch_agent(&node, &agent_id, config, timeout, max_retries, iteration, input)
                    .await;
            }
            NodeKind::Decision { condition, then_node, else_node } => {
                self.resolve_decision(&node, &condition, &then_node, &else_node, iteration, input)
                    .await;
            }
            NodeKind::Loop { body, until, max_iterations } => {
                self.start_loop(&node, body, until, max_iterations, input).await;
            }
            NodeKind::Fork { .. } | NodeKind::Output {} => {
                // pass-through aggregators: output is the merged input
                self.complete_inline(&node.id, iteration, input.clone(), input, None)
                    .await;
            }
            NodeKind::Join { .. } => {
                // joins resolve from source completions, never from here
            }
        }
    }

    async fn dispatch_agent(
        &mut self,
        node: &NodeDef,
        agent_id: &str,
        config: Value,
        timeout: Option<u64>,
        max_retries: Option<u32>,
        iteration: u32,
        input: Value,
    ) {
        let record: AgentRecord = match self.registry.lookup(agent_id, &self.ctx.tenant_id) {
            Ok(record) => record,
            Err(_) => {
                let started_at = Utc::now();
                let err = EngineError::AgentUnknown(agent_id.to_string());
                self.record_node(node, iteration, &input, NodeStatus::Failed, None, Some(err.to_string()), 0, None, started_at)
                    .await;
                self.bus.publish(EngineEvent::node(
                    EventKind::NodeFailed,
                    self.ctx.execution_id,
                    &node.id,
                    json!({"error": err.public_kind()}),
                ));
                self.route_failure(&node.id, err).await;
                return;
            }
        };

        let request = AgentCallRequest {
            execution_id: self.ctx.execution_id,
            node_id: node.id.clone(),
            input,
            config,
        };
        let timeout = timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.node_timeout)
            .min(self.deadline);
        let retries = max_retries.unwrap_or(self.config.max_retries);

        let worker_cancel = self.cancel.child_token();
        self.in_flight
            .insert(node.id.clone(), worker_cancel.clone());

        let proxy = self.proxy.clone();
        let bus = self.bus.clone();
        let tx = self.tx.clone();
        let node_id = node.id.clone();
        let execution_id = self.ctx.execution_id;
        let base_delay = self.config.retry_base_delay;
        let max_delay = self.config.retry_max_delay;

        tokio::spawn(async move {
            let started_at = Utc::now();
            let mut attempts: u32 = 0;
            let mut cancelled = false;

            let result = loop {
                attempts += 1;
                let call = proxy.execute(&record, &request, timeout);
                let outcome = tokio::select! {
                    _ = worker_cancel.cancelled() => {
                        cancelled = true;
                        break Err(AgentError::timeout());
                    }
                    r = call => r,
                };

                match outcome {
                    Ok(response) => break Ok(response),
                    Err(err) if err.is_retryable() && attempts <= retries => {
                        bus.publish(EngineEvent::node(
                            EventKind::NodeRetrying,
                            execution_id,
                            &node_id,
                            json!({"attempt": attempts, "error": err.public_kind()}),
                        ));
                        let delay = backoff_delay(base_delay, max_delay, attempts - 1);
                        tokio::select! {
                            _ = worker_cancel.cancelled() => {
                                cancelled = true;
                                break Err(err);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(err) => break Err(err),
                }
            };

            let _ = tx
                .send(NodeOutcome {
                    node_id,
                    iteration,
                    attempts,
                    started_at,
                    input: request.input,
                    result,
                    cancelled,
                })
                .await;
        });
    }

    async fn resolve_decision(
        &mut self,
        node: &NodeDef,
        condition: &str,
        then_node: &str,
        else_node: &str,
        iteration: u32,
        input: Value,
    ) {
        match expr::evaluate_bool(condition, &self.scope(&node.id)) {
            Ok(choice) => {
                let (chosen, not_chosen) = if choice {
                    (then_node.to_string(), else_node.to_string())
                } else {
                    (else_node.to_string(), then_node.to_string())
                };
                // the decision's output is its merged input, annotated with the
                // branch taken, so the chosen branch sees upstream data
                let mut output = match input.clone() {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("input".to_string(), other);
                        map
                    }
                };
                let branch = if choice { "then" } else { "else" };
                output.insert("branch".to_string(), json!(branch));

                self.complete_inline(
                    &node.id,
                    iteration,
                    input,
                    Value::Object(output),
                    Some((chosen, not_chosen)),
                )
                .await;
            }
            Err(err) => {
                let started_at = Utc::now();
                self.record_node(node, iteration, &input, NodeStatus::Failed, None, Some(err.to_string()), 0, None, started_at)
                    .await;
                self.bus.publish(EngineEvent::node(
                    EventKind::NodeFailed,
                    self.ctx.execution_id,
                    &node.id,
                    json!({"error": err.public_kind()}),
                ));
                self.route_failure(&node.id, err).await;
            }
        }
    }

    async fn start_loop(
        &mut self,
        node: &NodeDef,
        body: Vec<String>,
        until: String,
        max_iterations: u32,
        input: Value,
    ) {
        // body members see the loop's merged input as the loop's output until
        // the loop itself completes
        let loop_id = node.id.clone();
        self.outputs.insert(loop_id.clone(), input);
        self.loops.insert(
            loop_id.clone(),
            LoopRun {
                iteration: 0,
                members: body,
                pending: HashMap::new(),
                until,
                max_iterations,
            },
        );
        self.start_loop_iteration(&loop_id);
    }

    fn start_loop_iteration(&mut self, loop_id: &str) {
        let run = self.loops.get_mut(loop_id).expect("loop started");
        let members = run.members.clone();
        let allowed: HashSet<String> = members.iter().cloned().collect();

        run.pending.clear();
        for member in &members {
            let deps: HashSet<String> = self
                .flow
                .plan
                .graph
                .dependencies(member)
                .iter()
                .filter(|d| allowed.contains(*d))
                .cloned()
                .collect();
            run.pending.insert(member.clone(), deps);
        }

        for member in &members {
            self.status.insert(member.clone(), NodeStatus::Pending);
            // each iteration re-traverses the loop -> member edge
            self.fired_from
                .insert(member.clone(), vec![loop_id.to_string()]);
        }

        let ready_now: Vec<String> = self
            .loops
            .get(loop_id)
            .expect("loop started")
            .pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(m, _)| m.clone())
            .collect();
        for member in ready_now {
            self.ready.push_back(member);
        }
    }

    /// Body member finished an iteration: advance intra-body readiness, and
    /// when the whole body is terminal decide whether to go around again.
    async fn on_body_member_terminal(&mut self, loop_id: String, member: &str, succeeded: bool) {
        if !succeeded {
            let loop_node = self.node(&loop_id);
            let started_at = Utc::now();
            let reason = format!("loop body node `{member}` failed");
            self.record_node(&loop_node, 0, &Value::Null, NodeStatus::Failed, None, Some(reason.clone()), 0, None, started_at)
                .await;
            self.bus.publish(EngineEvent::node(
                EventKind::NodeFailed,
                self.ctx.execution_id,
                &loop_id,
                json!({"error": reason}),
            ));
            self.route_failure(&loop_id, EngineError::FlowInvalid(reason))
                .await;
            return;
        }

        {
            let run = self.loops.get_mut(&loop_id).expect("loop running");
            for deps in run.pending.values_mut() {
                deps.remove(member);
            }
        }
        let newly_ready: Vec<String> = {
            let run = self.loops.get(&loop_id).expect("loop running");
            run.pending
                .iter()
                .filter(|(m, deps)| {
                    deps.is_empty() && self.status.get(*m) == Some(&NodeStatus::Pending)
                })
                .map(|(m, _)| m.clone())
                .collect()
        };
        for m in newly_ready {
            self.ready.push_back(m);
        }

        let (all_done, next_iteration, until, max_iterations, members) = {
            let run = self.loops.get(&loop_id).expect("loop running");
            (
                run.members
                    .iter()
                    .all(|m| self.status.get(m) == Some(&NodeStatus::Succeeded)),
                run.iteration + 1,
                run.until.clone(),
                run.max_iterations,
                run.members.clone(),
            )
        };
        if !all_done {
            return;
        }

        self.loops
            .get_mut(&loop_id)
            .expect("loop running")
            .iteration = next_iteration;

        let done = {
            let scope = EvalScope::new(&self.ctx.input_data, &self.outputs, &self.scratch)
                .with_iteration(next_iteration as u64);
            match expr::evaluate_bool(&until, &scope) {
                Ok(until_holds) => until_holds || next_iteration >= max_iterations,
                Err(err) => {
                    let loop_node = self.node(&loop_id);
                    let started_at = Utc::now();
                    self.record_node(&loop_node, 0, &Value::Null, NodeStatus::Failed, None, Some(err.to_string()), 0, None, started_at)
                        .await;
                    self.bus.publish(EngineEvent::node(
                        EventKind::NodeFailed,
                        self.ctx.execution_id,
                        &loop_id,
                        json!({"error": err.public_kind()}),
                    ));
                    self.route_failure(&loop_id, err).await;
                    return;
                }
            }
        };

        if done {
            let mut output = Map::new();
            for m in &members {
                if let Some(out) = self.outputs.get(m) {
                    output.insert(m.clone(), out.clone());
                }
            }
            output.insert("iterations".to_string(), json!(next_iteration));
            let input = self.inputs.get(&loop_id).cloned().unwrap_or(Value::Null);
            let loop_node = self.node(&loop_id);
            let started_at = Utc::now();
            self.record_node(
                &loop_node,
                0,
                &input,
                NodeStatus::Succeeded,
                Some(Value::Object(output.clone())),
                None,
                1,
                None,
                started_at,
            )
            .await;
            self.outputs.insert(loop_id.clone(), Value::Object(output));
            self.status.insert(loop_id.clone(), NodeStatus::Succeeded);
            self.bus.publish(EngineEvent::node(
                EventKind::NodeSucceeded,
                self.ctx.execution_id,
                &loop_id,
                json!({"iterations": next_iteration}),
            ));
            self.fire_edges(&loop_id).await;
        } else {
            self.start_loop_iteration(&loop_id);
        }
    }

    // === COMPLETION HANDLING ===

    async fn handle_outcome(&mut self, outcome: NodeOutcome) {
        self.in_flight.remove(&outcome.node_id);
        let node = self.node(&outcome.node_id);

        if outcome.cancelled || !matches!(self.winding, Winding::No) {
            // no success may be recorded after the cancel timestamp
            let (status, error) = match self.winding {
                Winding::Deadline => (NodeStatus::Failed, "DeadlineExceeded"),
                _ => (NodeStatus::Cancelled, "Cancelled"),
            };
            self.record_node(&node, outcome.iteration, &outcome.input, status, None, Some(error.to_string()), outcome.attempts, None, outcome.started_at)
                .await;
            self.status.insert(node.id.clone(), status);
            if matches!(self.winding, Winding::No) {
                // a first_complete join cancelled this branch; unreachable
                // successors downstream of it resolve to skipped
                self.deaden_edges(&node.id).await;
            }
            return;
        }

        match outcome.result {
            Ok(response) => {
                let output = response.output.unwrap_or(Value::Object(Map::new()));
                if let Some(context) = response.context {
                    merge_scratch(&mut self.scratch, context);
                }
                self.record_node(
                    &node,
                    outcome.iteration,
                    &outcome.input,
                    NodeStatus::Succeeded,
                    Some(output.clone()),
                    None,
                    outcome.attempts,
                    response.cost_usd,
                    outcome.started_at,
                )
                .await;
                self.outputs.insert(node.id.clone(), output);
                self.status.insert(node.id.clone(), NodeStatus::Succeeded);
                self.bus.publish(EngineEvent::node(
                    EventKind::NodeSucceeded,
                    self.ctx.execution_id,
                    &node.id,
                    json!({"iteration": outcome.iteration, "attempts": outcome.attempts}),
                ));
                self.after_node_success(&node.id).await;
            }
            Err(err) => {
                self.record_node(
                    &node,
                    outcome.iteration,
                    &outcome.input,
                    NodeStatus::Failed,
                    None,
                    Some(err.to_string()),
                    outcome.attempts,
                    None,
                    outcome.started_at,
                )
                .await;
                self.bus.publish(EngineEvent::node(
                    EventKind::NodeFailed,
                    self.ctx.execution_id,
                    &node.id,
                    json!({"iteration": outcome.iteration, "error": err.public_kind()}),
                ));
                self.route_failure(&node.id, EngineError::Agent(err)).await;
            }
        }
    }

    /// Inline completion for decision, fork and output nodes.
    async fn complete_inline(
        &mut self,
        node_id: &str,
        iteration: u32,
        input: Value,
        output: Value,
        decision_branches: Option<(String, String)>,
    ) {
        let node = self.node(node_id);
        let started_at = Utc::now();
        self.record_node(&node, iteration, &input, NodeStatus::Succeeded, Some(output.clone()), None, 1, None, started_at)
            .await;
        self.outputs.insert(node_id.to_string(), output);
        self.status.insert(node_id.to_string(), NodeStatus::Succeeded);
        self.bus.publish(EngineEvent::node(
            EventKind::NodeSucceeded,
            self.ctx.execution_id,
            node_id,
            json!({"iteration": iteration}),
        ));

        match decision_branches {
            Some((chosen, not_chosen)) => {
                self.fire_decision_edges(node_id, &chosen, &not_chosen).await;
            }
            None => self.after_node_success(node_id).await,
        }
    }

    async fn after_node_success(&mut self, node_id: &str) {
        // a handler completing stands in for the node it covered
        if let Some(original) = self.handler_for.remove(node_id) {
            let output = self.outputs.get(node_id).cloned().unwrap_or(Value::Null);
            self.outputs.insert(original.clone(), output);
            if let Some(owner) = self.flow.plan.body_owner.get(&original).cloned() {
                // the covered node counts as recovered for loop accounting
                self.status.insert(original.clone(), NodeStatus::Succeeded);
                Box::pin(self.on_body_member_terminal(owner, &original, true)).await;
            } else {
                self.fire_edges(&original).await;
            }
        }

        if let Some(owner) = self.flow.plan.body_owner.get(node_id).cloned() {
            Box::pin(self.on_body_member_terminal(owner, node_id, true)).await;
            return;
        }
        self.fire_edges(node_id).await;
    }

    /// Resolve the out-edges of a succeeded node. The edge to an error
    /// handler is a failure path and stays dead on success.
    async fn fire_edges(&mut self, node_id: &str) {
        let node = self.node(node_id);
        let handler = node.on_error_node().map(String::from);
        let dependents: Vec<String> = self
            .flow
            .plan
            .graph
            .dependents(node_id)
            .iter()
            .cloned()
            .collect();
        for dependent in dependents {
            let error_edge_only = handler.as_deref() == Some(dependent.as_str())
                && !self
                    .flow
                    .def
                    .node(&dependent)
                    .map(|d| d.depends_on.iter().any(|dep| dep == node_id))
                    .unwrap_or(false);
            self.resolve_edge(node_id, &dependent, !error_edge_only).await;
        }
        self.notify_joins(node_id).await;
    }

    async fn fire_decision_edges(&mut self, node_id: &str, chosen: &str, not_chosen: &str) {
        let dependents: Vec<String> = self
            .flow
            .plan
            .graph
            .dependents(node_id)
            .iter()
            .cloned()
            .collect();
        for dependent in dependents {
            let fired = dependent != not_chosen || chosen == not_chosen;
            self.resolve_edge(node_id, &dependent, fired).await;
        }
        self.notify_joins(node_id).await;
    }

    /// Resolve every out-edge of a failed, skipped or cancelled node as dead.
    async fn deaden_edges(&mut self, node_id: &str) {
        let dependents: Vec<String> = self
            .flow
            .plan
            .graph
            .dependents(node_id)
            .iter()
            .cloned()
            .collect();
        for dependent in dependents {
            self.resolve_edge(node_id, &dependent, false).await;
        }
        self.notify_joins(node_id).await;
    }

    async fn resolve_edge(&mut self, from: &str, to: &str, fired: bool) {
        // loop bodies are driven by their loop, never by generic edges
        if self.flow.plan.body_owner.contains_key(to) {
            return;
        }
        let to_node = self.node(to);
        if matches!(to_node.kind, NodeKind::Join { .. }) {
            // joins resolve per merge strategy via notify_joins
            return;
        }
        if self
            .status
            .get(to)
            .map(|s| *s != NodeStatus::Pending)
            .unwrap_or(false)
        {
            return;
        }

        if fired {
            self.fired_from
                .entry(to.to_string())
                .or_default()
                .push(from.to_string());
        }
        let remaining = {
            let pending = self.pending_in.entry(to.to_string()).or_default();
            pending.remove(from);
            pending.len()
        };

        if remaining == 0 {
            let any_fired = self
                .fired_from
                .get(to)
                .map(|f| !f.is_empty())
                .unwrap_or(false);
            if any_fired {
                self.ready.push_back(to.to_string());
            } else {
                self.skip_node(to).await;
            }
        }
    }

    /// Mark a node skipped and propagate along its out-edges.
    async fn skip_node(&mut self, node_id: &str) {
        if self
            .status
            .get(node_id)
            .map(|s| s.is_terminal())
            .unwrap_or(false)
        {
            return;
        }
        self.status.insert(node_id.to_string(), NodeStatus::Skipped);
        let node = self.node(node_id);
        let started_at = Utc::now();
        self.record_node(&node, 0, &Value::Null, NodeStatus::Skipped, None, None, 0, None, started_at)
            .await;
        self.bus.publish(EngineEvent::node(
            EventKind::NodeSkipped,
            self.ctx.execution_id,
            node_id,
            json!({}),
        ));
        Box::pin(self.deaden_edges(node_id)).await;
    }

    // === JOINS ===

    async fn notify_joins(&mut self, source_id: &str) {
        let joins: Vec<NodeDef> = self
            .flow
            .def
            .nodes
            .iter()
            .filter(|n| match &n.kind {
                NodeKind::Join { sources, .. } => sources.iter().any(|s| s == source_id),
                _ => false,
            })
            .cloned()
            .collect();
        for join in joins {
            Box::pin(self.try_resolve_join(&join)).await;
        }
    }

    async fn try_resolve_join(&mut self, join: &NodeDef) {
        if self
            .status
            .get(&join.id)
            .map(|s| *s != NodeStatus::Pending)
            .unwrap_or(false)
        {
            return;
        }
        let NodeKind::Join { sources, strategy } = join.kind.clone() else {
            return;
        };

        let source_status: HashMap<String, NodeStatus> = sources
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    self.status.get(s).copied().unwrap_or(NodeStatus::Pending),
                )
            })
            .collect();
        let succeeded: Vec<String> = sources
            .iter()
            .filter(|s| source_status[*s] == NodeStatus::Succeeded)
            .cloned()
            .collect();
        let all_terminal = sources.iter().all(|s| source_status[s].is_terminal());
        let any_failed = sources
            .iter()
            .any(|s| source_status[s] == NodeStatus::Failed);

        match strategy {
            MergeStrategy::FirstComplete => {
                if let Some(winner) = succeeded.first().cloned() {
                    // losers are cancelled; completed rows are preserved
                    for source in &sources {
                        if *source == winner {
                            continue;
                        }
                        if let Some(token) = self.in_flight.get(source) {
                            token.cancel();
                        } else if source_status[source] == NodeStatus::Pending {
                            self.status.insert(source.clone(), NodeStatus::Cancelled);
                            self.deaden_edges(source).await;
                        }
                    }
                    self.resolve_join_with(join, vec![winner]).await;
                } else if all_terminal {
                    self.fail_join(join, "no join source succeeded").await;
                }
            }
            MergeStrategy::AllComplete => {
                if !all_terminal {
                    return;
                }
                if any_failed {
                    self.fail_join(join, "a join source failed").await;
                } else if succeeded.is_empty() {
                    let join_id = join.id.clone();
                    self.skip_node(&join_id).await;
                } else {
                    self.resolve_join_with(join, succeeded).await;
                }
            }
            MergeStrategy::BestBy(score_expr) => {
                if !all_terminal {
                    return;
                }
                if succeeded.is_empty() {
                    self.fail_join(join, "no join source succeeded").await;
                    return;
                }
                let mut best: Option<(String, f64)> = None;
                for source in &succeeded {
                    // the candidate's output is exposed as `output.result`
                    let mut outputs = self.outputs.clone();
                    if let Some(out) = self.outputs.get(source) {
                        outputs.insert("result".to_string(), out.clone());
                    }
                    let scope = EvalScope::new(&self.ctx.input_data, &outputs, &self.scratch);
                    match expr::evaluate_number(&score_expr, &scope) {
                        Ok(score) => {
                            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                                best = Some((source.clone(), score));
                            }
                        }
                        Err(err) => {
                            let started_at = Utc::now();
                            self.record_node(join, 0, &Value::Null, NodeStatus::Failed, None, Some(err.to_string()), 0, None, started_at)
                                .await;
                            self.route_failure(&join.id.clone(), err).await;
                            return;
                        }
                    }
                }
                let (winner, _) = best.expect("non-empty succeeded set");
                self.resolve_join_with(join, vec![winner]).await;
            }
        }
    }

    async fn resolve_join_with(&mut self, join: &NodeDef, contributors: Vec<String>) {
        let iteration = self.iteration_of(&join.id);

        let mut merged = Map::new();
        for source in &contributors {
            if let Some(out) = self.outputs.get(source) {
                merged.insert(source.clone(), out.clone());
            }
        }
        let output = Value::Object(merged.clone());
        let input = Value::Object(merged);

        self.inputs.insert(join.id.clone(), input.clone());
        for source in &contributors {
            let payload = self.outputs.get(source).cloned().unwrap_or(Value::Null);
            self.append_edge_message(source, &join.id, payload).await;
        }

        let started_at = Utc::now();
        self.record_node(join, iteration, &input, NodeStatus::Succeeded, Some(output.clone()), None, 1, None, started_at)
            .await;
        self.outputs.insert(join.id.clone(), output);
        self.status.insert(join.id.clone(), NodeStatus::Succeeded);
        self.bus.publish(EngineEvent::node(
            EventKind::NodeSucceeded,
            self.ctx.execution_id,
            &join.id,
            json!({"contributors": contributors}),
        ));
        self.fire_edges(&join.id).await;
    }

    async fn fail_join(&mut self, join: &NodeDef, reason: &str) {
        let started_at = Utc::now();
        self.record_node(join, 0, &Value::Null, NodeStatus::Failed, None, Some(reason.to_string()), 0, None, started_at)
            .await;
        self.bus.publish(EngineEvent::node(
            EventKind::NodeFailed,
            self.ctx.execution_id,
            &join.id,
            json!({"error": reason}),
        ));
        self.route_failure(
            &join.id.clone(),
            EngineError::FlowInvalid(format!("join `{}`: {reason}", join.id)),
        )
        .await;
    }

    // === FAILURE ROUTING ===

    /// A node failed permanently. Transfer to its error handler if it has
    /// one, let an absorbing join swallow the failure otherwise, and only
    /// then give up on the whole execution.
    async fn route_failure(&mut self, node_id: &str, err: EngineError) {
        self.status.insert(node_id.to_string(), NodeStatus::Failed);

        let node = self.node(node_id);
        if let Some(handler) = node.on_error_node() {
            let handler = handler.to_string();
            let original_input = self
                .inputs
                .get(node_id)
                .cloned()
                .unwrap_or(Value::Object(Map::new()));
            let mut input = match original_input {
                Value::Object(map) => map,
                other => {
                    let mut map = Map::new();
                    map.insert("original".to_string(), other);
                    map
                }
            };
            input.insert(
                "error".to_string(),
                serde_json::to_value(err.to_execution_error()).expect("serializable"),
            );
            self.handler_for
                .insert(handler.clone(), node_id.to_string());
            self.fired_from
                .entry(handler.clone())
                .or_default()
                .push(node_id.to_string());
            Box::pin(self.dispatch_handler(&handler, Value::Object(input))).await;
            return;
        }

        if self.absorbed_by_join(node_id) {
            // non-join successors of the casualty resolve to skipped; the
            // join itself decides whether it can still complete
            self.deaden_edges(node_id).await;
            return;
        }

        if let Some(owner) = self.flow.plan.body_owner.get(node_id).cloned() {
            // the failure resurfaces on the loop node, which routes it again
            Box::pin(self.on_body_member_terminal(owner, node_id, false)).await;
            return;
        }

        self.begin_winding(Winding::Fatal(err));
    }

    /// A failure is absorbed when some join over this node can still resolve
    /// without it.
    fn absorbed_by_join(&self, node_id: &str) -> bool {
        self.flow.def.nodes.iter().any(|n| match &n.kind {
            NodeKind::Join { sources, strategy } => {
                sources.iter().any(|s| s == node_id)
                    && matches!(
                        strategy,
                        MergeStrategy::FirstComplete | MergeStrategy::BestBy(_)
                    )
            }
            _ => false,
        })
    }

    /// Error handlers bypass normal readiness: they run immediately with the
    /// failed node's input and the error injected under `error`.
    async fn dispatch_handler(&mut self, handler_id: &str, input: Value) {
        let handler = self.node(handler_id);
        let iteration = self.iteration_of(handler_id);
        let covered = self.handler_for[handler_id].clone();

        self.inputs.insert(handler_id.to_string(), input.clone());
        self.append_edge_message(&covered, handler_id, input.clone())
            .await;

        self.status
            .insert(handler_id.to_string(), NodeStatus::Running);
        self.bus.publish(EngineEvent::node(
            EventKind::NodeStarted,
            self.ctx.execution_id,
            handler_id,
            json!({"handler": true}),
        ));

        match handler.kind.clone() {
            NodeKind::Agent { agent_id, config, timeout, max_retries, .. } => {
                self.dispatch_agent(&handler, &agent_id, config, timeout, max_retries, iteration, input)
                    .await;
            }
            _ => {
                // the catalog admits non-agent handlers structurally; they
                // behave as pass-throughs
                self.complete_inline(handler_id, iteration, input.clone(), input, None)
                    .await;
            }
        }
    }

    // === RECORDING ===

    #[allow(clippy::too_many_arguments)]
    async fn record_node(
        &self,
        node: &NodeDef,
        iteration: u32,
        input: &Value,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
        attempts: u32,
        cost_usd: Option<f64>,
        started_at: DateTime<Utc>,
    ) {
        let result = NodeResult {
            execution_id: self.ctx.execution_id,
            node_id: node.id.clone(),
            iteration,
            status,
            input: input.clone(),
            output,
            error,
            started_at,
            completed_at: status.is_terminal().then(Utc::now),
            attempts,
            cost_usd,
        };
        if let Err(err) = self.store.upsert_node_result(&result).await {
            tracing::warn!(
                "node result write failed for {}:{}: {err}",
                node.id,
                iteration
            );
        }
    }
}

/// Exponential backoff with full jitter over [base, base * 2^retry], capped.
fn backoff_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let ceiling = base.saturating_mul(2u32.saturating_pow(retry)).min(max);
    if ceiling <= base {
        return ceiling;
    }
    let base_ms = base.as_millis() as u64;
    let ceiling_ms = ceiling.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(base_ms..=ceiling_ms))
}

/// Shallow merge of agent-provided context updates into the scratch object.
fn merge_scratch(scratch: &mut Value, update: Value) {
    if let (Value::Object(target), Value::Object(incoming)) = (scratch, update) {
        for (k, v) in incoming {
            target.insert(k, v);
        }
    }
}
