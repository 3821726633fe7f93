use crate::limits::{RateLimiter, RateLimiters};
use crate::registry::NodeRegistry;
use crate::runtime::RuntimeConfig;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tokio::time::{sleep, sleep_until, timeout, Duration};
use tokio_util::sync::CancellationToken;
use wfcore::expression::resolve_parameters;
use wfcore::{
    ConnectionType, ErrorHandling, EventBus, ExecutionEvent, ExecutionId, ExecutionMode,
    ExecutionRecord, ExecutionRequest, ExpressionContext, FlowError, NodeContext, NodeError,
    NodeOutput, NodeRun, NodeSpec, NodeStatus, NodeType, RetryPolicy, RunStatus, SkipReason,
    StaticData, Workflow, WorkflowError,
};

/// Executes workflows as DAGs with parallel execution
#[derive(Clone)]
pub struct WorkflowExecutor {
    registry: Arc<NodeRegistry>,
    limiters: Arc<RateLimiters>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
}

/// The part of the graph one run covers, fixed before anything executes.
struct RunPlan {
    start: String,
    reachable: HashSet<String>,
    order: Vec<String>,
}

enum Interrupt {
    Canceled,
    TimedOut(u64),
}

enum Readiness {
    Waiting,
    Skip(SkipReason),
    Ready(BTreeMap<usize, Vec<Value>>),
}

struct NodeAttempt {
    result: Result<NodeOutput, NodeError>,
    attempts: u32,
    duration_ms: u64,
}

struct RunState<'w> {
    workflow: &'w Workflow,
    execution_id: ExecutionId,
    record: ExecutionRecord,
    /// Store this run reads and writes.
    static_data: StaticData,
    /// Workflow pin data, or `None` when the mode ignores it.
    pins: Option<&'w HashMap<String, Value>>,
    no_pins: HashMap<String, Value>,
    /// Main output per node, as seen by `$node[...]` expressions.
    primary_outputs: HashMap<String, Value>,
    /// First main input each dispatched node received.
    inputs: HashMap<String, Value>,
    dispatched: usize,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        limiters: Arc<RateLimiters>,
        event_bus: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            limiters,
            event_bus,
            config,
        }
    }

    /// Execute a workflow to completion under a fresh execution id.
    pub async fn run(
        &self,
        workflow: &Workflow,
        request: ExecutionRequest,
    ) -> Result<ExecutionRecord, FlowError> {
        self.execute(workflow, request, ExecutionId::new_v4(), CancellationToken::new())
            .await
    }

    /// Execute a workflow and return its record.
    ///
    /// Structural problems (unknown types, invalid parameters, no start
    /// node) are returned as errors before anything runs. Node failures are
    /// recorded on the node and never turn into an `Err`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        request: ExecutionRequest,
        execution_id: ExecutionId,
        cancellation: CancellationToken,
    ) -> Result<ExecutionRecord, FlowError> {
        let plan = self.plan(workflow, &request)?;
        let start_time = Instant::now();
        let mut state = RunState::new(workflow, execution_id, &request, &plan);
        let static_version = state.static_data.version();

        tracing::info!(
            "Starting workflow execution: {} ({}) from '{}'",
            workflow.name,
            execution_id,
            plan.start
        );
        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow_id: workflow.id,
            start_node: plan.start.clone(),
            timestamp: Utc::now(),
        });
        state.record.status = RunStatus::Running;

        let start_input = request.input.unwrap_or_else(|| json!({}));
        let interrupt = self
            .execute_dag(&mut state, &plan, start_input, cancellation)
            .await?;

        let mut record = state.record;
        record.status = match interrupt {
            Some(Interrupt::Canceled) => {
                record.error = Some("execution canceled".to_string());
                RunStatus::Canceled
            }
            Some(Interrupt::TimedOut(ms)) => {
                record.error = Some(format!("execution timed out after {}ms", ms));
                RunStatus::Failed
            }
            None if run_is_clean(&record) => RunStatus::Finished,
            None => {
                record.error = first_failure(&record);
                RunStatus::Failed
            }
        };
        record.finished = record.status == RunStatus::Finished;
        record.stopped_at = Some(Utc::now());
        record.static_data_changed = state.static_data.version() != static_version;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        tracing::info!(
            "Workflow {} ({}) ended {:?} in {}ms",
            workflow.name,
            execution_id,
            record.status,
            duration_ms
        );
        self.event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            success: record.finished,
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(record)
    }

    /// Check every node against the registry and work out the start node
    /// and the nodes this run may touch.
    fn plan(&self, workflow: &Workflow, request: &ExecutionRequest) -> Result<RunPlan, FlowError> {
        for node in workflow.nodes() {
            let node_type = self.registry.get(&node.node_type)?;
            if node.disabled {
                continue;
            }
            node_type
                .describe()
                .validate_definition(&node.parameters_value())
                .map_err(|e| {
                    WorkflowError::InvalidDefinition(format!("node '{}': {}", node.name, e))
                })?;
        }

        let destination = request.destination_node.as_deref();
        let start = workflow
            .get_start_node(self.registry.as_ref(), destination)?
            .name
            .clone();

        let mut reachable = workflow.data_descendants(&start);
        reachable.insert(start.clone());
        if let Some(destination) = destination {
            let target = workflow.get_parent_main_input_node(destination)?.name.clone();
            let mut needed = workflow.data_ancestors(&target);
            needed.insert(target);
            reachable.retain(|name| needed.contains(name));
        }

        let order = workflow
            .topological_order()?
            .into_iter()
            .filter(|name| reachable.contains(name))
            .collect();

        Ok(RunPlan {
            start,
            reachable,
            order,
        })
    }

    /// Dispatch loop: keep up to `max_parallel` nodes in flight, settle
    /// skips and pass-throughs inline, and react to completions,
    /// cancellation and the run deadline.
    async fn execute_dag(
        &self,
        state: &mut RunState<'_>,
        plan: &RunPlan,
        start_input: Value,
        cancellation: CancellationToken,
    ) -> Result<Option<Interrupt>, FlowError> {
        let workflow = state.workflow;
        let max_parallel = workflow
            .settings
            .max_parallel_nodes
            .min(self.config.max_parallel_nodes)
            .max(1);
        let run_token = cancellation.child_token();
        let deadline = workflow
            .settings
            .execution_timeout_ms
            .map(|ms| (ms, tokio::time::Instant::now() + Duration::from_millis(ms)));

        let mut pending: Vec<String> = plan.order.clone();
        let mut running = FuturesUnordered::new();
        let mut interrupt = None;
        let mut stopped = false;

        loop {
            if interrupt.is_none() && run_token.is_cancelled() {
                interrupt = Some(Interrupt::Canceled);
            }

            if interrupt.is_none() && !stopped {
                let mut index = 0;
                while index < pending.len() {
                    let name = pending[index].clone();
                    let inputs = match self.readiness(state, plan, &name, &start_input) {
                        Readiness::Waiting => {
                            index += 1;
                            continue;
                        }
                        Readiness::Skip(reason) => {
                            pending.remove(index);
                            self.skip(state, &name, reason);
                            continue;
                        }
                        Readiness::Ready(inputs) => inputs,
                    };

                    let node = workflow.get_node(&name)?;
                    if node.disabled {
                        pending.remove(index);
                        self.pass_through(state, &name, inputs);
                        continue;
                    }
                    if let Some(pinned) = state.pinned(&name) {
                        pending.remove(index);
                        state.start(&name, &inputs);
                        self.emit_started(state, node);
                        let outputs = BTreeMap::from([(0, pinned.clone())]);
                        self.succeed(state, &name, outputs, 0, true);
                        continue;
                    }
                    if running.len() >= max_parallel {
                        break;
                    }

                    pending.remove(index);
                    match self.dispatch(state, node, inputs, &run_token) {
                        Ok(task) => running.push(task),
                        Err(error) => {
                            if self.fail(state, &name, error) {
                                stopped = true;
                                break;
                            }
                        }
                    }
                }
            }

            // If nothing is running, nothing further can become ready
            if running.is_empty() {
                break;
            }

            let run_deadline = async {
                match deadline {
                    Some((_, at)) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = run_token.cancelled(), if interrupt.is_none() => {
                    tracing::warn!("Execution {} canceled", state.execution_id);
                    interrupt = Some(Interrupt::Canceled);
                }
                _ = run_deadline, if interrupt.is_none() => {
                    tracing::warn!("Execution {} hit its deadline", state.execution_id);
                    interrupt = deadline.map(|(ms, _)| Interrupt::TimedOut(ms));
                    run_token.cancel();
                }
                Some((name, joined)) = running.next() => {
                    let attempt = joined.unwrap_or_else(|e| NodeAttempt {
                        result: Err(NodeError::failed(format!("node task failed: {}", e))),
                        attempts: 1,
                        duration_ms: 0,
                    });
                    if self.complete(state, &name, attempt) {
                        stopped = true;
                    }
                }
            }
        }

        let reason = if interrupt.is_some() {
            SkipReason::Canceled
        } else {
            SkipReason::UpstreamFailed
        };
        for name in pending {
            self.skip(state, &name, reason);
        }

        Ok(interrupt)
    }

    /// Decide what to do with a pending node given its parents' state.
    ///
    /// A main input from port p is active when the source succeeded and
    /// emitted p (or was disabled and passed data through). An error input
    /// is active when the source failed.
    fn readiness(
        &self,
        state: &RunState<'_>,
        plan: &RunPlan,
        name: &str,
        start_input: &Value,
    ) -> Readiness {
        if name == plan.start {
            return Readiness::Ready(BTreeMap::from([(0, vec![start_input.clone()])]));
        }

        let mut inputs: BTreeMap<usize, Vec<Value>> = BTreeMap::new();
        let mut lost_to_failure = false;

        let parents = state
            .workflow
            .connections_by_destination(name)
            .filter(|c| c.connection_type.is_data() && plan.reachable.contains(&c.source));

        for conn in parents {
            let Some(run) = state.record.nodes.get(&conn.source) else {
                continue;
            };
            if !run.status.is_terminal() {
                return Readiness::Waiting;
            }
            let upstream_lost = run.skip_reason.is_some_and(|reason| !reason.is_legitimate());

            match (&conn.connection_type, run.status) {
                (ConnectionType::Main, NodeStatus::Failed) => lost_to_failure = true,
                (ConnectionType::Main, _) => {
                    match run.output.as_ref().and_then(|o| o.get(&conn.source_output)) {
                        Some(value) => inputs
                            .entry(conn.destination_input)
                            .or_default()
                            .push(value.clone()),
                        None => lost_to_failure |= upstream_lost,
                    }
                }
                (ConnectionType::Error, NodeStatus::Failed) => {
                    let failure = run.error.as_ref();
                    let payload = json!({
                        "error": {
                            "kind": failure.map(|f| f.kind),
                            "message": failure.map(|f| f.message.clone()),
                        },
                        "node": conn.source,
                        "input": state.inputs.get(&conn.source).cloned().unwrap_or(Value::Null),
                    });
                    inputs.entry(conn.destination_input).or_default().push(payload);
                }
                (ConnectionType::Error, _) => lost_to_failure |= upstream_lost,
                (ConnectionType::Other(_), _) => {}
            }
        }

        if !inputs.is_empty() {
            Readiness::Ready(inputs)
        } else if lost_to_failure {
            Readiness::Skip(SkipReason::UpstreamFailed)
        } else {
            Readiness::Skip(SkipReason::BranchNotTaken)
        }
    }

    /// Resolve parameters, validate them and spawn the node task.
    fn dispatch(
        &self,
        state: &mut RunState<'_>,
        node: &NodeSpec,
        inputs: BTreeMap<usize, Vec<Value>>,
        run_token: &CancellationToken,
    ) -> Result<impl Future<Output = (String, Result<NodeAttempt, JoinError>)>, NodeError> {
        let workflow = state.workflow;
        let name = node.name.clone();
        let input = state.start(&name, &inputs);
        self.emit_started(state, node);

        let node_type = self
            .registry
            .get(&node.node_type)
            .map_err(|e| NodeError::Configuration(e.to_string()))?;

        let ancestors = workflow.data_ancestors(&name);
        let snapshot = state.static_data.snapshot();
        let expressions = ExpressionContext {
            node: &name,
            json: &input,
            outputs: &state.primary_outputs,
            ancestors: &ancestors,
            static_data: &snapshot,
            pin_data: state.pins.unwrap_or(&state.no_pins),
        };
        let mut parameters = resolve_parameters(&node.parameters_value(), &expressions)?;
        node_type.describe().apply_defaults(&mut parameters);
        node_type.validate(&parameters)?;

        let ctx = NodeContext {
            execution_id: state.execution_id,
            node_id: node.id,
            node_name: name.clone(),
            node_type: node.node_type.clone(),
            parameters,
            inputs,
            static_data: state.static_data.clone(),
            events: self.event_bus.create_emitter(state.execution_id, &name),
            cancellation: run_token.child_token(),
            timezone: workflow.settings.timezone.clone(),
        };
        let timeout_ms = node
            .timeout_ms
            .or(workflow.settings.node_timeout_ms)
            .or(self.config.default_node_timeout_ms);

        let task = run_node(
            node_type,
            ctx,
            self.limiters.get(&node.node_type),
            timeout_ms,
            node.retry_policy.clone(),
            self.event_bus.clone(),
        );
        Ok(tokio::spawn(task).map(move |joined| (name, joined)))
    }

    /// Record a finished task. Returns true when the run should stop
    /// dispatching.
    fn complete(&self, state: &mut RunState<'_>, name: &str, attempt: NodeAttempt) -> bool {
        if let Some(run) = state.record.nodes.get_mut(name) {
            run.attempts = attempt.attempts;
            run.retries = attempt.attempts.saturating_sub(1);
        }
        match attempt.result {
            Ok(output) => {
                self.succeed(state, name, output.outputs, attempt.duration_ms, false);
                false
            }
            Err(error) => self.fail(state, name, error),
        }
    }

    fn succeed(
        &self,
        state: &mut RunState<'_>,
        name: &str,
        outputs: BTreeMap<usize, Value>,
        duration_ms: u64,
        pinned: bool,
    ) {
        tracing::info!("Node {} completed in {}ms", name, duration_ms);
        if let Some(primary) = outputs.values().next() {
            state.primary_outputs.insert(name.to_string(), primary.clone());
        }
        self.event_bus.emit(ExecutionEvent::NodeCompleted {
            execution_id: state.execution_id,
            node: name.to_string(),
            outputs: outputs.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });
        if let Some(run) = state.record.nodes.get_mut(name) {
            run.status = NodeStatus::Succeeded;
            run.output = Some(outputs);
            run.pinned = pinned;
            run.finished_at = Some(Utc::now());
        }
    }

    /// Record a node failure. Returns true when the run should stop
    /// dispatching.
    fn fail(&self, state: &mut RunState<'_>, name: &str, error: NodeError) -> bool {
        tracing::error!("Node {} failed: {}", name, error);
        self.event_bus.emit(ExecutionEvent::NodeFailed {
            execution_id: state.execution_id,
            node: name.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        if let Some(run) = state.record.nodes.get_mut(name) {
            run.status = NodeStatus::Failed;
            run.error = Some(error.to_failure());
            run.finished_at = Some(Utc::now());
        }

        let has_error_branch = state
            .workflow
            .connections_by_source(name)
            .any(|c| c.connection_type == ConnectionType::Error);
        match state.workflow.settings.on_error {
            ErrorHandling::StopWorkflow => {
                !has_error_branch && !matches!(error, NodeError::Cancelled)
            }
            ErrorHandling::ContinueOnError => false,
        }
    }

    fn skip(&self, state: &mut RunState<'_>, name: &str, reason: SkipReason) {
        tracing::debug!("Node {} skipped: {:?}", name, reason);
        if let Some(run) = state.record.nodes.get_mut(name) {
            run.skip(reason);
        }
        self.event_bus.emit(ExecutionEvent::NodeSkipped {
            execution_id: state.execution_id,
            node: name.to_string(),
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Disabled nodes hand their first input to their children unchanged.
    fn pass_through(&self, state: &mut RunState<'_>, name: &str, inputs: BTreeMap<usize, Vec<Value>>) {
        let value = inputs
            .get(&0)
            .and_then(|values| values.first())
            .or_else(|| inputs.values().flatten().next())
            .cloned()
            .unwrap_or(Value::Null);
        self.skip(state, name, SkipReason::Disabled);
        state.primary_outputs.insert(name.to_string(), value.clone());
        if let Some(run) = state.record.nodes.get_mut(name) {
            run.output = Some(BTreeMap::from([(0, value)]));
        }
    }

    fn emit_started(&self, state: &RunState<'_>, node: &NodeSpec) {
        tracing::debug!("Node {} ({}) started", node.name, node.node_type);
        self.event_bus.emit(ExecutionEvent::NodeStarted {
            execution_id: state.execution_id,
            node: node.name.clone(),
            node_type: node.node_type.clone(),
            timestamp: Utc::now(),
        });
    }
}

impl<'w> RunState<'w> {
    fn new(
        workflow: &'w Workflow,
        execution_id: ExecutionId,
        request: &ExecutionRequest,
        plan: &RunPlan,
    ) -> Self {
        // Test runs work on a scratch copy so the workflow's store is untouched
        let static_data = match request.mode {
            ExecutionMode::Test => StaticData::from_snapshot(workflow.static_data().snapshot()),
            _ => workflow.static_data().clone(),
        };

        let nodes = workflow
            .nodes()
            .map(|node| {
                let mut run = NodeRun::pending(node.node_type.clone());
                if !plan.reachable.contains(&node.name) {
                    run.skip(SkipReason::NotReached);
                }
                (node.name.clone(), run)
            })
            .collect();

        Self {
            workflow,
            execution_id,
            record: ExecutionRecord {
                execution_id,
                workflow_id: workflow.id,
                workflow_name: workflow.name.clone(),
                mode: request.mode,
                status: RunStatus::Pending,
                start_node: Some(plan.start.clone()),
                destination_node: request.destination_node.clone(),
                started_at: Utc::now(),
                stopped_at: None,
                finished: false,
                static_data_changed: false,
                error: None,
                nodes,
            },
            static_data,
            pins: request.mode.uses_pin_data().then(|| workflow.pin_data()),
            no_pins: HashMap::new(),
            primary_outputs: HashMap::new(),
            inputs: HashMap::new(),
            dispatched: 0,
        }
    }

    /// Pinned output for a node, when this run honours pin data.
    fn pinned(&self, name: &str) -> Option<&'w Value> {
        self.pins.and_then(|pins| pins.get(name))
    }

    /// Mark a node running and remember its first input.
    fn start(&mut self, name: &str, inputs: &BTreeMap<usize, Vec<Value>>) -> Value {
        let input = inputs
            .get(&0)
            .and_then(|values| values.first())
            .cloned()
            .unwrap_or(Value::Null);
        self.inputs.insert(name.to_string(), input.clone());

        if let Some(run) = self.record.nodes.get_mut(name) {
            run.status = NodeStatus::Running;
            run.started_at = Some(Utc::now());
            run.execution_index = Some(self.dispatched);
        }
        self.dispatched += 1;
        input
    }
}

/// Run one node: rate limit, per-attempt timeout and retries, all abandoned
/// as soon as the node's cancellation token fires.
async fn run_node(
    node_type: Arc<dyn NodeType>,
    ctx: NodeContext,
    limiter: Option<Arc<RateLimiter>>,
    timeout_ms: Option<u64>,
    retry: Option<RetryPolicy>,
    event_bus: Arc<EventBus>,
) -> NodeAttempt {
    let start = Instant::now();
    let token = ctx.cancellation.clone();
    let mut attempts = 0;

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(NodeError::Cancelled),
        result = execute_with_retry(
            node_type.as_ref(),
            &ctx,
            limiter.as_deref(),
            timeout_ms,
            retry.as_ref(),
            &event_bus,
            &mut attempts,
        ) => result,
    };

    NodeAttempt {
        result,
        attempts,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

async fn execute_with_retry(
    node_type: &dyn NodeType,
    ctx: &NodeContext,
    limiter: Option<&RateLimiter>,
    timeout_ms: Option<u64>,
    retry: Option<&RetryPolicy>,
    event_bus: &EventBus,
    attempts: &mut u32,
) -> Result<NodeOutput, NodeError> {
    let max_attempts = retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);

    loop {
        let permit = match limiter {
            Some(limiter) => Some(limiter.acquire().await),
            None => None,
        };
        *attempts += 1;

        let execution = node_type.execute(ctx.clone());
        let result = match timeout_ms {
            Some(ms) => timeout(Duration::from_millis(ms), execution)
                .await
                .unwrap_or(Err(NodeError::Timeout { ms })),
            None => execution.await,
        };
        drop(permit);

        match (result, retry) {
            (Err(error), Some(policy)) if error.is_retryable() && *attempts < max_attempts => {
                let delay = policy.delay_for(*attempts);
                tracing::warn!(
                    "Node {} attempt {}/{} failed: {}. Retrying in {}ms",
                    ctx.node_name,
                    attempts,
                    max_attempts,
                    error,
                    delay.as_millis()
                );
                event_bus.emit(ExecutionEvent::NodeRetrying {
                    execution_id: ctx.execution_id,
                    node: ctx.node_name.clone(),
                    attempt: *attempts,
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
                sleep(delay).await;
            }
            (result, _) => return result,
        }
    }
}

/// No failed node and no skip caused by a failure or cancellation.
fn run_is_clean(record: &ExecutionRecord) -> bool {
    record.nodes.values().all(|run| {
        run.status != NodeStatus::Failed
            && run.skip_reason.map_or(true, |reason| reason.is_legitimate())
    })
}

fn first_failure(record: &ExecutionRecord) -> Option<String> {
    record
        .execution_order()
        .into_iter()
        .find_map(|name| {
            let failure = record.nodes.get(name)?.error.as_ref()?;
            Some(format!("Node '{}' failed: {}", name, failure.message))
        })
        .or_else(|| Some("upstream failure left nodes unexecuted".to_string()))
}
