use crate::executor::WorkflowExecutor;
use crate::limits::RateLimiters;
use crate::registry::NodeRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wfcore::{
    EventBus, ExecutionEvent, ExecutionId, ExecutionRecord, ExecutionRequest, FlowError, Workflow,
    WorkflowError, WorkflowId,
};

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    executor: WorkflowExecutor,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
    workflows: Arc<RwLock<HashMap<WorkflowId, Arc<Workflow>>>>,
}

impl FlowRuntime {
    /// Create a runtime over a frozen registry with default settings
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let limiters = Arc::new(RateLimiters::from_registry(&registry));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = WorkflowExecutor::new(
            registry.clone(),
            limiters,
            event_bus.clone(),
            config.clone(),
        );

        Self {
            registry,
            executor,
            event_bus,
            config,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a workflow
    pub async fn register_workflow(&self, workflow: Workflow) -> WorkflowId {
        let id = workflow.id;
        let mut workflows = self.workflows.write().await;
        workflows.insert(id, Arc::new(workflow));
        id
    }

    pub async fn workflow(&self, workflow_id: WorkflowId) -> Option<Arc<Workflow>> {
        self.workflows.read().await.get(&workflow_id).cloned()
    }

    /// Execute a registered workflow by ID
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        request: ExecutionRequest,
    ) -> Result<ExecutionRecord, FlowError> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| FlowError::Workflow(WorkflowError::NotFound(workflow_id.to_string())))?;

        self.executor.run(&workflow, request).await
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(
        &self,
        workflow: &Workflow,
        request: ExecutionRequest,
    ) -> Result<ExecutionRecord, FlowError> {
        self.executor.run(workflow, request).await
    }

    /// Run a workflow in the background. The handle can cancel the run and
    /// wait for its record.
    pub fn start(&self, workflow: Arc<Workflow>, request: ExecutionRequest) -> ExecutionHandle {
        let execution_id = ExecutionId::new_v4();
        let cancellation = CancellationToken::new();
        let executor = self.executor.clone();
        let token = cancellation.clone();

        let task = tokio::spawn(async move {
            executor
                .execute(&workflow, request, execution_id, token)
                .await
        });

        ExecutionHandle {
            execution_id,
            cancellation,
            task,
        }
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// Handle for a run started with [`FlowRuntime::start`]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    cancellation: CancellationToken,
    task: JoinHandle<Result<ExecutionRecord, FlowError>>,
}

impl ExecutionHandle {
    /// Stop dispatching and abandon in-flight nodes at their next await.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Token that cancels this run, for handing to signal handlers.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<ExecutionRecord, FlowError> {
        self.task
            .await
            .map_err(|e| FlowError::Execution(format!("Task join error: {}", e)))?
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on concurrently running nodes per run; workflows may ask
    /// for less.
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Used when neither the node nor the workflow sets a timeout.
    pub default_node_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            default_node_timeout_ms: None,
        }
    }
}
