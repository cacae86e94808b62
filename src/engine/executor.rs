//! Workflow executor.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn, Span};

use super::cache::{NodeResultRecord, ResultCache};
use super::hashing::{hash_inputs, interface_identity};
use super::plan::ExecutionPlan;
use crate::config::{ExecutionConfig, DEFAULT_BASE_DIR};
use crate::error::{Error, Result};
use crate::interfaces::{
    check_inputs, FieldKind, InputField, Interface, InterfaceRegistry, InterfaceResult, RunContext,
};
use crate::metrics;
use crate::script::eval_transform;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{Execution, ExecutionStatus, ExecutionSummary, NodeExecution, SqliteStorage};
use crate::workflow::{
    BackoffType, HashMethod, InstanceEdge, Node, NodeInstance, RetryConfig, Workflow,
    WorkflowSettings,
};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Workflow executor.
pub struct Executor {
    registry: InterfaceRegistry,
    storage: SqliteStorage,
    cache: ResultCache,
    /// Fallbacks from the config file
    defaults: ExecutionConfig,
    base_dir: Option<PathBuf>,
    max_concurrency: Option<usize>,
    hash_method: Option<HashMethod>,
    stop_on_first_crash: Option<bool>,
    timeout_override_seconds: Option<u64>,
    use_cache: bool,
    shutdown: Option<Arc<ShutdownCoordinator>>,
}

/// Settings for one run after CLI, workflow and config are merged.
#[derive(Debug, Clone, Copy)]
struct RunSettings {
    max_concurrency: usize,
    hash_method: HashMethod,
    stop_on_first_crash: bool,
    timeout_seconds: u64,
}

/// Outcome of an execution, as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution: Execution,
    pub summary: ExecutionSummary,
    /// Node instance records in execution order
    pub nodes: Vec<NodeExecution>,
}

impl ExecutionReport {
    pub fn node(&self, instance_id: &str) -> Option<&NodeExecution> {
        self.nodes.iter().find(|n| n.node_id == instance_id)
    }

    /// Output `port` of a finished instance.
    pub fn output(&self, instance_id: &str, port: &str) -> Option<&Value> {
        self.node(instance_id)?.outputs.as_ref()?.get(port)
    }

    pub fn failed_nodes(&self) -> Vec<&NodeExecution> {
        self.nodes
            .iter()
            .filter(|n| n.status == ExecutionStatus::Failed)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.execution.status == ExecutionStatus::Completed
    }
}

impl Executor {
    /// Create a new executor.
    pub fn new(registry: InterfaceRegistry, storage: SqliteStorage) -> Self {
        Self {
            registry,
            storage,
            cache: ResultCache::new(),
            defaults: ExecutionConfig::default(),
            base_dir: None,
            max_concurrency: None,
            hash_method: None,
            stop_on_first_crash: None,
            timeout_override_seconds: None,
            use_cache: true,
            shutdown: None,
        }
    }

    /// Use config-file values where neither the caller nor the workflow decides.
    pub fn with_defaults(mut self, defaults: ExecutionConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Root directory for node working directories.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Maximum number of interfaces running at once.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency.max(1));
        self
    }

    pub fn with_hash_method(mut self, hash_method: HashMethod) -> Self {
        self.hash_method = Some(hash_method);
        self
    }

    pub fn with_stop_on_first_crash(mut self, stop: bool) -> Self {
        self.stop_on_first_crash = Some(stop);
        self
    }

    /// Override workflow timeout for this execution.
    pub fn with_timeout_override(mut self, timeout_seconds: u64) -> Self {
        self.timeout_override_seconds = Some(timeout_seconds);
        self
    }

    /// Re-run every node; results are still written for later runs.
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Share a result cache between executors.
    pub fn with_result_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    /// Attach a shutdown coordinator to enable graceful shutdown handling.
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownCoordinator>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    fn resolve_base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .or_else(|| self.defaults.base_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR))
    }

    fn run_settings(&self, settings: &WorkflowSettings) -> RunSettings {
        RunSettings {
            max_concurrency: self
                .max_concurrency
                .or(settings.max_concurrency)
                .or(self.defaults.max_concurrency)
                .unwrap_or(DEFAULT_MAX_CONCURRENCY)
                .max(1),
            hash_method: self
                .hash_method
                .or(settings.hash_method)
                .or(self.defaults.hash_method)
                .unwrap_or_default(),
            stop_on_first_crash: self
                .stop_on_first_crash
                .or(settings.stop_on_first_crash)
                .or(self.defaults.stop_on_first_crash)
                .unwrap_or(false),
            timeout_seconds: self
                .timeout_override_seconds
                .unwrap_or(settings.timeout_seconds)
                .max(1),
        }
    }

    /// Validate, flatten and expand a workflow without running it.
    pub fn plan(&self, workflow: &Workflow) -> Result<ExecutionPlan> {
        ExecutionPlan::build(workflow, &self.registry, &self.resolve_base_dir())
    }

    /// Execute a workflow.
    #[instrument(name = "workflow.execute", skip(self, workflow), fields(workflow_name = %workflow.name))]
    pub async fn execute(&self, workflow: &Workflow) -> Result<ExecutionReport> {
        let plan = self.plan(workflow)?;
        self.execute_plan(&plan).await
    }

    /// Execute a prepared plan.
    ///
    /// Returns `Err` only when the run could not be recorded; node failures
    /// end up in the report with the execution marked failed.
    #[instrument(
        name = "workflow.run",
        skip(self, plan),
        fields(
            workflow_name = %plan.graph.name,
            instances = plan.expanded.len(),
            execution_id = tracing::field::Empty,
        )
    )]
    pub async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<ExecutionReport> {
        let registry = self.registry.with_declared(&plan.graph.interfaces)?;
        let settings = self.run_settings(&plan.settings);
        let execution_id = uuid::Uuid::new_v4().to_string();
        Span::current().record("execution_id", execution_id.as_str());

        let started = Instant::now();
        // Timeouts too large to represent mean no deadline.
        let deadline = started.checked_add(Duration::from_secs(settings.timeout_seconds));

        let mut execution = Execution {
            id: execution_id.clone(),
            workflow_name: plan.graph.name.clone(),
            status: ExecutionStatus::Running,
            base_dir: plan.base_dir.display().to_string(),
            node_count: plan.expanded.len() as u32,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        self.storage.save_execution(&execution).await?;

        info!(
            "Starting execution {} of workflow '{}' ({} instances, concurrency {})",
            execution_id,
            plan.graph.name,
            plan.expanded.len(),
            settings.max_concurrency
        );

        let shared = Arc::new(RunShared {
            cache: self.cache.clone(),
            semaphore: Semaphore::new(settings.max_concurrency),
            halt: AtomicBool::new(false),
            hash_method: settings.hash_method,
            use_cache: self.use_cache,
            deadline,
        });

        let expanded = &plan.expanded;
        let mut waiting: HashMap<&str, usize> = expanded
            .instances
            .iter()
            .map(|i| (i.id.as_str(), expanded.predecessors(&i.id).len()))
            .collect();
        let mut ready: VecDeque<String> = expanded
            .instances
            .iter()
            .filter(|i| waiting.get(i.id.as_str()) == Some(&0))
            .map(|i| i.id.clone())
            .collect();

        let mut records: HashMap<String, NodeExecution> = HashMap::new();
        let mut outputs: HashMap<String, BTreeMap<String, Value>> = HashMap::new();
        let mut failures: Vec<String> = Vec::new();
        let mut timed_out = false;
        let mut join_set: JoinSet<(String, InstanceOutcome)> = JoinSet::new();

        loop {
            if self.is_shutdown_requested() {
                shared.halt.store(true, Ordering::SeqCst);
            }

            while !shared.halted() {
                let Some(id) = ready.pop_front() else {
                    break;
                };
                if remaining_until(deadline).is_none() {
                    timed_out = true;
                    shared.halt.store(true, Ordering::SeqCst);
                    ready.push_front(id);
                    break;
                }

                let mut record = self.new_record(&execution_id, plan, &id);
                match self.prepare_job(plan, &registry, &id, &outputs) {
                    Ok(job) => {
                        record.inputs = inputs_to_json(&job.inputs);
                        record.node_dir = Some(job.node_dir.display().to_string());
                        self.storage.save_node_execution(&record).await?;
                        records.insert(id.clone(), record);
                        debug!("Spawning node instance '{}'", id);

                        let shared = shared.clone();
                        join_set.spawn(async move {
                            let outcome = run_instance(shared, &job).await;
                            (job.instance_id, outcome)
                        });
                    }
                    Err(e) => {
                        error!("Node '{}' could not start: {}", id, e);
                        record.status = ExecutionStatus::Failed;
                        record.error = Some(e.to_string());
                        record.finished_at = Some(Utc::now());
                        self.storage.save_node_execution(&record).await?;
                        metrics::record_node_execution(&record.interface, "failed");
                        records.insert(id.clone(), record);
                        failures.push(format!("{}: {}", id, e));
                        self.skip_descendants(&execution_id, plan, &id, &mut records)
                            .await?;
                        if settings.stop_on_first_crash {
                            shared.halt.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (id, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Node task failed to complete: {}", e);
                    failures.push(format!("node task failed: {}", e));
                    shared.halt.store(true, Ordering::SeqCst);
                    continue;
                }
            };

            let Some(mut record) = records.remove(&id) else {
                warn!("Finished instance '{}' has no record", id);
                continue;
            };
            record.finished_at = Some(Utc::now());

            match outcome {
                InstanceOutcome::Finished(done) => {
                    info!(
                        "Node '{}' {}",
                        id,
                        if done.cached { "reused cached result" } else { "completed" }
                    );
                    record.status = ExecutionStatus::Completed;
                    record.cached = done.cached;
                    record.hash = done.hash;
                    record.outputs = Some(inputs_to_json(&done.outputs));
                    metrics::record_node_execution(
                        &record.interface,
                        if done.cached { "cached" } else { "completed" },
                    );
                    outputs.insert(id.clone(), done.outputs);

                    for next in expanded.successors(&id) {
                        if let Some(count) = waiting.get_mut(next) {
                            *count = count.saturating_sub(1);
                            if *count == 0 && !records.contains_key(next) {
                                ready.push_back(next.to_string());
                            }
                        }
                    }
                }
                InstanceOutcome::Failed(e) => {
                    error!("Node '{}' failed: {}", id, e);
                    record.status = ExecutionStatus::Failed;
                    record.error = Some(e.to_string());
                    metrics::record_node_execution(&record.interface, "failed");
                    failures.push(format!("{}: {}", id, e));
                    self.skip_descendants(&execution_id, plan, &id, &mut records)
                        .await?;
                    if remaining_until(deadline).is_none() {
                        timed_out = true;
                        shared.halt.store(true, Ordering::SeqCst);
                    } else if settings.stop_on_first_crash {
                        warn!("Stopping after first failure");
                        shared.halt.store(true, Ordering::SeqCst);
                    }
                }
                InstanceOutcome::Cancelled => {
                    record.status = ExecutionStatus::Cancelled;
                    metrics::record_node_execution(&record.interface, "cancelled");
                }
            }

            self.storage.save_node_execution(&record).await?;
            records.insert(id, record);
        }

        // Whatever never ran was cut off by a halt.
        for instance in &expanded.instances {
            let pending = records
                .get(&instance.id)
                .map_or(true, |r| !r.status.is_terminal());
            if !pending {
                continue;
            }
            let mut record = records
                .remove(&instance.id)
                .unwrap_or_else(|| self.new_record(&execution_id, plan, &instance.id));
            record.status = ExecutionStatus::Cancelled;
            record.finished_at = Some(Utc::now());
            self.storage.save_node_execution(&record).await?;
            records.insert(instance.id.clone(), record);
        }

        if timed_out {
            failures.push(timeout_error_message(settings.timeout_seconds));
        }

        execution.finished_at = Some(Utc::now());
        execution.status = if !failures.is_empty() {
            ExecutionStatus::Failed
        } else if shared.halted() {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Completed
        };
        if !failures.is_empty() {
            execution.error = Some(format!(
                "{} failure(s): {}",
                failures.len(),
                failures.join("; ")
            ));
        }
        self.storage.save_execution(&execution).await?;

        let duration = started.elapsed();
        metrics::record_workflow_execution(&execution.status.to_string());
        metrics::record_workflow_duration(duration, &execution.workflow_name);

        let nodes: Vec<NodeExecution> = expanded
            .instances
            .iter()
            .filter_map(|i| records.remove(&i.id))
            .collect();
        let summary = ExecutionSummary::from_nodes(&nodes, duration.as_millis() as u64);

        info!(
            "Execution {} finished with status {} ({} completed, {} cached, {} failed, {} skipped, {}ms)",
            execution_id,
            execution.status,
            summary.nodes_completed,
            summary.nodes_cached,
            summary.nodes_failed,
            summary.nodes_skipped,
            summary.duration_ms
        );

        Ok(ExecutionReport {
            execution,
            summary,
            nodes,
        })
    }

    fn new_record(&self, execution_id: &str, plan: &ExecutionPlan, instance_id: &str) -> NodeExecution {
        let interface = plan
            .expanded
            .get(instance_id)
            .and_then(|i| plan.graph.get(&i.node_id))
            .map(|n| n.node.interface.clone())
            .unwrap_or_default();
        NodeExecution {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            node_id: instance_id.to_string(),
            interface,
            status: ExecutionStatus::Running,
            cached: false,
            hash: None,
            node_dir: plan.node_dir(instance_id).map(|p| p.display().to_string()),
            inputs: Value::Null,
            outputs: None,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    async fn skip_descendants(
        &self,
        execution_id: &str,
        plan: &ExecutionPlan,
        failed: &str,
        records: &mut HashMap<String, NodeExecution>,
    ) -> Result<()> {
        let descendants: BTreeSet<String> = plan.expanded.descendants(failed).into_iter().collect();

        for id in descendants {
            if records.contains_key(&id) {
                continue;
            }
            let mut record = self.new_record(execution_id, plan, &id);
            record.status = ExecutionStatus::Skipped;
            record.error = Some(format!("Upstream node '{}' failed", failed));
            record.finished_at = Some(Utc::now());
            self.storage.save_node_execution(&record).await?;
            debug!("Skipping node '{}' after failure of '{}'", id, failed);
            records.insert(id, record);
        }
        Ok(())
    }

    fn prepare_job(
        &self,
        plan: &ExecutionPlan,
        registry: &InterfaceRegistry,
        instance_id: &str,
        outputs: &HashMap<String, BTreeMap<String, Value>>,
    ) -> Result<InstanceJob> {
        let instance = plan
            .expanded
            .get(instance_id)
            .ok_or_else(|| Error::Internal(format!("Unknown instance '{}'", instance_id)))?;
        let flat = plan
            .graph
            .get(&instance.node_id)
            .ok_or_else(|| Error::Internal(format!("Unknown node '{}'", instance.node_id)))?;
        let interface = registry.get(&flat.node.interface).ok_or_else(|| {
            Error::Node(format!(
                "Node '{}' uses unknown interface '{}'",
                instance_id, flat.node.interface
            ))
        })?;
        let spec = interface.input_spec(&flat.node.config)?;

        let incoming = plan.expanded.incoming(instance_id);
        let mut inputs = resolve_instance_inputs(&flat.node, instance, &incoming, outputs)?;
        absolutize_files(spec.as_deref(), &mut inputs)?;

        let node_dir = plan
            .node_dir(instance_id)
            .ok_or_else(|| Error::Internal(format!("No directory planned for '{}'", instance_id)))?
            .to_path_buf();

        Ok(InstanceJob {
            instance_id: instance_id.to_string(),
            node: flat.node.clone(),
            interface,
            spec,
            inputs,
            node_dir,
            param_dirs: instance.param_dirs.clone(),
        })
    }
}

/// State shared by every task of one execution.
struct RunShared {
    cache: ResultCache,
    semaphore: Semaphore,
    /// Set on shutdown, timeout or a crash with `stop_on_first_crash`
    halt: AtomicBool,
    hash_method: HashMethod,
    use_cache: bool,
    deadline: Option<Instant>,
}

impl RunShared {
    fn halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }
}

/// Everything a task needs to run one instance.
struct InstanceJob {
    instance_id: String,
    node: Node,
    interface: Arc<dyn Interface>,
    spec: Option<Vec<InputField>>,
    inputs: BTreeMap<String, Value>,
    node_dir: PathBuf,
    param_dirs: Vec<String>,
}

struct Finished {
    outputs: BTreeMap<String, Value>,
    hash: Option<String>,
    cached: bool,
}

enum InstanceOutcome {
    Finished(Finished),
    Failed(Error),
    /// Halted before the interface started
    Cancelled,
}

fn inputs_to_json(values: &BTreeMap<String, Value>) -> Value {
    Value::Object(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn edge_value(
    edge: &InstanceEdge,
    outputs: &HashMap<String, BTreeMap<String, Value>>,
) -> Result<Value> {
    let value = outputs
        .get(&edge.source)
        .and_then(|o| o.get(&edge.source_port))
        .cloned()
        .ok_or_else(|| {
            Error::Execution(format!(
                "Node '{}' produced no output '{}'",
                edge.source, edge.source_port
            ))
        })?;

    match &edge.transform {
        Some(expression) => eval_transform(expression, value),
        None => Ok(value),
    }
}

/// Inputs of one instance: static values, then its iterable assignment, then
/// connected values. Join fields collect one value per joined branch.
fn resolve_instance_inputs(
    node: &Node,
    instance: &NodeInstance,
    incoming: &[&InstanceEdge],
    outputs: &HashMap<String, BTreeMap<String, Value>>,
) -> Result<BTreeMap<String, Value>> {
    let mut inputs = node.inputs.clone();
    inputs.extend(
        instance
            .iterable_inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let mut by_port: BTreeMap<&str, Vec<&InstanceEdge>> = BTreeMap::new();
    for edge in incoming {
        by_port.entry(edge.target_port.as_str()).or_default().push(edge);
    }

    for (port, mut edges) in by_port {
        edges.sort_by_key(|e| e.join_order.unwrap_or(0));
        let joined = node.join_fields.iter().any(|f| f == port)
            && edges.iter().any(|e| e.join_order.is_some());

        let value = if joined {
            Value::Array(
                edges
                    .iter()
                    .map(|e| edge_value(e, outputs))
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            match edges.first() {
                Some(edge) => edge_value(edge, outputs)?,
                None => Value::Null,
            }
        };
        inputs.insert(port.to_string(), value);
    }

    Ok(inputs)
}

fn absolutize(value: &mut Value, cwd: &Path) {
    match value {
        Value::String(s) if !s.is_empty() && Path::new(s.as_str()).is_relative() => {
            *s = cwd.join(s.as_str()).to_string_lossy().into_owned();
        }
        Value::Array(items) => {
            for item in items {
                absolutize(item, cwd);
            }
        }
        _ => {}
    }
}

/// File inputs are resolved against the launch directory; interfaces run
/// inside their node directory. Output names stay relative so each instance
/// (and each map element) writes into its own directory.
fn absolutize_files(spec: Option<&[InputField]>, inputs: &mut BTreeMap<String, Value>) -> Result<()> {
    let Some(spec) = spec else {
        return Ok(());
    };
    let is_input_file = |f: &&InputField| f.kind == FieldKind::File && !f.output_name;
    if !spec.iter().any(|f| is_input_file(&f)) {
        return Ok(());
    }
    let cwd = std::env::current_dir()?;
    for field in spec.iter().filter(is_input_file) {
        if let Some(value) = inputs.get_mut(&field.name) {
            absolutize(value, &cwd);
        }
    }
    Ok(())
}

#[instrument(
    name = "node.execute",
    skip_all,
    fields(node_id = %job.instance_id, interface = %job.node.interface)
)]
async fn run_instance(shared: Arc<RunShared>, job: &InstanceJob) -> InstanceOutcome {
    let result = if job.node.is_map() {
        run_map(&shared, job).await
    } else {
        run_cached(&shared, job, &job.instance_id, job.inputs.clone(), &job.node_dir).await
    };

    match result {
        Ok(Some(done)) => InstanceOutcome::Finished(done),
        Ok(None) => InstanceOutcome::Cancelled,
        Err(e) => InstanceOutcome::Failed(e),
    }
}

/// Run one interface invocation in `node_dir`, reusing a stored result when
/// the input hash matches. `Ok(None)` means the run was halted first.
async fn run_cached(
    shared: &RunShared,
    job: &InstanceJob,
    label: &str,
    mut inputs: BTreeMap<String, Value>,
    node_dir: &Path,
) -> Result<Option<Finished>> {
    if let Some(spec) = &job.spec {
        check_inputs(label, spec, &mut inputs)?;
    }

    let hashed = {
        let identity = interface_identity(job.interface.as_ref(), &job.node.config);
        let spec = job.spec.clone();
        let inputs = inputs.clone();
        let method = shared.hash_method;
        tokio::task::spawn_blocking(move || hash_inputs(&identity, spec.as_deref(), &inputs, method))
            .await
            .map_err(|e| Error::Internal(format!("Hashing task failed: {}", e)))??
    };

    let use_cache = shared.use_cache && job.interface.cacheable() && !job.node.overwrite;
    if use_cache {
        let hit = shared.cache.lookup(node_dir, &hashed.hash).await;
        metrics::record_cache_lookup(hit.is_some());
        if let Some(record) = hit {
            debug!(node_id = %label, hash = %hashed.hash, "Cache hit");
            return Ok(Some(Finished {
                outputs: record.outputs.clone(),
                hash: Some(hashed.hash),
                cached: true,
            }));
        }
    }

    let _permit = shared
        .semaphore
        .acquire()
        .await
        .map_err(|e| Error::Internal(format!("Scheduler closed: {}", e)))?;
    if shared.halted() {
        return Ok(None);
    }

    shared.cache.prepare(node_dir).await?;
    let mut ctx = RunContext::new(label, node_dir.to_path_buf())
        .with_inputs(inputs)
        .with_param_dirs(job.param_dirs.clone());
    ctx.hash_method = shared.hash_method;

    metrics::inc_active_nodes();
    let result = run_with_retry(&job.interface, &job.node, &ctx, shared.deadline).await;
    metrics::dec_active_nodes();
    let result = result?;

    let record = NodeResultRecord {
        node_id: label.to_string(),
        interface: job.node.interface.clone(),
        hash: hashed.hash.clone(),
        inputs: ctx.inputs,
        outputs: result.outputs,
        runtime: result.runtime,
        finished_at: Utc::now(),
    };
    let stored = shared
        .cache
        .store(node_dir, record, &hashed.hashed_inputs)
        .await?;

    Ok(Some(Finished {
        outputs: stored.outputs.clone(),
        hash: Some(hashed.hash),
        cached: false,
    }))
}

fn map_length(job: &InstanceJob) -> Result<usize> {
    let mut length = None;
    for field in &job.node.map_over {
        let items = match job.inputs.get(field) {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => {
                return Err(Error::Node(format!(
                    "Node '{}' maps over '{}', which is not set",
                    job.instance_id, field
                )))
            }
            Some(_) => {
                return Err(Error::Node(format!(
                    "Node '{}' maps over '{}', which is not a list",
                    job.instance_id, field
                )))
            }
        };
        match length {
            None => length = Some(items.len()),
            Some(n) if n != items.len() => {
                return Err(Error::Node(format!(
                    "Node '{}' maps over lists of different lengths",
                    job.instance_id
                )))
            }
            Some(_) => {}
        }
    }
    Ok(length.unwrap_or(0))
}

/// Run the interface once per element of the `map_over` lists, each in its
/// own `mapflow/_<node><i>` directory, and gather outputs into lists.
async fn run_map(shared: &RunShared, job: &InstanceJob) -> Result<Option<Finished>> {
    let length = map_length(job)?;
    debug!("Map node '{}' runs {} elements", job.instance_id, length);

    let runs = (0..length).map(|i| {
        let mut inputs = job.inputs.clone();
        for field in &job.node.map_over {
            if let Some(Value::Array(items)) = job.inputs.get(field) {
                inputs.insert(field.clone(), items[i].clone());
            }
        }
        let dir = job
            .node_dir
            .join("mapflow")
            .join(format!("_{}{}", job.node.name, i));
        let label = format!("{}#{}", job.instance_id, i);
        async move { run_cached(shared, job, &label, inputs, &dir).await }
    });
    let results = futures::future::try_join_all(runs).await?;

    let mut elements = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Some(done) => elements.push(done),
            None => return Ok(None),
        }
    }

    let mut ports: BTreeSet<String> = job
        .interface
        .output_names(&job.node.config)?
        .unwrap_or_default()
        .into_iter()
        .collect();
    for element in &elements {
        ports.extend(element.outputs.keys().cloned());
    }

    let outputs = ports
        .into_iter()
        .map(|port| {
            let values = elements
                .iter()
                .map(|e| e.outputs.get(&port).cloned().unwrap_or(Value::Null))
                .collect();
            (port, Value::Array(values))
        })
        .collect();

    Ok(Some(Finished {
        outputs,
        hash: None,
        cached: !elements.is_empty() && elements.iter().all(|e| e.cached),
    }))
}

fn timeout_error_message(timeout_seconds: u64) -> String {
    format!("Workflow timed out after {} seconds", timeout_seconds)
}

/// Time left before `deadline`; `None` once it has passed.
fn remaining_until(deadline: Option<Instant>) -> Option<Duration> {
    let Some(deadline) = deadline else {
        return Some(Duration::MAX);
    };
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline.saturating_duration_since(now))
    }
}

fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.delay_seconds;
    let secs = match config.backoff {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(attempt as u64),
        BackoffType::Exponential => {
            let shift = attempt.saturating_sub(1).min(20);
            base.saturating_mul(1u64 << shift)
        }
    };
    Duration::from_secs(secs)
}

async fn run_with_retry(
    interface: &Arc<dyn Interface>,
    node: &Node,
    ctx: &RunContext,
    deadline: Option<Instant>,
) -> Result<InterfaceResult> {
    let retry = node.retry.as_ref();
    let max_attempts = retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);
    let node_timeout = node.timeout_seconds.map(Duration::from_secs);
    let mut attempt = 1u32;
    let node_start = Instant::now();

    loop {
        let remaining = remaining_until(deadline)
            .ok_or_else(|| Error::Execution("Workflow execution timed out".to_string()))?;
        let limit = node_timeout.map_or(remaining, |t| t.min(remaining));

        match timeout(limit, interface.run(&node.config, ctx)).await {
            Ok(Ok(result)) => {
                metrics::record_node_duration(node_start.elapsed(), interface.name());
                return Ok(result);
            }
            Ok(Err(e)) => {
                if attempt >= max_attempts || !e.is_retryable() {
                    metrics::record_node_duration(node_start.elapsed(), interface.name());
                    return Err(e);
                }

                if let Some(retry_cfg) = retry {
                    let delay = retry_delay(retry_cfg, attempt);
                    let remaining = remaining_until(deadline).ok_or_else(|| {
                        Error::Execution("Workflow execution timed out".to_string())
                    })?;

                    if delay > remaining {
                        return Err(Error::Execution(format!(
                            "Node '{}' failed and retry delay exceeds remaining workflow timeout: {}",
                            ctx.node_id, e
                        )));
                    }

                    warn!(
                        "Node '{}' attempt {}/{} failed: {}. Retrying in {}s",
                        ctx.node_id,
                        attempt,
                        max_attempts,
                        e,
                        delay.as_secs()
                    );
                    sleep(delay).await;
                }

                attempt = attempt.saturating_add(1);
            }
            Err(_) => {
                metrics::record_node_duration(node_start.elapsed(), interface.name());
                return Err(Error::Execution(format!(
                    "Node '{}' timed out after {}s",
                    ctx.node_id,
                    limit.as_secs()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Fails until it has been called `succeed_on` times.
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Interface for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, _config: &Value, _ctx: &RunContext) -> Result<InterfaceResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                return Err(Error::Execution(format!("attempt {} failed", call)));
            }
            let mut outputs = BTreeMap::new();
            outputs.insert("calls".to_string(), json!(call));
            Ok(InterfaceResult::new(outputs))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Interface for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn run(&self, _config: &Value, _ctx: &RunContext) -> Result<InterfaceResult> {
            sleep(Duration::from_secs(5)).await;
            Ok(InterfaceResult::default())
        }
    }

    fn executor(base: &Path) -> Executor {
        Executor::new(
            InterfaceRegistry::new(),
            SqliteStorage::open_in_memory().unwrap(),
        )
        .with_base_dir(base)
    }

    fn executor_with(base: &Path, interface: Arc<dyn Interface>) -> Executor {
        let mut registry = InterfaceRegistry::new();
        registry.register(interface);
        Executor::new(registry, SqliteStorage::open_in_memory().unwrap()).with_base_dir(base)
    }

    const CHAIN: &str = r#"
name: chain
nodes:
  - name: source
    interface: identity
    config: { fields: [x] }
    inputs: { x: 3 }
  - name: double
    interface: function
    config: { inputs: [x], outputs: [y], script: "x * 2" }
  - name: sink
    interface: identity
    config: { fields: [value] }
connections:
  - from: source.x
    to: double.x
  - from: double.y
    to: sink.value
    transform: "value + 1"
"#;

    #[tokio::test]
    async fn test_execute_simple_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(CHAIN).unwrap();
        let report = executor(tmp.path()).execute(&workflow).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.output("double", "y"), Some(&json!(6)));
        assert_eq!(report.output("sink", "value"), Some(&json!(7)));
        assert_eq!(report.summary.nodes_total, 3);
        assert!(tmp.path().join("chain").join("double").join("result.json").exists());
    }

    #[tokio::test]
    async fn test_execution_recorded_in_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open_in_memory().unwrap();
        let executor = Executor::new(InterfaceRegistry::new(), storage.clone()).with_base_dir(tmp.path());
        let report = executor.execute(&parse_workflow(CHAIN).unwrap()).await.unwrap();

        let trace = storage
            .get_execution_trace(&report.execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trace.execution.status, ExecutionStatus::Completed);
        assert_eq!(trace.execution.node_count, 3);
        assert_eq!(trace.nodes.len(), 3);
        assert!(trace
            .nodes
            .iter()
            .all(|n| n.status == ExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn test_second_run_uses_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(CHAIN).unwrap();

        let first = executor(tmp.path()).execute(&workflow).await.unwrap();
        assert!(!first.node("double").unwrap().cached);

        let second = executor(tmp.path()).execute(&workflow).await.unwrap();
        let double = second.node("double").unwrap();
        assert!(double.cached);
        assert_eq!(double.hash, first.node("double").unwrap().hash);
        assert_eq!(second.output("sink", "value"), Some(&json!(7)));
        // identity is never cached
        assert!(!second.node("sink").unwrap().cached);

        let forced = executor(tmp.path())
            .without_cache()
            .execute(&workflow)
            .await
            .unwrap();
        assert!(!forced.node("double").unwrap().cached);
    }

    #[tokio::test]
    async fn test_changed_input_invalidates_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let mut workflow = parse_workflow(CHAIN).unwrap();
        executor(tmp.path()).execute(&workflow).await.unwrap();

        workflow.set_input("source", "x", json!(10)).unwrap();
        let report = executor(tmp.path()).execute(&workflow).await.unwrap();
        assert!(!report.node("double").unwrap().cached);
        assert_eq!(report.output("sink", "value"), Some(&json!(21)));
    }

    #[tokio::test]
    async fn test_iterables_and_join() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(
            r#"
name: sweep
nodes:
  - name: iter_fwhm
    interface: identity
    config: { fields: [fwhm] }
    iterables:
      fwhm: [4, 8, 12]
  - name: smooth
    interface: function
    config: { inputs: [fwhm], outputs: [sigma], script: "fwhm * 10" }
  - name: collect
    interface: identity
    config: { fields: [sigmas] }
    join_source: iter_fwhm
    join_fields: [sigmas]
connections:
  - from: iter_fwhm.fwhm
    to: smooth.fwhm
  - from: smooth.sigma
    to: collect.sigmas
"#,
        )
        .unwrap();

        let report = executor(tmp.path()).execute(&workflow).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.summary.nodes_total, 3 + 3 + 1);
        assert_eq!(report.output("smooth[iter_fwhm=2]", "sigma"), Some(&json!(120)));
        assert_eq!(report.output("collect", "sigmas"), Some(&json!([40, 80, 120])));
        assert!(tmp
            .path()
            .join("sweep")
            .join("_fwhm_8")
            .join("smooth")
            .join("result.json")
            .exists());
    }

    #[tokio::test]
    async fn test_map_node_runs_per_element() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(
            r#"
name: mapped
nodes:
  - name: square
    interface: function
    config: { inputs: [x, offset], outputs: [y], script: "x * x + offset" }
    inputs: { x: [1, 2, 3], offset: 1 }
    map_over: [x]
"#,
        )
        .unwrap();

        let report = executor(tmp.path()).execute(&workflow).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.output("square", "y"), Some(&json!([2, 5, 10])));
        assert!(tmp
            .path()
            .join("mapped/square/mapflow/_square1/result.json")
            .exists());

        let again = executor(tmp.path()).execute(&workflow).await.unwrap();
        assert!(again.node("square").unwrap().cached);
    }

    #[tokio::test]
    async fn test_map_over_unequal_lists_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(
            r#"
name: mapped
nodes:
  - name: add
    interface: function
    config: { inputs: [a, b], outputs: [c], script: "a + b" }
    inputs: { a: [1, 2], b: [1] }
    map_over: [a, b]
"#,
        )
        .unwrap();

        let report = executor(tmp.path()).execute(&workflow).await.unwrap();
        assert_eq!(report.execution.status, ExecutionStatus::Failed);
        assert!(report.node("add").unwrap().error.as_deref().unwrap().contains("different lengths"));
    }

    const BRANCHES: &str = r#"
name: branches
nodes:
  - name: broken
    interface: function
    config: { inputs: [], outputs: [y], script: "throw \"boom\"" }
  - name: after_broken
    interface: identity
    config: { fields: [y] }
  - name: healthy
    interface: function
    config: { inputs: [], outputs: [y], script: "42" }
connections:
  - from: broken.y
    to: after_broken.y
"#;

    #[tokio::test]
    async fn test_failure_skips_descendants_only() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(BRANCHES).unwrap();
        let report = executor(tmp.path()).execute(&workflow).await.unwrap();

        assert_eq!(report.execution.status, ExecutionStatus::Failed);
        assert!(report.execution.error.as_deref().unwrap().contains("broken"));
        assert_eq!(report.node("broken").unwrap().status, ExecutionStatus::Failed);
        assert_eq!(report.node("after_broken").unwrap().status, ExecutionStatus::Skipped);
        assert_eq!(report.node("healthy").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(report.failed_nodes().len(), 1);
        assert_eq!(report.summary.nodes_skipped, 1);
    }

    #[tokio::test]
    async fn test_stop_on_first_crash() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(BRANCHES).unwrap();
        let report = executor(tmp.path())
            .with_max_concurrency(1)
            .with_stop_on_first_crash(true)
            .execute(&workflow)
            .await
            .unwrap();

        assert_eq!(report.execution.status, ExecutionStatus::Failed);
        assert_ne!(report.node("healthy").unwrap().status, ExecutionStatus::Failed);
        assert_ne!(report.node("healthy").unwrap().status, ExecutionStatus::Running);
        assert_eq!(report.nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let tmp = tempfile::tempdir().unwrap();
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        });
        let workflow = parse_workflow(
            r#"
name: retrying
nodes:
  - name: unstable
    interface: flaky
    retry:
      max_attempts: 3
      delay_seconds: 0
      backoff: fixed
"#,
        )
        .unwrap();

        let report = executor_with(tmp.path(), flaky.clone())
            .execute(&workflow)
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.output("unstable", "calls"), Some(&json!(3)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 10,
        });
        let workflow = parse_workflow(
            r#"
name: retrying
nodes:
  - name: unstable
    interface: flaky
    retry: { max_attempts: 2, delay_seconds: 0 }
"#,
        )
        .unwrap();

        let report = executor_with(tmp.path(), flaky.clone())
            .execute(&workflow)
            .await
            .unwrap();
        assert_eq!(report.execution.status, ExecutionStatus::Failed);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_node_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(
            r#"
name: slow
nodes:
  - name: nap
    interface: sleepy
    timeout_seconds: 1
"#,
        )
        .unwrap();

        let report = executor_with(tmp.path(), Arc::new(Sleepy))
            .execute(&workflow)
            .await
            .unwrap();
        assert_eq!(report.execution.status, ExecutionStatus::Failed);
        assert!(report.node("nap").unwrap().error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_workflow_deadline_fails_execution() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(
            r#"
name: slow
nodes:
  - name: nap
    interface: sleepy
  - name: after
    interface: identity
    config: { fields: [x] }
connections:
  - from: nap.done
    to: after.x
"#,
        )
        .unwrap();

        let report = executor_with(tmp.path(), Arc::new(Sleepy))
            .with_timeout_override(1)
            .execute(&workflow)
            .await
            .unwrap();
        assert_eq!(report.execution.status, ExecutionStatus::Failed);
        let error = report.execution.error.as_deref().unwrap();
        assert!(error.contains("Workflow timed out after 1 seconds"), "{}", error);
        assert_eq!(report.node("after").unwrap().status, ExecutionStatus::Skipped);
    }

    #[tokio::test]
    async fn test_huge_timeout_means_no_deadline() {
        let tmp = tempfile::tempdir().unwrap();
        let report = executor(tmp.path())
            .with_timeout_override(u64::MAX)
            .execute(&parse_workflow(CHAIN).unwrap())
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.execution.error);
        assert_eq!(report.output("sink", "value"), Some(&json!(7)));
    }

    #[test]
    fn test_remaining_until() {
        assert_eq!(remaining_until(None), Some(Duration::MAX));
        assert!(remaining_until(Some(Instant::now())).is_none());
        let ahead = Instant::now() + Duration::from_secs(60);
        assert!(remaining_until(Some(ahead)).unwrap() > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_execution() {
        let tmp = tempfile::tempdir().unwrap();
        let shutdown = Arc::new(ShutdownCoordinator::new());
        shutdown.request_shutdown();

        let report = executor(tmp.path())
            .with_shutdown(shutdown)
            .execute(&parse_workflow(CHAIN).unwrap())
            .await
            .unwrap();
        assert_eq!(report.execution.status, ExecutionStatus::Cancelled);
        assert!(report
            .nodes
            .iter()
            .all(|n| n.status == ExecutionStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_invalid_workflow_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let workflow = parse_workflow(
            r#"
name: bad
nodes:
  - name: a
    interface: nope
"#,
        )
        .unwrap();
        assert!(executor(tmp.path()).execute(&workflow).await.is_err());
    }

    #[test]
    fn test_settings_precedence() {
        let executor = Executor::new(
            InterfaceRegistry::new(),
            SqliteStorage::open_in_memory().unwrap(),
        )
        .with_defaults(ExecutionConfig {
            max_concurrency: Some(2),
            hash_method: Some(HashMethod::Content),
            ..ExecutionConfig::default()
        })
        .with_max_concurrency(8);

        let settings = WorkflowSettings {
            max_concurrency: Some(3),
            stop_on_first_crash: Some(true),
            ..WorkflowSettings::default()
        };
        let resolved = executor.run_settings(&settings);
        assert_eq!(resolved.max_concurrency, 8);
        assert_eq!(resolved.hash_method, HashMethod::Content);
        assert!(resolved.stop_on_first_crash);
        assert_eq!(resolved.timeout_seconds, 86400);
    }

    #[test]
    fn test_resolve_inputs_orders_join_values() {
        let node = Node::new("collect", "identity").with_join("iter", &["files"]);
        let instance = NodeInstance {
            id: "collect".to_string(),
            node_id: "collect".to_string(),
            assignment: BTreeMap::new(),
            iterable_inputs: BTreeMap::new(),
            param_dirs: Vec::new(),
        };
        let edge = |source: &str, order: usize| InstanceEdge {
            source: source.to_string(),
            source_port: "out".to_string(),
            target: "collect".to_string(),
            target_port: "files".to_string(),
            transform: Some("value + \".nii\"".to_string()),
            join_order: Some(order),
        };
        let edges = [edge("b[iter=1]", 1), edge("b[iter=0]", 0)];
        let incoming: Vec<&InstanceEdge> = edges.iter().collect();

        let mut outputs = HashMap::new();
        outputs.insert("b[iter=0]".to_string(), BTreeMap::from([("out".to_string(), json!("first"))]));
        outputs.insert("b[iter=1]".to_string(), BTreeMap::from([("out".to_string(), json!("second"))]));

        let inputs = resolve_instance_inputs(&node, &instance, &incoming, &outputs).unwrap();
        assert_eq!(inputs["files"], json!(["first.nii", "second.nii"]));
    }

    #[test]
    fn test_absolutize_file_inputs() {
        let spec = vec![
            InputField::new("in_file", FieldKind::File),
            InputField::new("label", FieldKind::String),
        ];
        let mut inputs = BTreeMap::from([
            ("in_file".to_string(), json!(["a.nii", "/abs/b.nii"])),
            ("label".to_string(), json!("rel")),
        ]);
        absolutize_files(Some(spec.as_slice()), &mut inputs).unwrap();

        let files = inputs["in_file"].as_array().unwrap();
        assert!(Path::new(files[0].as_str().unwrap()).is_absolute());
        assert_eq!(files[1], json!("/abs/b.nii"));
        assert_eq!(inputs["label"], json!("rel"));
    }

    #[test]
    fn test_output_names_stay_relative() {
        let mut out_file = InputField::new("out_file", FieldKind::File);
        out_file.output_name = true;
        let spec = vec![InputField::new("in_file", FieldKind::File), out_file];
        let mut inputs = BTreeMap::from([
            ("in_file".to_string(), json!("a.nii")),
            ("out_file".to_string(), json!("result.txt")),
        ]);
        absolutize_files(Some(spec.as_slice()), &mut inputs).unwrap();

        assert!(Path::new(inputs["in_file"].as_str().unwrap()).is_absolute());
        assert_eq!(inputs["out_file"], json!("result.txt"));
    }

    #[test]
    fn test_retry_delay_fixed() {
        let config = RetryConfig {
            max_attempts: 3,
            delay_seconds: 2,
            backoff: BackoffType::Fixed,
        };
        assert_eq!(retry_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&config, 3), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_delay_linear_and_exponential() {
        let linear = RetryConfig {
            max_attempts: 3,
            delay_seconds: 2,
            backoff: BackoffType::Linear,
        };
        assert_eq!(retry_delay(&linear, 3), Duration::from_secs(6));

        let exponential = RetryConfig {
            max_attempts: 5,
            delay_seconds: 1,
            backoff: BackoffType::Exponential,
        };
        assert_eq!(retry_delay(&exponential, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(&exponential, 4), Duration::from_secs(8));
    }
}
