//! Top-level control flow: execute, trace, pause and resume.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::models::execution::ExecutionResult;
use crate::models::workflow::{ApprovalGrant, ApprovalRequest, PendingWorkflow};
use crate::sandbox::remote::API_KEY_HEADER;
use crate::sandbox::{
    ExecutionOptions, ExecutorConfig, HeaderSource, RemoteToolClient, SandboxExecutor,
    StaticHeaders, StaticRoutingPolicy, ToolHandler, WorkerFactory,
};
use crate::session::SessionClient;
use crate::trace::{FlushReport, SyncerConfig, TraceCollector, TraceSyncer};
use crate::workflow::PendingWorkflowStore;
use crate::{AppError, Result};

/// Code to run and where its trace belongs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Code executed inside the isolated context.
    pub code: String,
    /// Context object handed to the code.
    pub context: Value,
    /// Capability the code implements, used to label the trace.
    pub capability_id: String,
    /// Trace of the execution that triggered this one.
    pub parent_trace_id: Option<String>,
}

/// What happened to a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The execution finished, successfully or not.
    Completed {
        /// Execution result.
        result: ExecutionResult,
        /// Id of the queued trace.
        trace_id: String,
    },
    /// The execution is paused until `workflow_id` is approved.
    ApprovalRequired {
        /// Id to pass to [`Mediator::continue_workflow`].
        workflow_id: String,
        /// What needs approving.
        request: ApprovalRequest,
        /// Id of the queued trace.
        trace_id: String,
    },
    /// The operator declined the approval.
    Rejected {
        /// Workflow that was declined.
        workflow_id: String,
    },
}

/// Wires executor, trace pipeline, workflow store and session together.
pub struct Mediator {
    executor: SandboxExecutor,
    collector: TraceCollector,
    syncer: Arc<TraceSyncer>,
    workflows: PendingWorkflowStore,
    session: Option<Arc<SessionClient>>,
}

impl Mediator {
    /// Assemble a mediator from parts.
    #[must_use]
    pub fn new(
        executor: SandboxExecutor,
        collector: TraceCollector,
        syncer: Arc<TraceSyncer>,
        workflows: PendingWorkflowStore,
        session: Option<Arc<SessionClient>>,
    ) -> Self {
        Self {
            executor,
            collector,
            syncer,
            workflows,
            session,
        }
    }

    /// Build the production mediator: worker processes, static routing,
    /// remote calls and trace sync when a cloud url is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client or the redaction rules cannot be
    /// built.
    pub fn from_config(config: &GlobalConfig, session: Option<Arc<SessionClient>>) -> Result<Self> {
        let headers: Arc<dyn HeaderSource> = match &session {
            Some(session) => Arc::clone(session) as Arc<dyn HeaderSource>,
            None => Arc::new(api_key_headers(config.cloud.api_key.as_deref())),
        };

        let remote = config
            .cloud
            .url
            .as_deref()
            .map(|url| RemoteToolClient::new(url, config.timeouts.http(), Arc::clone(&headers)))
            .transpose()?;

        let executor = SandboxExecutor::new(
            ExecutorConfig::from_global(config),
            Arc::new(WorkerFactory::new(
                config.worker.clone(),
                config.workspace_root.clone(),
            )),
            Arc::new(StaticRoutingPolicy::from_config(&config.routing)),
            remote,
        );
        let syncer = TraceSyncer::new(SyncerConfig::from_global(config), headers)?;
        let workflows = PendingWorkflowStore::new(std::time::Duration::from_secs(
            config.workflows.ttl_seconds,
        ));

        Ok(Self::new(
            executor,
            TraceCollector::new()?,
            Arc::new(syncer),
            workflows,
            session,
        ))
    }

    /// Execute `request`, queue its trace and start a background flush.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn run(&self, request: RunRequest, handler: Option<Arc<dyn ToolHandler>>) -> RunOutcome {
        self.run_with(request, handler, ExecutionOptions::default())
            .await
    }

    /// Resume a paused workflow.
    ///
    /// The entry is consumed either way. On approval the original code runs
    /// again with the grant attached.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when `workflow_id` is unknown or expired;
    /// the caller must restart the execution.
    pub async fn continue_workflow(
        &self,
        workflow_id: &str,
        approved: bool,
        handler: Option<Arc<dyn ToolHandler>>,
    ) -> Result<RunOutcome> {
        let Some(pending) = self.workflows.get(workflow_id) else {
            return Err(AppError::NotFound(format!(
                "workflow '{workflow_id}' is unknown or expired; restart the execution"
            )));
        };
        self.workflows.delete(workflow_id);

        if !approved {
            info!(workflow_id, method = %pending.method, "approval declined");
            return Ok(RunOutcome::Rejected {
                workflow_id: workflow_id.to_owned(),
            });
        }

        info!(workflow_id, method = %pending.method, "approval granted; resuming");
        let grant = ApprovalGrant {
            workflow_id: workflow_id.to_owned(),
            kind: pending.kind,
            method: pending.method,
            payload: pending.payload,
        };
        let request = RunRequest {
            code: pending.code,
            context: pending.context,
            capability_id: pending.capability_id,
            parent_trace_id: pending.parent_trace_id,
        };
        Ok(self
            .run_with(request, handler, ExecutionOptions { grant: Some(grant) })
            .await)
    }

    /// Final trace flush; further runs are not traced.
    pub async fn shutdown(&self) -> FlushReport {
        self.syncer.shutdown().await
    }

    /// The trace syncer.
    #[must_use]
    pub fn syncer(&self) -> &Arc<TraceSyncer> {
        &self.syncer
    }

    /// The pending workflow store.
    #[must_use]
    pub fn workflows(&self) -> &PendingWorkflowStore {
        &self.workflows
    }

    async fn run_with(
        &self,
        request: RunRequest,
        handler: Option<Arc<dyn ToolHandler>>,
        options: ExecutionOptions,
    ) -> RunOutcome {
        let result = self
            .executor
            .execute_with(&request.code, request.context.clone(), handler, options)
            .await;

        let label = match self.session.as_ref().and_then(|session| session.scope()) {
            Some(scope) => scope.fqdn(&request.capability_id),
            None => request.capability_id.clone(),
        };
        let trace = self
            .collector
            .build(&label, request.parent_trace_id.clone(), &result);
        let trace_id = trace.trace_id.clone();
        if let Err(err) = self.syncer.enqueue(trace) {
            warn!(%err, trace_id = %trace_id, "trace not queued");
        }
        let syncer = Arc::clone(&self.syncer);
        tokio::spawn(async move {
            syncer.flush().await;
        });

        match result.approval.clone() {
            Some(approval) => {
                let workflow_id = self.workflows.create(PendingWorkflow {
                    code: request.code,
                    context: request.context,
                    capability_id: request.capability_id,
                    parent_trace_id: request.parent_trace_id,
                    method: approval.method.clone(),
                    kind: approval.kind,
                    payload: approval.payload.clone(),
                    created_at: chrono::Utc::now(),
                });
                info!(workflow_id = %workflow_id, method = %approval.method, "workflow paused");
                RunOutcome::ApprovalRequired {
                    workflow_id,
                    request: approval,
                    trace_id,
                }
            }
            None => RunOutcome::Completed { result, trace_id },
        }
    }
}

fn api_key_headers(api_key: Option<&str>) -> StaticHeaders {
    let mut headers = HeaderMap::new();
    if let Some(value) = api_key.and_then(|key| HeaderValue::from_str(key).ok()) {
        headers.insert(API_KEY_HEADER, value);
    }
    StaticHeaders(headers)
}
