//! Summary → Plan → Evaluation orchestration.
//!
//! One request runs either all three stages or a single one:
//! 1. **Retrieve** web context for the task once, degrading to empty on failure
//! 2. **Generate** each requested stage in order, feeding each the previous
//!    stage's output (or, for a single stage, the value recalled from memory)
//! 3. **Commit** all five artifacts to memory, full runs only
//! 4. **Export** the request's artifacts, if asked
//!
//! Usage:
//! ```bash
//! crossprompt run --task "Build X" --export
//! crossprompt run --task "Build X" --stage plan
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{GenerationBackend, GenerationError};
use crate::export::Exporter;
use crate::memory::{ArtifactKey, FullRunArtifacts, Memory, MemoryStore, StorageError};
use crate::prompts::template_for;
use crate::retriever::{retrieve_or_empty, ContextRetriever, WebContext};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Summary,
    Plan,
    Evaluation,
}

impl Stage {
    /// Execution order.
    pub const ALL: [Stage; 3] = [Stage::Summary, Stage::Plan, Stage::Evaluation];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Summary => "summary",
            Stage::Plan => "plan",
            Stage::Evaluation => "evaluation",
        }
    }

    pub fn artifact_key(self) -> ArtifactKey {
        match self {
            Stage::Summary => ArtifactKey::Summary,
            Stage::Plan => ArtifactKey::Plan,
            Stage::Evaluation => ArtifactKey::Evaluation,
        }
    }

    /// The stage whose output feeds this one. `None` for the task-fed stage.
    pub fn upstream(self) -> Option<Stage> {
        match self {
            Stage::Summary => None,
            Stage::Plan => Some(Stage::Summary),
            Stage::Evaluation => Some(Stage::Plan),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summary" => Ok(Stage::Summary),
            "plan" => Ok(Stage::Plan),
            "evaluation" => Ok(Stage::Evaluation),
            other => Err(format!(
                "unknown stage '{other}' (expected summary, plan or evaluation)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    FullRun,
    SingleStage(Stage),
}

impl RunMode {
    pub fn runs(self, stage: Stage) -> bool {
        match self {
            RunMode::FullRun => true,
            RunMode::SingleStage(only) => only == stage,
        }
    }

    pub fn is_full_run(self) -> bool {
        matches!(self, RunMode::FullRun)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::FullRun => f.write_str("full_run"),
            RunMode::SingleStage(stage) => write!(f, "single_stage:{stage}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub task: String,
    pub mode: RunMode,
    #[serde(default)]
    pub export: bool,
}

impl RunRequest {
    pub fn full_run(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            mode: RunMode::FullRun,
            export: false,
        }
    }

    pub fn single_stage(task: impl Into<String>, stage: Stage) -> Self {
        Self {
            task: task.into(),
            mode: RunMode::SingleStage(stage),
            export: false,
        }
    }

    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }
}

/// When a request fetches web context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalPolicy {
    /// Whenever any stage runs.
    #[default]
    AnyStage,
    /// Like `AnyStage`, except a lone Evaluation stage runs without context.
    SkipEvaluationOnly,
    Disabled,
}

impl RetrievalPolicy {
    pub fn should_retrieve(self, mode: RunMode) -> bool {
        match self {
            RetrievalPolicy::AnyStage => true,
            RetrievalPolicy::SkipEvaluationOnly => mode != RunMode::SingleStage(Stage::Evaluation),
            RetrievalPolicy::Disabled => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Documents per retrieval (default: 3).
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
    #[serde(default)]
    pub retrieval_policy: RetrievalPolicy,
}

fn default_retrieval_k() -> usize {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retrieval_k: default_retrieval_k(),
            retrieval_policy: RetrievalPolicy::default(),
        }
    }
}

/// One backend per stage.
#[derive(Clone)]
pub struct StageBackends {
    pub summary: Arc<dyn GenerationBackend>,
    pub plan: Arc<dyn GenerationBackend>,
    pub evaluation: Arc<dyn GenerationBackend>,
}

impl StageBackends {
    pub fn for_stage(&self, stage: Stage) -> &Arc<dyn GenerationBackend> {
        match stage {
            Stage::Summary => &self.summary,
            Stage::Plan => &self.plan,
            Stage::Evaluation => &self.evaluation,
        }
    }
}

/// Artifacts produced by the current request. Never persisted directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingContext {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<String>,
}

impl WorkingContext {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn get(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Summary => self.summary.as_deref(),
            Stage::Plan => self.plan.as_deref(),
            Stage::Evaluation => self.evaluation.as_deref(),
        }
    }

    pub fn record(&mut self, stage: Stage, text: impl Into<String>) {
        let slot = match stage {
            Stage::Summary => &mut self.summary,
            Stage::Plan => &mut self.plan,
            Stage::Evaluation => &mut self.evaluation,
        };
        *slot = Some(text.into());
    }

    /// Stages computed this request, in execution order.
    pub fn computed(&self) -> impl Iterator<Item = (Stage, &str)> {
        Stage::ALL
            .into_iter()
            .filter_map(move |stage| self.get(stage).map(|text| (stage, text)))
    }

    /// The five-key commit set; `None` unless every stage was computed.
    pub fn full_run_artifacts(&self, web_context: &WebContext) -> Option<FullRunArtifacts> {
        Some(FullRunArtifacts {
            task: self.task.clone(),
            web_context: web_context.as_str().to_string(),
            summary: self.summary.clone()?,
            plan: self.plan.clone()?,
            evaluation: self.evaluation.clone()?,
        })
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrievalStatus {
    Skipped,
    Retrieved { chars: usize },
    Degraded { reason: String },
}

/// Where a stage's upstream input came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Task,
    /// Output of the upstream stage in this request.
    Fresh,
    /// Upstream value recalled from memory.
    Recalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed { reason: String },
    NotRequested,
    /// Requested, but an earlier stage failed.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_source: Option<InputSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(flatten)]
    pub status: StageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitStatus {
    /// Single-stage requests never commit.
    NotApplicable,
    /// A stage failed, so nothing was committed.
    Skipped,
    Committed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExportStatus {
    NotRequested,
    /// A stage failed, so nothing was exported.
    Skipped,
    Written { path: PathBuf },
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage {stage} failed: {source}")]
    Generation {
        stage: Stage,
        #[source]
        source: GenerationError,
    },
    #[error("memory commit failed: {0}")]
    Commit(#[source] StorageError),
    #[error("export failed: {0}")]
    Export(#[source] StorageError),
}

/// Everything the caller needs to know about one request.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub mode: RunMode,
    /// Set when memory could not be loaded and the run used an empty one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_warning: Option<String>,
    pub retrieval: RetrievalStatus,
    pub web_context: WebContext,
    pub stages: Vec<StageReport>,
    pub working: WorkingContext,
    pub commit: CommitStatus,
    pub export: ExportStatus,
    #[serde(skip)]
    errors: Vec<PipelineError>,
}

impl RunReport {
    /// First failure of the request, in the order it happened.
    pub fn outcome(&self) -> Result<(), &PipelineError> {
        match self.errors.first() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn errors(&self) -> &[PipelineError] {
        &self.errors
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        self.errors.iter().find_map(|e| match e {
            PipelineError::Generation { stage, .. } => Some(*stage),
            _ => None,
        })
    }

    pub fn memory_updated(&self) -> bool {
        self.commit == CommitStatus::Committed
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    backends: StageBackends,
    retriever: Arc<dyn ContextRetriever>,
    store: Arc<dyn MemoryStore>,
    exporter: Arc<dyn Exporter>,
    config: PipelineConfig,
    memory: Memory,
    memory_warning: Option<String>,
}

impl Orchestrator {
    /// Build the orchestrator and load memory once. An unreadable memory file
    /// degrades to an empty memory; the reason is kept and surfaced on every
    /// report until the next successful commit.
    pub fn new(
        backends: StageBackends,
        retriever: Arc<dyn ContextRetriever>,
        store: Arc<dyn MemoryStore>,
        exporter: Arc<dyn Exporter>,
        config: PipelineConfig,
    ) -> Self {
        let (memory, memory_warning) = match store.load() {
            Ok(memory) => (memory, None),
            Err(err) => {
                tracing::warn!(error = %err, "memory unavailable, starting empty");
                (Memory::new(), Some(err.to_string()))
            }
        };
        Self {
            backends,
            retriever,
            store,
            exporter,
            config,
            memory,
            memory_warning,
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Upstream input for `stage`: the task, this request's upstream output,
    /// or the upstream value recalled from memory.
    fn resolve_input(&self, stage: Stage, working: &WorkingContext) -> (String, InputSource) {
        match stage.upstream() {
            None => (working.task.clone(), InputSource::Task),
            Some(upstream) => match working.get(upstream) {
                Some(fresh) => (fresh.to_string(), InputSource::Fresh),
                None => (
                    self.memory.get(upstream.artifact_key()).to_string(),
                    InputSource::Recalled,
                ),
            },
        }
    }

    pub async fn run(&mut self, request: RunRequest) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mode = request.mode;
        tracing::info!(%run_id, %mode, export = request.export, "run started");

        // Every stage sees memory as it was when the request arrived.
        let memory_json = self.memory.to_prompt_json();

        let (web_context, retrieval) = if self.config.retrieval_policy.should_retrieve(mode) {
            let (ctx, err) =
                retrieve_or_empty(self.retriever.as_ref(), &request.task, self.config.retrieval_k)
                    .await;
            let status = match err {
                Some(err) => RetrievalStatus::Degraded {
                    reason: err.to_string(),
                },
                None => RetrievalStatus::Retrieved {
                    chars: ctx.as_str().chars().count(),
                },
            };
            (ctx, status)
        } else {
            (WebContext::empty(), RetrievalStatus::Skipped)
        };

        let mut working = WorkingContext::new(&request.task);
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut errors = Vec::new();

        for stage in Stage::ALL {
            let backend = self.backends.for_stage(stage);
            let mut stage_report = StageReport {
                stage,
                model: backend.model_id().to_string(),
                input_source: None,
                template: None,
                latency_ms: None,
                status: StageStatus::NotRequested,
            };

            if !mode.runs(stage) {
                stages.push(stage_report);
                continue;
            }
            if !errors.is_empty() {
                stage_report.status = StageStatus::NotAttempted;
                stages.push(stage_report);
                continue;
            }

            let (input, source) = self.resolve_input(stage, &working);
            let prompt = template_for(stage).render(&input, &memory_json, web_context.as_str());
            stage_report.input_source = Some(source);
            stage_report.template = Some(prompt.template_slug);

            let started = Instant::now();
            let result = backend.generate(&prompt.text, run_id).await;
            stage_report.latency_ms =
                Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

            match result {
                Ok(text) => {
                    tracing::info!(
                        %run_id,
                        %stage,
                        model = backend.model_id(),
                        input = ?source,
                        chars = text.chars().count(),
                        "stage completed"
                    );
                    working.record(stage, text);
                    stage_report.status = StageStatus::Completed;
                }
                Err(err) => {
                    tracing::warn!(%run_id, %stage, error = %err, "stage failed, aborting run");
                    stage_report.status = StageStatus::Failed {
                        reason: err.to_string(),
                    };
                    errors.push(PipelineError::Generation { stage, source: err });
                }
            }
            stages.push(stage_report);
        }

        let aborted = !errors.is_empty();

        let commit = if !mode.is_full_run() {
            CommitStatus::NotApplicable
        } else if aborted {
            CommitStatus::Skipped
        } else {
            match working.full_run_artifacts(&web_context) {
                Some(artifacts) => {
                    let next = self.memory.with_full_run(&artifacts);
                    match self.store.commit(&next) {
                        Ok(()) => {
                            self.memory = next;
                            self.memory_warning = None;
                            CommitStatus::Committed
                        }
                        Err(err) => {
                            tracing::warn!(%run_id, error = %err, "memory commit failed, previous memory kept");
                            let status = CommitStatus::Failed {
                                reason: err.to_string(),
                            };
                            errors.push(PipelineError::Commit(err));
                            status
                        }
                    }
                }
                // Unreachable in practice: a full run without failures computes every stage.
                None => CommitStatus::Skipped,
            }
        };

        let export = if !request.export {
            ExportStatus::NotRequested
        } else if aborted {
            ExportStatus::Skipped
        } else {
            match self.exporter.export(&working) {
                Ok(path) => {
                    tracing::info!(%run_id, path = %path.display(), "run exported");
                    ExportStatus::Written { path }
                }
                Err(err) => {
                    tracing::warn!(%run_id, error = %err, "export failed");
                    let status = ExportStatus::Failed {
                        reason: err.to_string(),
                    };
                    errors.push(PipelineError::Export(err));
                    status
                }
            }
        };

        tracing::info!(%run_id, failures = errors.len(), ?commit, "run finished");

        RunReport {
            run_id,
            started_at,
            mode,
            memory_warning: self.memory_warning.clone(),
            retrieval,
            web_context,
            stages,
            working,
            commit,
            export,
            errors,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_selects_stages() {
        assert!(Stage::ALL.iter().all(|s| RunMode::FullRun.runs(*s)));
        let only_plan = RunMode::SingleStage(Stage::Plan);
        assert!(!only_plan.runs(Stage::Summary));
        assert!(only_plan.runs(Stage::Plan));
        assert!(!only_plan.runs(Stage::Evaluation));
    }

    #[test]
    fn retrieval_policy_matrix() {
        let eval_only = RunMode::SingleStage(Stage::Evaluation);
        assert!(RetrievalPolicy::AnyStage.should_retrieve(eval_only));
        assert!(!RetrievalPolicy::SkipEvaluationOnly.should_retrieve(eval_only));
        assert!(RetrievalPolicy::SkipEvaluationOnly.should_retrieve(RunMode::FullRun));
        assert!(!RetrievalPolicy::Disabled.should_retrieve(RunMode::FullRun));
    }

    #[test]
    fn stage_parses_case_insensitively() {
        assert_eq!("Plan".parse::<Stage>().unwrap(), Stage::Plan);
        assert!("review".parse::<Stage>().is_err());
    }

    #[test]
    fn working_context_yields_artifacts_only_when_complete() {
        let mut working = WorkingContext::new("Build X");
        working.record(Stage::Summary, "S");
        working.record(Stage::Plan, "P");
        assert!(working.full_run_artifacts(&WebContext::empty()).is_none());

        working.record(Stage::Evaluation, "E");
        let artifacts = working
            .full_run_artifacts(&WebContext::new("ctx"))
            .unwrap();
        assert_eq!(artifacts.web_context, "ctx");
        assert_eq!(
            working.computed().map(|(s, _)| s).collect::<Vec<_>>(),
            Stage::ALL.to_vec()
        );
    }

    #[test]
    fn report_serializes_statuses_as_tagged_objects() {
        let report = StageReport {
            stage: Stage::Plan,
            model: "llama3".into(),
            input_source: Some(InputSource::Recalled),
            template: Some("plan_v1"),
            latency_ms: Some(3),
            status: StageStatus::Completed,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["stage"], "plan");
        assert_eq!(value["input_source"], "recalled");
        assert_eq!(value["status"], "completed");
    }
}
