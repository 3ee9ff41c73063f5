use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crossprompt::backend::{GenerationBackend, GenerationError};
use crossprompt::export::MarkdownExporter;
use crossprompt::memory::{ArtifactKey, JsonFileMemoryStore, MemoryStore};
use crossprompt::pipeline::{
    CommitStatus, ExportStatus, InputSource, Orchestrator, PipelineConfig, PipelineError,
    RetrievalPolicy, RetrievalStatus, RunRequest, Stage, StageBackends, StageStatus,
};
use crossprompt::retriever::{ContextRetriever, RetrievalError, WebContext};
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

// =============================================================================
// Fakes
// =============================================================================

struct FakeBackend {
    model: &'static str,
    reply: Option<&'static str>,
    prompts: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn ok(model: &'static str, reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            model,
            reply: Some(reply),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn failing(model: &'static str) -> Arc<Self> {
        Arc::new(Self {
            model,
            reply: None,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    fn model_id(&self) -> &str {
        self.model
    }

    async fn generate(&self, prompt: &str, _run_id: Uuid) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.reply {
            Some(reply) => Ok(reply.to_string()),
            None => Err(GenerationError::EmptyCompletion {
                model: self.model.to_string(),
            }),
        }
    }
}

struct FakeRetriever {
    context: Option<&'static str>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl FakeRetriever {
    fn ok(context: &'static str) -> Arc<Self> {
        Arc::new(Self {
            context: Some(context),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            context: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContextRetriever for FakeRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<WebContext, RetrievalError> {
        self.calls.lock().unwrap().push((query.to_string(), k));
        match self.context {
            Some(ctx) => Ok(WebContext::new(ctx)),
            None => Err(RetrievalError::Search("search endpoint returned HTTP 503".into())),
        }
    }
}

struct Harness {
    dir: TempDir,
    summary: Arc<FakeBackend>,
    plan: Arc<FakeBackend>,
    evaluation: Arc<FakeBackend>,
    retriever: Arc<FakeRetriever>,
    config: PipelineConfig,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempdir().unwrap(),
            summary: FakeBackend::ok("mistral", "SUMMARY OUT"),
            plan: FakeBackend::ok("llama3", "PLAN OUT"),
            evaluation: FakeBackend::ok("phi3", "EVALUATION OUT"),
            retriever: FakeRetriever::ok("CTX"),
            config: PipelineConfig::default(),
        }
    }

    fn memory_path(&self) -> PathBuf {
        self.dir.path().join("memory.json")
    }

    fn export_path(&self) -> PathBuf {
        self.dir.path().join("result.md")
    }

    fn seed_memory(&self, json: &str) {
        fs::write(self.memory_path(), json).unwrap();
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            StageBackends {
                summary: self.summary.clone(),
                plan: self.plan.clone(),
                evaluation: self.evaluation.clone(),
            },
            self.retriever.clone(),
            Arc::new(JsonFileMemoryStore::new(self.memory_path())),
            Arc::new(MarkdownExporter::new(self.export_path())),
            self.config.clone(),
        )
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

const SEEDED: &str = r#"{
    "summary": "A",
    "plan": "B",
    "evaluation": "C",
    "task": "T",
    "web_context": "W"
}"#;

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn full_run_on_empty_memory_commits_all_five_keys() {
    let h = Harness::new();
    let mut orchestrator = h.orchestrator();

    let report = orchestrator.run(RunRequest::full_run("Build X")).await;

    assert!(report.outcome().is_ok());
    assert_eq!(report.retrieval, RetrievalStatus::Retrieved { chars: 3 });
    assert_eq!(report.web_context.as_str(), "CTX");
    assert_eq!(h.retriever.calls(), vec![("Build X".to_string(), 3)]);

    let working = &report.working;
    assert_eq!(working.summary.as_deref(), Some("SUMMARY OUT"));
    assert_eq!(working.plan.as_deref(), Some("PLAN OUT"));
    assert_eq!(working.evaluation.as_deref(), Some("EVALUATION OUT"));

    let sources: Vec<_> = report.stages.iter().map(|s| s.input_source).collect();
    assert_eq!(
        sources,
        vec![
            Some(InputSource::Task),
            Some(InputSource::Fresh),
            Some(InputSource::Fresh)
        ]
    );
    assert!(h.summary.prompts()[0].contains("<task>\nBuild X\n</task>"));
    assert!(h.plan.prompts()[0].contains("<summary>\nSUMMARY OUT\n</summary>"));
    assert!(h.evaluation.prompts()[0].contains("<plan>\nPLAN OUT\n</plan>"));
    assert!(h.evaluation.prompts()[0].contains("<web_context>\nCTX\n</web_context>"));

    assert_eq!(report.commit, CommitStatus::Committed);
    assert!(report.memory_updated());
    let stored = JsonFileMemoryStore::new(h.memory_path()).load().unwrap();
    assert_eq!(stored.get(ArtifactKey::Task), "Build X");
    assert_eq!(stored.get(ArtifactKey::WebContext), "CTX");
    assert_eq!(stored.get(ArtifactKey::Summary), "SUMMARY OUT");
    assert_eq!(stored.get(ArtifactKey::Plan), "PLAN OUT");
    assert_eq!(stored.get(ArtifactKey::Evaluation), "EVALUATION OUT");
    assert_eq!(&stored, orchestrator.memory());

    assert_eq!(report.export, ExportStatus::NotRequested);
    assert!(!h.export_path().exists());
}

#[tokio::test]
async fn prompts_see_memory_as_it_was_when_the_request_arrived() {
    let h = Harness::new();
    h.seed_memory(SEEDED);
    let mut orchestrator = h.orchestrator();

    orchestrator.run(RunRequest::full_run("Build X")).await;
    // The in-run summary must not leak into the memory snapshot of later stages.
    assert!(h.plan.prompts()[0].contains(r#""summary":"A""#));
    assert!(!h.plan.prompts()[0].contains(r#""summary":"SUMMARY OUT""#));

    // The next request sees the committed run.
    orchestrator.run(RunRequest::full_run("Build Z")).await;
    assert!(h.summary.prompts()[1].contains(r#""summary":"SUMMARY OUT""#));
}

#[tokio::test]
async fn full_run_with_export_writes_every_section() {
    let h = Harness::new();
    let report = h
        .orchestrator()
        .run(RunRequest::full_run("Build X").with_export(true))
        .await;

    assert_eq!(
        report.export,
        ExportStatus::Written {
            path: h.export_path()
        }
    );
    assert_eq!(
        read(&h.export_path()),
        "# Task\nBuild X\n\n## Technical Summary\nSUMMARY OUT\n\n## Action Plan\nPLAN OUT\n\n## Critical Evaluation\nEVALUATION OUT\n\n"
    );
}

// =============================================================================
// Single stages
// =============================================================================

#[tokio::test]
async fn single_plan_recalls_summary_and_leaves_memory_unchanged() {
    let h = Harness::new();
    h.seed_memory(SEEDED);
    let before = read(&h.memory_path());

    let mut orchestrator = h.orchestrator();
    let memory_before = orchestrator.memory().clone();
    let report = orchestrator
        .run(RunRequest::single_stage("Build Y", Stage::Plan))
        .await;

    assert!(report.outcome().is_ok());
    assert!(h.plan.prompts()[0].contains("<summary>\nA\n</summary>"));
    assert!(h.summary.prompts().is_empty());
    assert!(h.evaluation.prompts().is_empty());

    let plan = report.stage(Stage::Plan).unwrap();
    assert_eq!(plan.input_source, Some(InputSource::Recalled));
    assert_eq!(plan.status, StageStatus::Completed);
    assert!(plan.latency_ms.is_some());
    assert!(report.stage(Stage::Summary).unwrap().latency_ms.is_none());
    assert_eq!(
        report.stage(Stage::Summary).unwrap().status,
        StageStatus::NotRequested
    );

    assert_eq!(report.commit, CommitStatus::NotApplicable);
    assert!(!report.memory_updated());
    assert_eq!(read(&h.memory_path()), before);
    assert_eq!(orchestrator.memory(), &memory_before);
    assert_eq!(report.working.plan.as_deref(), Some("PLAN OUT"));
    assert!(report.working.summary.is_none());
}

#[tokio::test]
async fn single_evaluation_uses_plan_from_memory() {
    let h = Harness::new();
    h.seed_memory(r#"{"summary": "S0", "plan": "P0"}"#);

    let report = h
        .orchestrator()
        .run(RunRequest::single_stage("Build X", Stage::Evaluation))
        .await;

    assert!(report.outcome().is_ok());
    assert!(h.evaluation.prompts()[0].contains("<plan>\nP0\n</plan>"));
    assert_eq!(h.retriever.calls().len(), 1);
}

#[tokio::test]
async fn single_stage_with_nothing_in_memory_gets_empty_input() {
    let h = Harness::new();
    let report = h
        .orchestrator()
        .run(RunRequest::single_stage("Build X", Stage::Evaluation))
        .await;

    assert!(report.outcome().is_ok());
    assert!(h.evaluation.prompts()[0].contains("<plan>\n\n</plan>"));
    assert!(!h.memory_path().exists());
}

#[tokio::test]
async fn single_stage_export_contains_task_and_that_stage_only() {
    let h = Harness::new();
    h.seed_memory(SEEDED);

    h.orchestrator()
        .run(RunRequest::single_stage("Build Y", Stage::Plan).with_export(true))
        .await;

    assert_eq!(
        read(&h.export_path()),
        "# Task\nBuild Y\n\n## Action Plan\nPLAN OUT\n\n"
    );
}

// =============================================================================
// Degraded and failing paths
// =============================================================================

#[tokio::test]
async fn failing_retriever_still_runs_every_stage_with_empty_context() {
    let mut h = Harness::new();
    h.retriever = FakeRetriever::failing();

    let report = h.orchestrator().run(RunRequest::full_run("Build X")).await;

    assert!(report.outcome().is_ok());
    assert!(matches!(report.retrieval, RetrievalStatus::Degraded { .. }));
    assert!(report.web_context.is_empty());
    for prompts in [h.summary.prompts(), h.plan.prompts(), h.evaluation.prompts()] {
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("<web_context>\n\n</web_context>"));
    }
    assert_eq!(report.commit, CommitStatus::Committed);
    let stored = JsonFileMemoryStore::new(h.memory_path()).load().unwrap();
    assert_eq!(stored.get(ArtifactKey::WebContext), "");
}

#[tokio::test]
async fn generation_failure_aborts_later_stages_commit_and_export() {
    let mut h = Harness::new();
    h.plan = FakeBackend::failing("llama3");
    h.seed_memory(SEEDED);
    let before = read(&h.memory_path());

    let report = h
        .orchestrator()
        .run(RunRequest::full_run("Build X").with_export(true))
        .await;

    match report.outcome() {
        Err(PipelineError::Generation { stage, .. }) => assert_eq!(*stage, Stage::Plan),
        other => panic!("expected plan generation failure, got {other:?}"),
    }
    assert_eq!(report.failed_stage(), Some(Stage::Plan));
    assert_eq!(
        report.stage(Stage::Summary).unwrap().status,
        StageStatus::Completed
    );
    assert!(matches!(
        report.stage(Stage::Plan).unwrap().status,
        StageStatus::Failed { .. }
    ));
    assert_eq!(
        report.stage(Stage::Evaluation).unwrap().status,
        StageStatus::NotAttempted
    );
    assert!(h.evaluation.prompts().is_empty());

    assert_eq!(report.commit, CommitStatus::Skipped);
    assert_eq!(report.export, ExportStatus::Skipped);
    assert_eq!(read(&h.memory_path()), before);
    assert!(!h.export_path().exists());
    assert_eq!(report.working.summary.as_deref(), Some("SUMMARY OUT"));
}

#[tokio::test]
async fn failing_commit_keeps_prior_memory_and_still_exports() {
    let h = Harness::new();
    h.seed_memory(SEEDED);
    let before = read(&h.memory_path());
    fs::create_dir(h.dir.path().join("memory.json.tmp")).unwrap();

    let mut orchestrator = h.orchestrator();
    let memory_before = orchestrator.memory().clone();
    let report = orchestrator
        .run(RunRequest::full_run("Build X").with_export(true))
        .await;

    assert!(matches!(report.outcome(), Err(PipelineError::Commit(_))));
    assert!(matches!(report.commit, CommitStatus::Failed { .. }));
    assert_eq!(read(&h.memory_path()), before);
    assert_eq!(orchestrator.memory(), &memory_before);

    assert!(matches!(report.export, ExportStatus::Written { .. }));
    assert!(read(&h.export_path()).contains("## Critical Evaluation\nEVALUATION OUT"));
    assert_eq!(report.working.evaluation.as_deref(), Some("EVALUATION OUT"));
}

#[tokio::test]
async fn malformed_memory_degrades_to_empty_with_warning() {
    let h = Harness::new();
    h.seed_memory("{ this is not json");

    let mut orchestrator = h.orchestrator();
    assert!(orchestrator.memory().is_empty());

    let report = orchestrator
        .run(RunRequest::single_stage("Build X", Stage::Plan))
        .await;
    assert!(report.outcome().is_ok());
    assert!(report.memory_warning.is_some());
    assert!(h.plan.prompts()[0].contains("<memory>\n{}\n</memory>"));

    let report = orchestrator.run(RunRequest::full_run("Build X")).await;
    assert_eq!(report.commit, CommitStatus::Committed);
    assert!(report.memory_warning.is_none());
    assert!(JsonFileMemoryStore::new(h.memory_path()).load().is_ok());
}

// =============================================================================
// Retrieval policy
// =============================================================================

#[tokio::test]
async fn skip_evaluation_only_policy_skips_retrieval_for_lone_evaluation() {
    let mut h = Harness::new();
    h.config.retrieval_policy = RetrievalPolicy::SkipEvaluationOnly;
    let mut orchestrator = h.orchestrator();

    let report = orchestrator
        .run(RunRequest::single_stage("Build X", Stage::Evaluation))
        .await;
    assert_eq!(report.retrieval, RetrievalStatus::Skipped);
    assert!(h.retriever.calls().is_empty());

    orchestrator
        .run(RunRequest::single_stage("Build X", Stage::Plan))
        .await;
    assert_eq!(h.retriever.calls().len(), 1);
}

#[tokio::test]
async fn retrieval_k_is_configurable() {
    let mut h = Harness::new();
    h.config.retrieval_k = 5;

    h.orchestrator().run(RunRequest::full_run("Build X")).await;
    assert_eq!(h.retriever.calls(), vec![("Build X".to_string(), 5)]);
}

#[tokio::test]
async fn run_report_serializes_to_json() {
    let h = Harness::new();
    let report = h.orchestrator().run(RunRequest::full_run("Build X")).await;

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["mode"], "full_run");
    assert_eq!(value["commit"]["status"], "committed");
    assert_eq!(value["retrieval"]["status"], "retrieved");
    assert_eq!(value["stages"][1]["input_source"], "fresh");
    assert_eq!(value["working"]["plan"], "PLAN OUT");
    assert!(value.get("errors").is_none());
}
