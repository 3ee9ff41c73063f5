#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crossprompt::config::AppConfig;
use crossprompt::export::{Headings, MarkdownExporter};
use crossprompt::gateway::chat_api::ChatApiAdapter;
use crossprompt::gateway::{ChatGateway, GatewayConfig, ProviderGateway, TracingUsageSink};
use crossprompt::memory::{preview, JsonFileMemoryStore, MemoryStore};
use crossprompt::pipeline::{
    CommitStatus, ExportStatus, Orchestrator, RetrievalStatus, RunReport, RunRequest, Stage,
    StageBackends, StageStatus,
};
use crossprompt::retriever::{
    ApiEmbedder, Embedder, HashingEmbedder, HttpFetcher, NoSearch, RetrieverConfig,
    SearchProvider, SearxSearch, SimilarityIndex, WebRetriever,
};
use crossprompt::telemetry::init_telemetry;
use crossprompt::GatewayBackend;

/// Characters of each memory value shown by `crossprompt memory`.
const MEMORY_PREVIEW_CHARS: usize = 500;

#[derive(Parser)]
#[command(
    name = "crossprompt",
    version,
    about = "Chained summary → plan → evaluation generation with cross-session memory"
)]
struct Cli {
    /// JSON config file (defaults apply to anything it leaves out)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all three stages, or one with --stage
    Run {
        #[arg(long, group = "input")]
        task: Option<String>,
        /// Read the task from a file
        #[arg(long, group = "input")]
        task_file: Option<PathBuf>,
        /// Run only this stage (summary, plan, evaluation); memory is left unchanged
        #[arg(long)]
        stage: Option<Stage>,
        /// Write the produced artifacts as Markdown
        #[arg(long)]
        export: bool,
        #[arg(long)]
        export_path: Option<PathBuf>,
        #[arg(long)]
        portuguese_headings: bool,
        /// Write the JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,
        /// Hold an exclusive lock on the similarity index for the whole run
        #[arg(long)]
        lock_index: bool,
    },
    /// Show the current memory
    Memory {
        /// Print values in full instead of truncated
        #[arg(long)]
        full: bool,
    },
    /// Count documents and queries in the similarity index
    IndexStats,
    /// Export similarity index documents to JSONL
    IndexExport {
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_telemetry(&cli.log_level, cli.log_json);

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            task,
            task_file,
            stage,
            export,
            export_path,
            portuguese_headings,
            report,
            lock_index,
        } => {
            let task = match (task, task_file) {
                (Some(task), None) => task,
                (None, Some(path)) => std::fs::read_to_string(&path)?,
                _ => return Err("run requires exactly one of --task or --task-file".into()),
            };
            let task = task.trim().to_string();
            if task.is_empty() {
                return Err("task is empty".into());
            }

            let index = SimilarityIndex::open(&config.retrieval.index_path)?;
            let _lock = if lock_index {
                index.lock_exclusive()?
            } else {
                None
            };

            let headings = if portuguese_headings || config.portuguese_headings {
                Headings::portuguese()
            } else {
                Headings::english()
            };
            let export_path = export_path.unwrap_or_else(|| config.export_path.clone());
            let mut orchestrator = build_orchestrator(&config, index, export_path, headings.clone())?;

            let request = match stage {
                Some(stage) => RunRequest::single_stage(task, stage),
                None => RunRequest::full_run(task),
            }
            .with_export(export);

            let run = orchestrator.run(request).await;
            print_run(&run, &headings, &config.memory_path);

            if let Some(path) = report {
                let mut file = File::create(path)?;
                serde_json::to_writer_pretty(&mut file, &run)?;
                writeln!(file)?;
            }

            run.outcome()
                .map_err(|e| -> Box<dyn std::error::Error> { e.to_string().into() })?;
        }
        Commands::Memory { full } => {
            let store = JsonFileMemoryStore::new(&config.memory_path);
            let (memory, err) = store.load_or_empty();
            if let Some(err) = err {
                eprintln!("warning: {err}");
            }
            if memory.is_empty() {
                println!("(memory is empty)");
            }
            for (key, value) in memory.entries() {
                let shown = if full {
                    value.to_string()
                } else {
                    preview(value, MEMORY_PREVIEW_CHARS)
                };
                println!("[{}]\n{}\n", key.to_uppercase(), shown);
            }
        }
        Commands::IndexStats => {
            let index = SimilarityIndex::open(&config.retrieval.index_path)?;
            let stats = index.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::IndexExport { out } => {
            let index = SimilarityIndex::open(&config.retrieval.index_path)?;
            let rows = index.export_jsonl(&out).await?;
            println!("exported {rows} documents to {}", out.display());
        }
    }

    Ok(())
}

fn build_orchestrator(
    config: &AppConfig,
    index: SimilarityIndex,
    export_path: PathBuf,
    headings: Headings,
) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    let adapter = ChatApiAdapter::with_config(
        config.endpoint.api_key.clone(),
        config.endpoint.base_url.as_str(),
        Duration::from_secs(config.endpoint.timeout_seconds),
        "openai-compatible",
    )?;
    let gateway: Arc<dyn ChatGateway> = Arc::new(ProviderGateway::with_config(
        adapter.clone(),
        Arc::new(TracingUsageSink),
        GatewayConfig {
            max_retries: config.endpoint.max_retries,
            ..GatewayConfig::default()
        },
    ));

    let backends = StageBackends {
        summary: Arc::new(GatewayBackend::new(
            gateway.clone(),
            config.stages.summary.clone(),
            "pipeline::summary",
        )),
        plan: Arc::new(GatewayBackend::new(
            gateway.clone(),
            config.stages.plan.clone(),
            "pipeline::plan",
        )),
        evaluation: Arc::new(GatewayBackend::new(
            gateway,
            config.stages.evaluation.clone(),
            "pipeline::evaluation",
        )),
    };

    let retrieval = &config.retrieval;
    let fetch_timeout = Duration::from_secs(retrieval.fetch_timeout_seconds);
    let search: Arc<dyn SearchProvider> = match retrieval.search_url.as_deref() {
        Some(url) => Arc::new(SearxSearch::new(url, fetch_timeout)?),
        None => {
            tracing::warn!("no search endpoint configured; runs will have no web context");
            Arc::new(NoSearch)
        }
    };
    let embedder: Arc<dyn Embedder> = match retrieval.embedding_model.as_deref() {
        Some(model) => Arc::new(ApiEmbedder::new(Arc::new(adapter), model)),
        None => Arc::new(HashingEmbedder::default()),
    };
    let retriever = WebRetriever::new(
        search,
        Arc::new(HttpFetcher::new(fetch_timeout, retrieval.max_document_chars)?),
        embedder,
        index,
    )
    .with_config(RetrieverConfig {
        reuse_threshold: retrieval.reuse_threshold,
        timeout: retrieval.timeout_seconds.map(Duration::from_secs),
    });

    let store: Arc<dyn MemoryStore> = Arc::new(JsonFileMemoryStore::new(&config.memory_path));
    let exporter = MarkdownExporter::new(export_path).with_headings(headings);

    Ok(Orchestrator::new(
        backends,
        Arc::new(retriever),
        store,
        Arc::new(exporter),
        config.pipeline_config(),
    ))
}

fn print_run(run: &RunReport, headings: &Headings, memory_path: &Path) {
    if let Some(warning) = &run.memory_warning {
        eprintln!("warning: {warning}");
    }
    if let RetrievalStatus::Degraded { reason } = &run.retrieval {
        eprintln!("warning: web context unavailable ({reason})");
    }

    for (stage, text) in run.working.computed() {
        println!("## {}\n{}\n", headings.for_stage(stage), text);
    }
    for stage_report in &run.stages {
        if let StageStatus::Failed { reason } = &stage_report.status {
            eprintln!(
                "error: stage {} ({}) failed: {reason}",
                stage_report.stage, stage_report.model
            );
        }
    }

    match &run.commit {
        CommitStatus::Committed => eprintln!("memory updated: {}", memory_path.display()),
        CommitStatus::NotApplicable => eprintln!("memory unchanged (single-stage run)"),
        CommitStatus::Skipped => eprintln!("memory unchanged (run incomplete)"),
        CommitStatus::Failed { reason } => eprintln!("error: memory not updated: {reason}"),
    }
    match &run.export {
        ExportStatus::Written { path } => eprintln!("exported to {}", path.display()),
        ExportStatus::Failed { reason } => eprintln!("error: export failed: {reason}"),
        ExportStatus::Skipped => eprintln!("export skipped (run incomplete)"),
        ExportStatus::NotRequested => {}
    }
}
