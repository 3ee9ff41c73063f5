//! Markdown export of a request's artifacts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::memory::{write_atomic, StorageError};
use crate::pipeline::{Stage, WorkingContext};

pub const DEFAULT_EXPORT_PATH: &str = "crossprompt_result.md";

/// Writes a [`WorkingContext`] somewhere durable and says where.
pub trait Exporter: Send + Sync {
    fn export(&self, working: &WorkingContext) -> Result<PathBuf, StorageError>;
}

/// Section titles of the exported document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headings {
    pub task: String,
    pub summary: String,
    pub plan: String,
    pub evaluation: String,
}

impl Headings {
    pub fn english() -> Self {
        Self {
            task: "Task".into(),
            summary: "Technical Summary".into(),
            plan: "Action Plan".into(),
            evaluation: "Critical Evaluation".into(),
        }
    }

    pub fn portuguese() -> Self {
        Self {
            task: "Tarefa".into(),
            summary: "Resumo Técnico".into(),
            plan: "Plano de Ação".into(),
            evaluation: "Avaliação Crítica".into(),
        }
    }

    pub fn for_stage(&self, stage: Stage) -> &str {
        match stage {
            Stage::Summary => &self.summary,
            Stage::Plan => &self.plan,
            Stage::Evaluation => &self.evaluation,
        }
    }
}

impl Default for Headings {
    fn default() -> Self {
        Self::english()
    }
}

/// Render `working` as Markdown: the task under a `#` heading, then each
/// computed stage under a `##` heading. Stages not computed are left out.
pub fn render_markdown(working: &WorkingContext, headings: &Headings) -> String {
    let mut out = format!("# {}\n{}\n\n", headings.task, working.task);
    for (stage, text) in working.computed() {
        out.push_str(&format!("## {}\n{}\n\n", headings.for_stage(stage), text));
    }
    out
}

#[derive(Debug, Clone)]
pub struct MarkdownExporter {
    path: PathBuf,
    headings: Headings,
}

impl MarkdownExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            headings: Headings::default(),
        }
    }

    pub fn with_headings(mut self, headings: Headings) -> Self {
        self.headings = headings;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Exporter for MarkdownExporter {
    fn export(&self, working: &WorkingContext) -> Result<PathBuf, StorageError> {
        let doc = render_markdown(working, &self.headings);
        write_atomic(&self.path, doc.as_bytes())?;
        Ok(self.path.clone())
    }
}
