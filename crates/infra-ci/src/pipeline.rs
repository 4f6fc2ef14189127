//! Parallel matrix execution and run reporting.
//!
//! Each build spec runs as its own task: resolve tags, render the recipe,
//! build the image, publish it. Tasks share nothing but the engine, and a
//! failing entry never affects its siblings.

use crate::engine::{BuildRequest, ContainerEngine};
use crate::publisher::Publisher;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use infra_core::{
    BuildSpec, PublishConfig, Recipe, RecipeOptions, Result, TagResolver,
    TriggerContext,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_LOCAL_PREFIX: &str = "localhost/infra-containers";

/// Stage an entry reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStage {
    Resolve,
    Recipe,
    Build,
    Publish,
    Done,
}

/// Outcome of one matrix entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryOutcome {
    /// The build spec this entry ran.
    pub spec: BuildSpec,

    /// Local image name produced by the build.
    pub local_image: String,

    /// Last stage reached (`Done` on success).
    pub stage: EntryStage,

    /// References the image is published under.
    pub references: Vec<String>,

    /// References actually pushed.
    pub pushed: Vec<String>,

    /// Error message when the entry failed.
    pub error: Option<String>,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl EntryOutcome {
    /// Whether this entry built (and, if requested, published) cleanly.
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a complete matrix run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixReport {
    /// Unique identifier of this run.
    pub run_id: String,

    pub started_at: DateTime<Utc>,

    /// Digest of the matrix the run was expanded from.
    pub matrix_digest: String,

    pub trigger: TriggerContext,

    /// Whether every entry passed.
    pub success: bool,

    /// Per-entry outcomes, in matrix order.
    pub entries: Vec<EntryOutcome>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl MatrixReport {
    /// Number of entries that passed.
    pub fn passed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.passed()).count()
    }

    /// Number of entries that failed.
    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.passed()).count()
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Tuning for a matrix run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Maximum entries building at once.
    pub jobs: usize,

    /// Publish built images; `false` stops after the build.
    pub push: bool,

    /// Prefix of local image names.
    pub local_prefix: String,

    /// Directory receiving one build log per entry.
    pub log_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            push: true,
            local_prefix: DEFAULT_LOCAL_PREFIX.to_string(),
            log_dir: None,
        }
    }
}

struct EntryRunner {
    engine: Arc<dyn ContainerEngine>,
    resolver: TagResolver,
    publisher: Publisher,
    recipe_options: RecipeOptions,
    options: PipelineOptions,
}

impl EntryRunner {
    fn local_image(&self, spec: &BuildSpec) -> String {
        format!(
            "{}/{}:{}",
            self.options.local_prefix, spec.compiler_kind, spec.compiler_version
        )
    }

    async fn run(&self, spec: BuildSpec, trigger: &TriggerContext) -> EntryOutcome {
        let start = Instant::now();
        let mut outcome = EntryOutcome {
            local_image: self.local_image(&spec),
            spec,
            stage: EntryStage::Resolve,
            references: Vec::new(),
            pushed: Vec::new(),
            error: None,
            duration_ms: 0,
        };

        if let Err(e) = self.advance(&mut outcome, trigger).await {
            error!(entry = %outcome.spec.label(), stage = ?outcome.stage, error = %e, "Matrix entry failed");
            outcome.error = Some(e.to_string());
        } else {
            outcome.stage = EntryStage::Done;
            info!(entry = %outcome.spec.label(), "Matrix entry completed");
        }

        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome
    }

    async fn advance(&self, outcome: &mut EntryOutcome, trigger: &TriggerContext) -> Result<()> {
        let tags = self.resolver.resolve(&outcome.spec, trigger)?;
        outcome.references = tags.references();

        outcome.stage = EntryStage::Recipe;
        let recipe = Recipe::for_spec(&outcome.spec, &self.recipe_options);
        let containerfile = recipe.containerfile()?;
        let context = tempfile::tempdir()?;
        let containerfile_path = context.path().join("Containerfile");
        tokio::fs::write(&containerfile_path, containerfile).await?;

        outcome.stage = EntryStage::Build;
        let log_file = self
            .options
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("build-{}.log", outcome.spec.label())));
        let request = BuildRequest::new(
            context.path().to_path_buf(),
            containerfile_path,
            outcome.local_image.clone(),
        )
        .with_log_file(log_file)
        .with_description(format!("Building {} toolchain image", outcome.spec.label()));
        self.engine.build(&request).await?;

        if !self.options.push {
            info!(entry = %outcome.spec.label(), references = ?outcome.references, "Skipping publish");
            return Ok(());
        }

        outcome.stage = EntryStage::Publish;
        self.publisher
            .publish_into(&outcome.local_image, &tags, &mut outcome.pushed)
            .await
    }
}

/// Runs matrix entries concurrently on a bounded worker pool.
pub struct MatrixPipeline {
    runner: Arc<EntryRunner>,
}

impl MatrixPipeline {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        publish: PublishConfig,
        recipe_options: RecipeOptions,
        options: PipelineOptions,
    ) -> Self {
        let publisher = Publisher::new(engine.clone(), publish.credential.clone());
        Self {
            runner: Arc::new(EntryRunner {
                engine,
                resolver: TagResolver::new(publish),
                publisher,
                recipe_options,
                options,
            }),
        }
    }

    /// Run a single entry in the current task.
    pub async fn run_entry(&self, spec: BuildSpec, trigger: &TriggerContext) -> EntryOutcome {
        self.runner.run(spec, trigger).await
    }

    /// Run every spec and collect a report. Entries start in order but
    /// finish in any order; the report keeps matrix order.
    pub async fn run<I>(&self, specs: I, trigger: &TriggerContext, matrix_digest: &str) -> MatrixReport
    where
        I: IntoIterator<Item = BuildSpec>,
    {
        let start = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let jobs = self.runner.options.jobs.max(1);
        let permits = Arc::new(Semaphore::new(jobs));

        let specs: Vec<BuildSpec> = specs.into_iter().collect();
        info!(run_id = %run_id, entries = specs.len(), jobs, event = %trigger.event, "Starting matrix run");

        let handles = specs.iter().cloned().map(|spec| {
            let runner = Arc::clone(&self.runner);
            let permits = Arc::clone(&permits);
            let trigger = trigger.clone();
            tokio::spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                runner.run(spec, &trigger).await
            })
        });
        let results = join_all(handles).await;

        let entries: Vec<EntryOutcome> = results
            .into_iter()
            .zip(specs)
            .map(|(result, spec)| match result {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    warn!(entry = %spec.label(), error = %join_error, "Matrix task aborted");
                    EntryOutcome {
                        local_image: self.runner.local_image(&spec),
                        spec,
                        stage: EntryStage::Resolve,
                        references: Vec::new(),
                        pushed: Vec::new(),
                        error: Some(format!("task aborted: {}", join_error)),
                        duration_ms: 0,
                    }
                }
            })
            .collect();

        let success = entries.iter().all(EntryOutcome::passed);
        let duration_ms = start.elapsed().as_millis() as u64;

        if success {
            info!(run_id = %run_id, "Matrix run completed successfully");
        } else {
            info!(run_id = %run_id, failed = entries.iter().filter(|e| !e.passed()).count(), "Matrix run failed");
        }

        MatrixReport {
            run_id,
            started_at,
            matrix_digest: matrix_digest.to_string(),
            trigger: trigger.clone(),
            success,
            entries,
            duration_ms,
        }
    }
}
