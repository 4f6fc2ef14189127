//! infra-containers - toolchain container image builder
//!
//! Builds the pinned-toolchain images described by the build matrix and
//! publishes them to a container registry.
//!
//! ## Commands
//!
//! - `matrix`: list matrix entries (or emit a GitHub Actions matrix)
//! - `tags`: show the references an image would be published under
//! - `recipe`: print the Containerfile of one toolchain image
//! - `run`: build and publish the matrix in parallel
//! - `clang`, `devcontainer`, `all`: build the custom Clang images from source

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use infra_ci::{
    CliEngine, ClangBuild, ContainerEngine, DryRunEngine, MatrixPipeline, PipelineOptions,
    SourceBuilder,
};
use infra_core::{
    BuildSpec, CompilerKind, EntryFilter, Matrix, PublishConfig, Recipe, TagResolver,
    TriggerContext, TriggerEvent,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "infra-containers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and publish pinned-toolchain container images", long_about = None)]
struct Cli {
    /// Enable verbose output (streams build logs)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Print what would be built and pushed without running the engine
    #[arg(long, global = true)]
    dry_run: bool,

    /// Container engine executable (docker or podman)
    #[arg(long, global = true, env = "INFRA_CONTAINER_ENGINE", default_value = "docker")]
    engine: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the build matrix
    Matrix {
        /// Matrix file (TOML); the built-in matrix when omitted
        #[arg(short, long)]
        matrix: Option<PathBuf>,

        /// Only entries that run on this event
        #[arg(long)]
        event: Option<TriggerEvent>,

        /// Emit a GitHub Actions `strategy.matrix` JSON document
        #[arg(long)]
        github: bool,
    },

    /// Show the references an image would be published under
    Tags {
        /// Compiler kind (gcc, clang, clang-p2996)
        #[arg(long)]
        kind: CompilerKind,

        /// Compiler version
        #[arg(long)]
        version: String,

        /// Production tag (repeatable)
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,

        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        publish: PublishArgs,
    },

    /// Print the Containerfile for one toolchain image
    Recipe {
        /// Compiler kind (gcc, clang, clang-p2996)
        #[arg(long)]
        kind: CompilerKind,

        /// Compiler version
        #[arg(long)]
        version: String,

        /// Matrix file supplying recipe options
        #[arg(short, long)]
        matrix: Option<PathBuf>,

        /// Override the base image
        #[arg(long)]
        base_image: Option<String>,
    },

    /// Build and publish the matrix
    Run {
        /// Matrix file (TOML); the built-in matrix when omitted
        #[arg(short, long)]
        matrix: Option<PathBuf>,

        /// Number of images built at once
        #[arg(short, long, default_value = "4")]
        jobs: usize,

        /// Restrict to KIND or KIND:VERSION (repeatable)
        #[arg(long)]
        only: Vec<EntryFilter>,

        /// Build without publishing
        #[arg(long)]
        no_push: bool,

        /// Write a JSON run report to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Directory for per-entry build logs
        #[arg(long)]
        log_dir: Option<PathBuf>,

        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        publish: PublishArgs,
    },

    /// Build a custom Clang compiler image from source
    Clang {
        /// Clang major version (e.g. 19, 20, 21)
        #[arg(long)]
        version: u32,

        /// Git branch/tag/commit to build from (default: llvmorg-{version}.1.2)
        #[arg(long)]
        git_ref: Option<String>,

        /// Git repository URL for LLVM
        #[arg(long, default_value = infra_ci::source_build::DEFAULT_LLVM_GIT_URL)]
        git_url: String,

        /// Number of parallel build jobs
        #[arg(long, default_value = "4")]
        jobs: u32,

        /// Additional suffix for the image tag
        #[arg(long, default_value = "")]
        tag_suffix: String,

        /// Directory holding the Dockerfiles
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },

    /// Build the devcontainer image on top of a custom Clang image
    Devcontainer {
        /// Clang version to use (must be built first)
        #[arg(long)]
        clang_version: u32,

        /// Additional suffix for the image tag
        #[arg(long, default_value = "")]
        tag_suffix: String,

        /// Directory holding the Dockerfiles
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },

    /// Build the custom Clang image and the devcontainer
    All {
        /// Clang version to build
        #[arg(long)]
        clang_version: u32,

        /// Git branch/tag/commit to build from (default: llvmorg-{version}.1.2)
        #[arg(long)]
        git_ref: Option<String>,

        /// Number of parallel build jobs
        #[arg(long, default_value = "4")]
        jobs: u32,

        /// Directory holding the Dockerfiles
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

/// Trigger context flags; GitHub Actions variables are used when none is set.
#[derive(Args, Debug, Clone)]
struct TriggerArgs {
    /// Trigger event (push, pull_request, schedule, workflow_dispatch)
    #[arg(long)]
    event: Option<TriggerEvent>,

    /// Branch being built
    #[arg(long)]
    branch: Option<String>,

    /// Pull request number or other change id (non-main build)
    #[arg(long)]
    change_id: Option<String>,

    /// Production branch name
    #[arg(long, env = "INFRA_MAIN_BRANCH", default_value = "main")]
    main_branch: String,
}

impl TriggerArgs {
    fn context(&self) -> Result<TriggerContext> {
        if self.event.is_none() && self.branch.is_none() && self.change_id.is_none() {
            return TriggerContext::from_github_env(&self.main_branch)
                .context("Failed to read trigger context from the environment");
        }

        if let Some(change_id) = &self.change_id {
            return Ok(TriggerContext {
                event: self.event.unwrap_or(TriggerEvent::PullRequest),
                is_main_branch: false,
                change_id: Some(change_id.clone()),
            });
        }

        let event = self.event.unwrap_or(TriggerEvent::Push);
        if event == TriggerEvent::PullRequest {
            anyhow::bail!("--event pull_request needs --change-id");
        }
        let branch = self.branch.as_deref().unwrap_or(&self.main_branch);
        if event == TriggerEvent::Schedule || branch == self.main_branch {
            Ok(TriggerContext::main(event))
        } else {
            Ok(TriggerContext {
                event,
                is_main_branch: false,
                change_id: Some(branch.to_string()),
            })
        }
    }
}

/// Registry naming overrides on top of the environment.
#[derive(Args, Debug, Clone, Default)]
struct PublishArgs {
    /// Registry host
    #[arg(long)]
    registry: Option<String>,

    /// Namespace owner in the registry
    #[arg(long)]
    owner: Option<String>,

    /// Image name prefix
    #[arg(long)]
    image_base: Option<String>,
}

impl PublishArgs {
    fn config(&self) -> PublishConfig {
        let mut config = PublishConfig::from_env();
        if let Some(registry) = &self.registry {
            config = config.with_registry(registry);
        }
        if let Some(owner) = &self.owner {
            config = config.with_owner(owner);
        }
        if let Some(base) = &self.image_base {
            config.image_base = base.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    infra_core::init_tracing(cli.json, level);

    let engine: Arc<dyn ContainerEngine> = if cli.dry_run {
        Arc::new(DryRunEngine)
    } else {
        Arc::new(CliEngine::new(cli.engine.clone()))
    };

    tokio::select! {
        result = dispatch(cli, engine) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nBuild interrupted by user");
            std::process::exit(130);
        }
    }
}

async fn dispatch(cli: Cli, engine: Arc<dyn ContainerEngine>) -> Result<()> {
    match cli.command {
        Commands::Matrix {
            matrix,
            event,
            github,
        } => cmd_matrix(matrix.as_deref(), event, github),
        Commands::Tags {
            kind,
            version,
            tags,
            trigger,
            publish,
        } => cmd_tags(kind, &version, &tags, &trigger, &publish),
        Commands::Recipe {
            kind,
            version,
            matrix,
            base_image,
        } => cmd_recipe(kind, &version, matrix.as_deref(), base_image),
        Commands::Run {
            matrix,
            jobs,
            only,
            no_push,
            report,
            log_dir,
            trigger,
            publish,
        } => {
            let options = PipelineOptions {
                jobs,
                push: !no_push,
                log_dir,
                ..PipelineOptions::default()
            };
            cmd_run(
                engine,
                matrix.as_deref(),
                &only,
                options,
                report.as_deref(),
                &trigger,
                &publish,
            )
            .await
        }
        Commands::Clang {
            version,
            git_ref,
            git_url,
            jobs,
            tag_suffix,
            root,
        } => {
            let build = ClangBuild {
                version,
                git_ref,
                git_url,
                jobs,
                tag_suffix,
            };
            let tag = SourceBuilder::new(engine, root)
                .verbose(cli.verbose)
                .build_clang(&build)
                .await
                .context("Clang build failed")?;
            println!("✓ Successfully built {}", tag);
            Ok(())
        }
        Commands::Devcontainer {
            clang_version,
            tag_suffix,
            root,
        } => {
            let tag = SourceBuilder::new(engine, root)
                .verbose(cli.verbose)
                .build_devcontainer(clang_version, &tag_suffix)
                .await
                .context("Devcontainer build failed")?;
            println!("✓ Successfully built {}", tag);
            Ok(())
        }
        Commands::All {
            clang_version,
            git_ref,
            jobs,
            root,
        } => {
            let build = ClangBuild {
                git_ref,
                jobs,
                ..ClangBuild::new(clang_version)
            };
            let tags = SourceBuilder::new(engine, root)
                .verbose(cli.verbose)
                .build_all(&build)
                .await
                .context("Build failed")?;
            println!(
                "✓ Successfully built all containers for Clang {}: {}",
                clang_version,
                tags.join(", ")
            );
            Ok(())
        }
    }
}

fn load_matrix(path: Option<&Path>) -> Result<Matrix> {
    match path {
        Some(path) => Matrix::load(path)
            .with_context(|| format!("Failed to load matrix {}", path.display())),
        None => Ok(Matrix::builtin()),
    }
}

/// GitHub Actions `strategy.matrix` document for the given specs.
fn github_matrix<'a>(specs: impl Iterator<Item = &'a BuildSpec>) -> serde_json::Value {
    let include: Vec<_> = specs
        .map(|spec| {
            json!({
                "kind": spec.compiler_kind,
                "version": spec.compiler_version,
                "tags": spec.tags.join(","),
            })
        })
        .collect();
    json!({ "include": include })
}

fn cmd_matrix(path: Option<&Path>, event: Option<TriggerEvent>, github: bool) -> Result<()> {
    let matrix = load_matrix(path)?;
    let specs: Vec<&BuildSpec> = match event {
        Some(event) => matrix.for_trigger(event).collect(),
        None => matrix.iter().collect(),
    };

    if github {
        println!("{}", github_matrix(specs.into_iter()));
        return Ok(());
    }

    println!("Matrix digest: {}", matrix.digest());
    println!();
    for entry in matrix.entries() {
        if !specs.contains(&&entry.spec) {
            continue;
        }
        let triggers = match &entry.triggers {
            Some(events) => events
                .iter()
                .map(|e| e.name())
                .collect::<Vec<_>>()
                .join(","),
            None => "all".to_string(),
        };
        println!(
            "  {:<12} {:<8} tags: {:<20} on: {}",
            entry.spec.compiler_kind,
            entry.spec.compiler_version,
            entry.spec.tags.join(","),
            triggers
        );
    }
    println!();
    println!("{} entries", specs.len());
    Ok(())
}

fn cmd_tags(
    kind: CompilerKind,
    version: &str,
    tags: &[String],
    trigger: &TriggerArgs,
    publish: &PublishArgs,
) -> Result<()> {
    let spec = BuildSpec {
        compiler_kind: kind,
        compiler_version: version.to_string(),
        tags: tags.to_vec(),
    };
    spec.validate()?;

    let context = trigger.context()?;
    let resolved = TagResolver::new(publish.config()).resolve(&spec, &context)?;
    for reference in resolved.references() {
        println!("{}", reference);
    }
    Ok(())
}

fn cmd_recipe(
    kind: CompilerKind,
    version: &str,
    matrix: Option<&Path>,
    base_image: Option<String>,
) -> Result<()> {
    let mut options = load_matrix(matrix)?.recipe_options().clone();
    if let Some(base) = base_image {
        options.base_image = base;
    }
    options.validate()?;

    let spec = BuildSpec {
        compiler_kind: kind,
        compiler_version: version.to_string(),
        tags: vec![version.to_string()],
    };
    spec.validate()?;

    print!("{}", Recipe::for_spec(&spec, &options).containerfile()?);
    Ok(())
}

async fn cmd_run(
    engine: Arc<dyn ContainerEngine>,
    matrix_path: Option<&Path>,
    only: &[EntryFilter],
    options: PipelineOptions,
    report_path: Option<&Path>,
    trigger: &TriggerArgs,
    publish: &PublishArgs,
) -> Result<()> {
    let matrix = load_matrix(matrix_path)?;
    let context = trigger.context()?;
    let specs: Vec<BuildSpec> = matrix.select(context.event, only).cloned().collect();
    if specs.is_empty() {
        anyhow::bail!("No matrix entries selected for event {}", context.event);
    }

    if let Some(dir) = &options.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }

    println!("Engine: {}", engine.name());
    println!("Trigger: {} (main: {})", context.event, context.is_main_branch);
    println!("Entries: {}", specs.len());
    println!();

    let pipeline = MatrixPipeline::new(
        engine,
        publish.config(),
        matrix.recipe_options().clone(),
        options,
    );
    let report = pipeline.run(specs, &context, &matrix.digest()).await;

    println!("Run ID: {}", report.run_id);
    println!("Status: {}", if report.success { "✓ PASSED" } else { "✗ FAILED" });
    println!("Duration: {}ms", report.duration_ms);
    println!();

    for entry in &report.entries {
        let status = if entry.passed() { "✓" } else { "✗" };
        println!("  {} {} ({}ms)", status, entry.spec.label(), entry.duration_ms);
        for reference in &entry.pushed {
            println!("      pushed {}", reference);
        }
        if let Some(error) = &entry.error {
            println!("      {:?}: {}", entry.stage, error);
        }
    }

    println!();
    println!(
        "Summary: {}/{} entries passed",
        report.passed_count(),
        report.entries.len()
    );

    if let Some(path) = report_path {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    if report.success {
        Ok(())
    } else {
        anyhow::bail!("{} matrix entries failed", report.failed_count())
    }
}
