//! infra-ci - building and publishing toolchain images
//!
//! Provides the pipeline side of infra-containers:
//! - Drives `docker`/`podman` through the [`ContainerEngine`] seam
//! - Runs the build matrix in parallel and reports per-entry outcomes
//! - Publishes images under their resolved tags
//! - Builds the custom Clang and devcontainer images from source

pub mod engine;
pub mod fakes;
pub mod pipeline;
pub mod publisher;
pub mod source_build;

// Re-export key types
pub use engine::{BuildRequest, CliEngine, ContainerEngine, DryRunEngine};
pub use pipeline::{EntryOutcome, EntryStage, MatrixPipeline, MatrixReport, PipelineOptions};
pub use publisher::Publisher;
pub use source_build::{ClangBuild, SourceBuilder};
