//! infra-core - build matrix, image recipes and tag resolution
//!
//! The pieces of the toolchain image pipeline that need no container engine:
//! - [`matrix`]: the static list of builds
//! - [`recipe`]: package operations per toolchain, rendered to a Containerfile
//! - [`tags`]: trigger context and published tag resolution
//! - [`config`]: registry naming and credentials

pub mod config;
pub mod error;
pub mod fakes;
pub mod matrix;
pub mod recipe;
pub mod spec;
pub mod tags;
pub mod telemetry;

pub use config::{Credential, PublishConfig};
pub use error::{InfraError, Result};
pub use matrix::{EntryFilter, Matrix, MatrixEntry};
pub use recipe::{
    toolchain_for, InstallMode, InstallToolchain, PackageBackend, Recipe, RecipeOptions,
    RecipeStep, ScriptBackend,
};
pub use spec::{BuildSpec, CompilerKind};
pub use tags::{ResolvedTagSet, TagResolver, TriggerContext, TriggerEvent};
pub use telemetry::init_tracing;
