//! Images built from source: a custom Clang compiler image and the
//! devcontainer layered on top of it.

use crate::engine::{BuildRequest, ContainerEngine};
use infra_core::{InfraError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const CLANG_DOCKERFILE: &str = "Dockerfile.clang.ubuntu";
pub const DEVCONTAINER_DOCKERFILE: &str = "Dockerfile.devcontainer.clang";
pub const DEFAULT_LLVM_GIT_URL: &str = "https://github.com/llvm/llvm-project.git";
pub const DEFAULT_BUILD_JOBS: u32 = 4;

/// Parameters of a custom Clang build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClangBuild {
    /// Major version, used for tagging.
    pub version: u32,
    /// Branch, tag or commit; `llvmorg-<version>.1.2` when unset.
    pub git_ref: Option<String>,
    pub git_url: String,
    /// Parallel compile jobs inside the build.
    pub jobs: u32,
    pub tag_suffix: String,
}

impl ClangBuild {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            git_ref: None,
            git_url: DEFAULT_LLVM_GIT_URL.to_string(),
            jobs: DEFAULT_BUILD_JOBS,
            tag_suffix: String::new(),
        }
    }

    pub fn git_ref(&self) -> String {
        self.git_ref
            .clone()
            .unwrap_or_else(|| format!("llvmorg-{}.1.2", self.version))
    }

    pub fn image_tag(&self) -> String {
        clang_image_tag(self.version, &self.tag_suffix)
    }
}

/// `clang-ubuntu:<version><suffix>`
pub fn clang_image_tag(version: u32, tag_suffix: &str) -> String {
    format!("clang-ubuntu:{}{}", version, tag_suffix)
}

/// `devcontainer-clang:<version><suffix>`
pub fn devcontainer_image_tag(version: u32, tag_suffix: &str) -> String {
    format!("devcontainer-clang:{}{}", version, tag_suffix)
}

/// Builds source images from the Dockerfiles in `root_dir`.
pub struct SourceBuilder {
    engine: Arc<dyn ContainerEngine>,
    root_dir: PathBuf,
    verbose: bool,
}

impl SourceBuilder {
    pub fn new(engine: Arc<dyn ContainerEngine>, root_dir: PathBuf) -> Self {
        Self {
            engine,
            root_dir,
            verbose: false,
        }
    }

    /// Stream build output to the log instead of a log file.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Build the Clang compiler image. Returns its tag.
    pub async fn build_clang(&self, build: &ClangBuild) -> Result<String> {
        let tag = build.image_tag();
        let log_file = if self.verbose {
            None
        } else {
            Some(self.root_dir.join(format!("build-clang-{}.log", build.version)))
        };

        let request = BuildRequest::new(
            self.root_dir.clone(),
            self.root_dir.join(CLANG_DOCKERFILE),
            tag.clone(),
        )
        .with_build_arg("LLVM_GIT_REF", build.git_ref())
        .with_build_arg("LLVM_GIT_URL", build.git_url.clone())
        .with_build_arg("NUM_JOBS", build.jobs.to_string())
        .with_log_file(log_file)
        .with_description(format!("Building Clang {} from {}", build.version, build.git_ref()));

        self.engine.build(&request).await?;
        Ok(tag)
    }

    /// Build the devcontainer on top of an existing Clang image.
    pub async fn build_devcontainer(&self, clang_version: u32, tag_suffix: &str) -> Result<String> {
        let base = clang_image_tag(clang_version, tag_suffix);
        let tag = devcontainer_image_tag(clang_version, tag_suffix);

        if !self.engine.image_exists(&base).await? {
            return Err(InfraError::config(format!(
                "Base image {} not found. Build it first with: infra-containers clang --version {}",
                base, clang_version
            )));
        }

        let request = BuildRequest::new(
            self.root_dir.clone(),
            self.root_dir.join(DEVCONTAINER_DOCKERFILE),
            tag.clone(),
        )
        .with_build_arg("CLANG_BASE_IMAGE", base)
        .with_description(format!("Building devcontainer with Clang {}", clang_version));

        self.engine.build(&request).await?;
        Ok(tag)
    }

    /// Clang image, then devcontainer; stops at the first failure.
    pub async fn build_all(&self, build: &ClangBuild) -> Result<Vec<String>> {
        info!(version = build.version, "Building Clang and devcontainer");
        let clang = self.build_clang(build).await?;
        let devcontainer = self
            .build_devcontainer(build.version, &build.tag_suffix)
            .await?;
        info!(version = build.version, "Successfully built all containers");
        Ok(vec![clang, devcontainer])
    }
}
