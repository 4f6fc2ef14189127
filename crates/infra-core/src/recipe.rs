//! Image recipes: the package operations that turn a base image into a
//! toolchain image.
//!
//! A [`Recipe`] is an ordered list of [`RecipeStep`]s. It is executed against
//! a [`PackageBackend`]; [`ScriptBackend`] turns the execution into shell
//! commands for a Containerfile, while the in-memory image in
//! [`crate::fakes`] applies it to a model of a fresh base image.
//!
//! Install failures abort the recipe, except autounmask installs: the first
//! attempt may fail (it writes the unmask configuration), the configuration
//! is then reconciled, and the second attempt must succeed.

use crate::error::{InfraError, Result};
use crate::spec::{BuildSpec, CompilerKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_BASE_IMAGE: &str = "docker.io/gentoo/stage3:latest";
pub const P2996_REPOSITORY_NAME: &str = "clang-p2996";
pub const P2996_REPOSITORY_URI: &str = "https://github.com/bloomberg/clang-p2996.git";

/// Options shared by every recipe in a matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecipeOptions {
    /// Image every recipe starts from.
    pub base_image: String,

    /// Name of the package repository carrying the P2996 fork.
    pub p2996_repository_name: String,

    /// Git URI of that repository.
    pub p2996_repository_uri: String,

    /// Tools installed next to every toolchain.
    pub auxiliary_tools: Vec<String>,
}

impl Default for RecipeOptions {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            p2996_repository_name: P2996_REPOSITORY_NAME.to_string(),
            p2996_repository_uri: P2996_REPOSITORY_URI.to_string(),
            auxiliary_tools: [
                "dev-build/cmake",
                "dev-build/ninja",
                "dev-vcs/git",
                "dev-debug/gdb",
                "dev-util/ccache",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RecipeOptions {
    /// Reject values that cannot be placed verbatim on a `FROM` or `RUN` line.
    pub fn validate(&self) -> Result<()> {
        check_script_word("base_image", &self.base_image)?;
        check_script_word("p2996_repository_name", &self.p2996_repository_name)?;
        check_script_word("p2996_repository_uri", &self.p2996_repository_uri)?;
        for tool in &self.auxiliary_tools {
            check_script_word("auxiliary_tools", tool)?;
        }
        Ok(())
    }
}

fn check_script_word(field: &str, value: &str) -> Result<()> {
    let unsafe_char = value.chars().find(|&c| {
        !c.is_ascii_graphic()
            || matches!(c, '\'' | '"' | '`' | '$' | '\\' | ';' | '&' | '|' | '<' | '>')
    });
    match unsafe_char {
        _ if value.is_empty() => Err(InfraError::config(format!("recipe {} is empty", field))),
        Some(c) => Err(InfraError::config(format!(
            "recipe {} '{}' contains {:?}",
            field,
            value.escape_debug(),
            c
        ))),
        None => Ok(()),
    }
}

/// How an install is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Plain install; failure is fatal.
    Normal,
    /// Install that may write unmask configuration instead of succeeding.
    AutounmaskWrite,
}

/// One package operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RecipeStep {
    /// Refresh package repositories.
    Sync,

    /// Register an additional package repository.
    AddRepository { name: String, uri: String },

    /// Install package atoms; `autounmask` enables the two-attempt protocol.
    Install { atoms: Vec<String>, autounmask: bool },

    /// Make the installed toolchain the default compiler.
    SelectDefault { kind: CompilerKind, version: String },

    /// Remove transient package-manager caches.
    CleanCaches,
}

impl RecipeStep {
    /// Short human-readable description used in errors and logs.
    pub fn describe(&self) -> String {
        match self {
            RecipeStep::Sync => "sync repositories".to_string(),
            RecipeStep::AddRepository { name, .. } => format!("add repository {}", name),
            RecipeStep::Install { atoms, .. } => format!("install {}", atoms.join(" ")),
            RecipeStep::SelectDefault { kind, version } => {
                format!("select {}-{} as default", kind, version)
            }
            RecipeStep::CleanCaches => "clean caches".to_string(),
        }
    }

    pub fn is_install(&self) -> bool {
        matches!(self, RecipeStep::Install { .. })
    }
}

/// Failure reported by a package backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

pub type BackendResult = std::result::Result<(), BackendError>;

/// Target of recipe execution.
pub trait PackageBackend {
    fn sync(&mut self) -> BackendResult;
    fn add_repository(&mut self, name: &str, uri: &str) -> BackendResult;
    fn install(&mut self, atoms: &[String], mode: InstallMode) -> BackendResult;
    /// Merge configuration changes proposed by an autounmask attempt.
    fn reconcile_config(&mut self) -> BackendResult;
    fn select_default(&mut self, kind: CompilerKind, version: &str) -> BackendResult;
    fn clean_caches(&mut self) -> BackendResult;
}

/// The toolchain-specific part of a recipe.
pub trait InstallToolchain {
    fn kind(&self) -> CompilerKind;

    /// Steps that install `version` and make it the default compiler.
    fn toolchain_steps(&self, version: &str, options: &RecipeOptions) -> Vec<RecipeStep>;
}

pub struct GccToolchain;
pub struct ClangToolchain;
pub struct ClangP2996Toolchain;

impl InstallToolchain for GccToolchain {
    fn kind(&self) -> CompilerKind {
        CompilerKind::Gcc
    }

    fn toolchain_steps(&self, version: &str, _options: &RecipeOptions) -> Vec<RecipeStep> {
        vec![
            RecipeStep::Sync,
            RecipeStep::Install {
                atoms: vec![format!("=sys-devel/gcc-{}*", version)],
                autounmask: true,
            },
            RecipeStep::SelectDefault {
                kind: self.kind(),
                version: version.to_string(),
            },
        ]
    }
}

impl InstallToolchain for ClangToolchain {
    fn kind(&self) -> CompilerKind {
        CompilerKind::Clang
    }

    fn toolchain_steps(&self, version: &str, _options: &RecipeOptions) -> Vec<RecipeStep> {
        vec![
            RecipeStep::Sync,
            RecipeStep::Install {
                atoms: vec![
                    format!("=llvm-core/clang-{}*", version),
                    format!("=llvm-core/lld-{}*", version),
                ],
                autounmask: true,
            },
            RecipeStep::SelectDefault {
                kind: self.kind(),
                version: version.to_string(),
            },
        ]
    }
}

impl InstallToolchain for ClangP2996Toolchain {
    fn kind(&self) -> CompilerKind {
        CompilerKind::ClangP2996
    }

    fn toolchain_steps(&self, version: &str, options: &RecipeOptions) -> Vec<RecipeStep> {
        // "trunk" maps to the live package
        let package_version = if version == "trunk" { "9999" } else { version };
        vec![
            RecipeStep::AddRepository {
                name: options.p2996_repository_name.clone(),
                uri: options.p2996_repository_uri.clone(),
            },
            RecipeStep::Sync,
            RecipeStep::Install {
                atoms: vec![format!(
                    "=llvm-core/clang-p2996-{}*::{}",
                    package_version, options.p2996_repository_name
                )],
                autounmask: true,
            },
            RecipeStep::SelectDefault {
                kind: self.kind(),
                version: version.to_string(),
            },
        ]
    }
}

/// Toolchain installer for `kind`.
pub fn toolchain_for(kind: CompilerKind) -> &'static dyn InstallToolchain {
    match kind {
        CompilerKind::Gcc => &GccToolchain,
        CompilerKind::Clang => &ClangToolchain,
        CompilerKind::ClangP2996 => &ClangP2996Toolchain,
    }
}

/// Ordered package operations producing one toolchain image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipe {
    pub kind: CompilerKind,
    pub version: String,
    pub base_image: String,
    pub steps: Vec<RecipeStep>,
}

impl Recipe {
    /// Recipe for a build spec: toolchain, auxiliary tools, cache cleanup.
    pub fn for_spec(spec: &BuildSpec, options: &RecipeOptions) -> Self {
        let toolchain = toolchain_for(spec.compiler_kind);
        let mut steps = toolchain.toolchain_steps(&spec.compiler_version, options);
        if !options.auxiliary_tools.is_empty() {
            steps.push(RecipeStep::Install {
                atoms: options.auxiliary_tools.clone(),
                autounmask: false,
            });
        }
        steps.push(RecipeStep::CleanCaches);

        Self {
            kind: spec.compiler_kind,
            version: spec.compiler_version.clone(),
            base_image: options.base_image.clone(),
            steps,
        }
    }

    /// Apply every step to `backend`, in order.
    pub fn execute(&self, backend: &mut dyn PackageBackend) -> Result<()> {
        for step in &self.steps {
            debug!(kind = %self.kind, version = %self.version, step = %step.describe(), "Recipe step");
            run_step(step, backend).map_err(|e| InfraError::PackageInstall {
                step: step.describe(),
                message: e.0,
            })?;
        }
        Ok(())
    }

    /// Render the recipe as a Containerfile.
    pub fn containerfile(&self) -> Result<String> {
        let mut script = ScriptBackend::new();
        self.execute(&mut script)?;

        let mut out = String::new();
        out.push_str(&format!("FROM {}\n", self.base_image));
        out.push_str(&format!(
            "LABEL io.infra-containers.toolchain=\"{}\" io.infra-containers.version=\"{}\"\n",
            self.kind, self.version
        ));
        out.push_str("RUN ");
        out.push_str(&script.commands().join(" \\\n && "));
        out.push('\n');
        Ok(out)
    }
}

fn run_step(step: &RecipeStep, backend: &mut dyn PackageBackend) -> BackendResult {
    match step {
        RecipeStep::Sync => backend.sync(),
        RecipeStep::AddRepository { name, uri } => backend.add_repository(name, uri),
        RecipeStep::Install {
            atoms,
            autounmask: false,
        } => backend.install(atoms, InstallMode::Normal),
        RecipeStep::Install {
            atoms,
            autounmask: true,
        } => {
            if let Err(e) = backend.install(atoms, InstallMode::AutounmaskWrite) {
                warn!(atoms = %atoms.join(" "), error = %e, "Autounmask attempt failed, reconciling configuration");
            }
            backend.reconcile_config()?;
            backend.install(atoms, InstallMode::Normal)
        }
        RecipeStep::SelectDefault { kind, version } => backend.select_default(*kind, version),
        RecipeStep::CleanCaches => backend.clean_caches(),
    }
}

/// Backend that records shell commands instead of running them.
#[derive(Debug, Default)]
pub struct ScriptBackend {
    commands: Vec<String>,
}

impl ScriptBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    fn push(&mut self, cmd: String) -> BackendResult {
        self.commands.push(cmd);
        Ok(())
    }
}

impl PackageBackend for ScriptBackend {
    fn sync(&mut self) -> BackendResult {
        self.push("emaint sync --allrepos".to_string())
    }

    fn add_repository(&mut self, name: &str, uri: &str) -> BackendResult {
        self.push(format!("eselect repository add {} git {}", name, uri))
    }

    fn install(&mut self, atoms: &[String], mode: InstallMode) -> BackendResult {
        let quoted: Vec<String> = atoms.iter().map(|a| format!("'{}'", a)).collect();
        match mode {
            InstallMode::Normal => self.push(format!(
                "emerge --noreplace --quiet-build=y {}",
                quoted.join(" ")
            )),
            // The failed first attempt is expected; the shell must not abort.
            InstallMode::AutounmaskWrite => self.push(format!(
                "( emerge --noreplace --quiet-build=y --autounmask=y --autounmask-write=y {} || true )",
                quoted.join(" ")
            )),
        }
    }

    fn reconcile_config(&mut self) -> BackendResult {
        self.push("etc-update --automode -5".to_string())
    }

    fn select_default(&mut self, kind: CompilerKind, version: &str) -> BackendResult {
        match kind {
            CompilerKind::Gcc => {
                self.push(format!("gcc-config \"$(portageq envvar CHOST)-{}\"", version))?
            }
            CompilerKind::Clang => {
                let slot = version.split('.').next().unwrap_or(version);
                self.push(format!(
                    "printf 'PATH=\"/usr/lib/llvm/{}/bin\"\\nCC=\"clang\"\\nCXX=\"clang++\"\\n' > /etc/env.d/60llvm-default",
                    slot
                ))?
            }
            CompilerKind::ClangP2996 => self.push(
                "printf 'PATH=\"/usr/lib/clang-p2996/bin\"\\nCC=\"clang\"\\nCXX=\"clang++\"\\n' > /etc/env.d/60llvm-default"
                    .to_string(),
            )?,
        }
        self.push("env-update".to_string())
    }

    fn clean_caches(&mut self) -> BackendResult {
        self.push(
            "rm -rf /var/cache/distfiles/* /var/cache/binpkgs/* /var/tmp/portage/*".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(kind: CompilerKind, version: &str) -> Recipe {
        Recipe::for_spec(
            &BuildSpec::new(kind, version, &["latest"]),
            &RecipeOptions::default(),
        )
    }

    #[test]
    fn test_p2996_registers_repository_before_any_install() {
        let r = recipe(CompilerKind::ClangP2996, "trunk");
        let add = r
            .steps
            .iter()
            .position(|s| matches!(s, RecipeStep::AddRepository { .. }))
            .expect("p2996 recipe adds a repository");
        let first_install = r.steps.iter().position(|s| s.is_install()).unwrap();
        assert!(add < first_install);
    }

    #[test]
    fn test_gcc_and_clang_add_no_repository() {
        for kind in [CompilerKind::Gcc, CompilerKind::Clang] {
            let r = recipe(kind, "14");
            assert!(!r
                .steps
                .iter()
                .any(|s| matches!(s, RecipeStep::AddRepository { .. })));
        }
    }

    #[test]
    fn test_every_recipe_ends_with_cache_cleanup() {
        for kind in CompilerKind::ALL {
            let r = recipe(kind, "19");
            assert_eq!(r.steps.last(), Some(&RecipeStep::CleanCaches));
        }
    }

    #[test]
    fn test_toolchain_for_matches_kind() {
        for kind in CompilerKind::ALL {
            assert_eq!(toolchain_for(kind).kind(), kind);
        }
    }

    #[test]
    fn test_trunk_maps_to_live_package() {
        let r = recipe(CompilerKind::ClangP2996, "trunk");
        let atoms: Vec<&String> = r
            .steps
            .iter()
            .filter_map(|s| match s {
                RecipeStep::Install { atoms, .. } => Some(atoms),
                _ => None,
            })
            .flatten()
            .collect();
        assert!(atoms[0].starts_with("=llvm-core/clang-p2996-9999"));
        assert!(atoms[0].ends_with("::clang-p2996"));
    }

    #[test]
    fn test_script_renders_autounmask_protocol() {
        let mut script = ScriptBackend::new();
        recipe(CompilerKind::Gcc, "14").execute(&mut script).unwrap();
        let cmds = script.commands();

        let write = cmds
            .iter()
            .position(|c| c.contains("--autounmask-write=y"))
            .unwrap();
        assert!(cmds[write].ends_with("|| true )"));
        assert_eq!(cmds[write + 1], "etc-update --automode -5");
        assert!(cmds[write + 2].starts_with("emerge --noreplace"));
        assert!(!cmds[write + 2].contains("autounmask"));
    }

    #[test]
    fn test_containerfile_layout() {
        let file = recipe(CompilerKind::Clang, "19.1.7").containerfile().unwrap();
        assert!(file.starts_with("FROM docker.io/gentoo/stage3:latest\n"));
        assert!(file.contains("io.infra-containers.toolchain=\"clang\""));
        assert!(file.contains("/usr/lib/llvm/19/bin"));
        assert!(file.contains("rm -rf /var/cache/distfiles/*"));
        assert_eq!(file.matches("RUN ").count(), 1);
    }

    #[test]
    fn test_no_auxiliary_tools_skips_install() {
        let options = RecipeOptions {
            auxiliary_tools: vec![],
            ..RecipeOptions::default()
        };
        let r = Recipe::for_spec(&BuildSpec::new(CompilerKind::Gcc, "13", &["13"]), &options);
        assert_eq!(r.steps.iter().filter(|s| s.is_install()).count(), 1);
    }
}
