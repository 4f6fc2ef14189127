//! Build matrix expansion.
//!
//! The matrix is a static list of [`BuildSpec`] literals, either the
//! built-in default or a TOML file:
//!
//! ```toml
//! [recipe]
//! base_image = "docker.io/gentoo/stage3:latest"
//!
//! [[entry]]
//! kind = "gcc"
//! version = "14"
//! tags = ["14", "latest"]
//!
//! [[entry]]
//! kind = "clang-p2996"
//! version = "trunk"
//! tags = ["trunk"]
//! triggers = ["schedule", "workflow_dispatch"]
//! ```
//!
//! All validation happens in [`Matrix::new`]; iteration never fails.

use crate::error::{InfraError, Result};
use crate::recipe::RecipeOptions;
use crate::spec::{BuildSpec, CompilerKind};
use crate::tags::TriggerEvent;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

/// One matrix row: a build spec and the events it runs on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatrixEntry {
    #[serde(flatten)]
    pub spec: BuildSpec,

    /// Events this entry runs on; `None` means every event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Vec<TriggerEvent>>,
}

impl MatrixEntry {
    pub fn new(spec: BuildSpec) -> Self {
        Self {
            spec,
            triggers: None,
        }
    }

    /// Restrict this entry to the given events.
    pub fn only_on(mut self, events: &[TriggerEvent]) -> Self {
        self.triggers = Some(events.to_vec());
        self
    }

    pub fn runs_on(&self, event: TriggerEvent) -> bool {
        match &self.triggers {
            Some(events) => events.contains(&event),
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MatrixFile {
    #[serde(default)]
    recipe: RecipeOptions,
    #[serde(default)]
    entry: Vec<MatrixEntry>,
}

/// Filter applied with `--only kind[:version]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFilter {
    pub kind: CompilerKind,
    pub version: Option<String>,
}

impl EntryFilter {
    pub fn matches(&self, spec: &BuildSpec) -> bool {
        spec.compiler_kind == self.kind
            && self
                .version
                .as_deref()
                .map_or(true, |v| v == spec.compiler_version)
    }
}

impl FromStr for EntryFilter {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, version) = match s.split_once(':') {
            Some((k, v)) if !v.is_empty() => (k, Some(v.to_string())),
            Some((k, _)) => (k, None),
            None => (s, None),
        };
        Ok(Self {
            kind: kind.parse()?,
            version,
        })
    }
}

/// A validated, immutable build matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    entries: Vec<MatrixEntry>,
    recipe: RecipeOptions,
}

impl Matrix {
    /// Validate entries and build a matrix.
    pub fn new(entries: Vec<MatrixEntry>, recipe: RecipeOptions) -> Result<Self> {
        if entries.is_empty() {
            return Err(InfraError::config("Matrix has no entries"));
        }
        recipe.validate()?;

        let mut seen = HashSet::new();
        for entry in &entries {
            entry.spec.validate()?;
            if !seen.insert((entry.spec.compiler_kind, entry.spec.compiler_version.clone())) {
                return Err(InfraError::config(format!(
                    "Duplicate matrix entry {}",
                    entry.spec.label()
                )));
            }
            if let Some(events) = &entry.triggers {
                if events.is_empty() {
                    return Err(InfraError::config(format!(
                        "{} has an empty trigger list",
                        entry.spec.label()
                    )));
                }
            }
        }

        Ok(Self { entries, recipe })
    }

    /// The matrix shipped with the tool.
    pub fn builtin() -> Self {
        let entries = vec![
            MatrixEntry::new(BuildSpec::new(CompilerKind::Gcc, "13", &["13"])),
            MatrixEntry::new(BuildSpec::new(CompilerKind::Gcc, "14", &["14", "latest"])),
            MatrixEntry::new(BuildSpec::new(CompilerKind::Clang, "19", &["19"])),
            MatrixEntry::new(BuildSpec::new(CompilerKind::Clang, "20", &["20", "latest"])),
            MatrixEntry::new(BuildSpec::new(
                CompilerKind::ClangP2996,
                "trunk",
                &["trunk", "latest"],
            ))
            .only_on(&[
                TriggerEvent::Schedule,
                TriggerEvent::WorkflowDispatch,
                TriggerEvent::PullRequest,
            ]),
        ];
        Self {
            entries,
            recipe: RecipeOptions::default(),
        }
    }

    /// Parse a TOML matrix document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: MatrixFile = toml::from_str(content)?;
        Self::new(file.entry, file.recipe)
    }

    /// Load a TOML matrix file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            InfraError::config(format!("Cannot read matrix file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Recipe options shared by every entry.
    pub fn recipe_options(&self) -> &RecipeOptions {
        &self.recipe
    }

    pub fn entries(&self) -> &[MatrixEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every build spec, in declaration order. Each call starts over.
    pub fn iter(&self) -> impl Iterator<Item = &BuildSpec> + '_ {
        self.entries.iter().map(|e| &e.spec)
    }

    /// Build specs that run on `event`.
    pub fn for_trigger(&self, event: TriggerEvent) -> impl Iterator<Item = &BuildSpec> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.runs_on(event))
            .map(|e| &e.spec)
    }

    /// Build specs for `event` that pass any of `filters` (all when empty).
    pub fn select<'a>(
        &'a self,
        event: TriggerEvent,
        filters: &'a [EntryFilter],
    ) -> impl Iterator<Item = &'a BuildSpec> + 'a {
        self.for_trigger(event)
            .filter(move |spec| filters.is_empty() || filters.iter().any(|f| f.matches(spec)))
    }

    /// SHA-256 over the ordered entries; stable identity of the matrix.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for spec in self.iter() {
            hasher.update(spec.compiler_kind.name().as_bytes());
            hasher.update(b"\0");
            hasher.update(spec.compiler_version.as_bytes());
            hasher.update(b"\0");
            hasher.update(spec.tags.join(",").as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}
