//! Build specifications: which toolchain, which version, which tags.

use crate::error::{InfraError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Toolchain family installed into an image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum CompilerKind {
    /// GNU compiler collection
    Gcc,

    /// LLVM clang
    Clang,

    /// Experimental clang fork with static reflection (P2996)
    ClangP2996,
}

impl CompilerKind {
    /// All supported kinds, in matrix order.
    pub const ALL: [CompilerKind; 3] = [
        CompilerKind::Gcc,
        CompilerKind::Clang,
        CompilerKind::ClangP2996,
    ];

    /// Name used in image names and staging tags.
    pub fn name(&self) -> &'static str {
        match self {
            CompilerKind::Gcc => "gcc",
            CompilerKind::Clang => "clang",
            CompilerKind::ClangP2996 => "clang-p2996",
        }
    }
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompilerKind {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gcc" => Ok(CompilerKind::Gcc),
            "clang" => Ok(CompilerKind::Clang),
            "clang-p2996" | "clang_p2996" | "p2996" => Ok(CompilerKind::ClangP2996),
            other => Err(InfraError::config(format!("Unknown compiler kind: {}", other))),
        }
    }
}

/// A declared toolchain/version/tag combination to build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BuildSpec {
    /// Toolchain family.
    #[serde(rename = "kind")]
    pub compiler_kind: CompilerKind,

    /// Pinned toolchain version (e.g. "14", "19.1.7").
    #[serde(rename = "version")]
    pub compiler_version: String,

    /// Production tags, in declaration order.
    pub tags: Vec<String>,
}

impl BuildSpec {
    /// Create a new build specification.
    pub fn new(kind: CompilerKind, version: impl Into<String>, tags: &[&str]) -> Self {
        Self {
            compiler_kind: kind,
            compiler_version: version.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// `<kind>-<version>`, the stable label of this entry.
    pub fn label(&self) -> String {
        format!("{}-{}", self.compiler_kind, self.compiler_version)
    }

    /// Check that the spec can be built and published.
    pub fn validate(&self) -> Result<()> {
        let version = self.compiler_version.as_str();
        if version.trim().is_empty() {
            return Err(InfraError::config(format!(
                "{} entry has an empty version",
                self.compiler_kind
            )));
        }
        if !is_valid_tag(version) {
            return Err(InfraError::config(format!(
                "{} version '{}' cannot be used in an image tag",
                self.compiler_kind, version
            )));
        }
        if self.tags.is_empty() {
            return Err(InfraError::config(format!(
                "{} declares no tags",
                self.label()
            )));
        }
        for tag in &self.tags {
            if !is_valid_tag(tag) {
                return Err(InfraError::config(format!(
                    "{} declares invalid tag '{}'",
                    self.label(),
                    tag
                )));
            }
        }
        Ok(())
    }
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern is valid")
    })
}

/// Whether `tag` satisfies the OCI tag grammar.
pub fn is_valid_tag(tag: &str) -> bool {
    tag_pattern().is_match(tag)
}

/// Replace characters outside the tag grammar with `-`.
pub fn sanitize_tag_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_start_matches(['.', '-']).to_string()
}
