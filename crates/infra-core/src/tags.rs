//! Trigger context and published tag resolution.
//!
//! Main-branch builds publish every declared tag under the deploy image
//! `<registry>/<owner>/<image_base>-<kind>`. Every other build publishes a
//! single tag `<kind>-<version>-<change_id>` under the staging image
//! `<registry>/<owner>/<image_base>-staging`, so staging images never
//! overwrite production tags.

use crate::config::PublishConfig;
use crate::error::{InfraError, Result};
use crate::spec::{is_valid_tag, sanitize_tag_component, BuildSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Event that started the pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Push,
    PullRequest,
    Schedule,
    WorkflowDispatch,
}

impl TriggerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerEvent::Push => "push",
            TriggerEvent::PullRequest => "pull_request",
            TriggerEvent::Schedule => "schedule",
            TriggerEvent::WorkflowDispatch => "workflow_dispatch",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TriggerEvent {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "push" => Ok(TriggerEvent::Push),
            "pull_request" | "pull_request_target" | "pr" => Ok(TriggerEvent::PullRequest),
            "schedule" => Ok(TriggerEvent::Schedule),
            "workflow_dispatch" | "dispatch" | "manual" => Ok(TriggerEvent::WorkflowDispatch),
            other => Err(InfraError::config(format!("Unknown trigger event: {}", other))),
        }
    }
}

/// What started the run, and whether it publishes production tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerContext {
    pub event: TriggerEvent,
    pub is_main_branch: bool,
    /// Pull request number or other change identifier (non-main builds).
    pub change_id: Option<String>,
}

impl TriggerContext {
    /// Context for a build of the main branch.
    pub fn main(event: TriggerEvent) -> Self {
        Self {
            event,
            is_main_branch: true,
            change_id: None,
        }
    }

    /// Context for a pull request build.
    pub fn pull_request(change_id: impl Into<String>) -> Self {
        Self {
            event: TriggerEvent::PullRequest,
            is_main_branch: false,
            change_id: Some(change_id.into()),
        }
    }

    /// Derive the context from a GitHub Actions environment.
    pub fn from_github_env(main_branch: &str) -> Result<Self> {
        let event_name = std::env::var("GITHUB_EVENT_NAME").unwrap_or_else(|_| "push".to_string());
        let git_ref = std::env::var("GITHUB_REF").unwrap_or_default();
        let ref_name = std::env::var("GITHUB_REF_NAME").ok();
        Self::from_github(&event_name, &git_ref, ref_name.as_deref(), main_branch)
    }

    /// Derive the context from GitHub event name and ref values.
    ///
    /// Pull requests are keyed by their number (`refs/pull/<n>/merge`).
    /// Pushes and dispatches of other branches are keyed by the branch name.
    pub fn from_github(
        event_name: &str,
        git_ref: &str,
        ref_name: Option<&str>,
        main_branch: &str,
    ) -> Result<Self> {
        let event: TriggerEvent = event_name.parse()?;

        if event == TriggerEvent::PullRequest {
            let number = git_ref
                .strip_prefix("refs/pull/")
                .and_then(|rest| rest.split('/').next())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| {
                    InfraError::config(format!("Cannot find pull request number in ref '{}'", git_ref))
                })?;
            return Ok(Self::pull_request(number));
        }

        let branch = ref_name
            .map(str::to_string)
            .or_else(|| git_ref.strip_prefix("refs/heads/").map(str::to_string))
            .unwrap_or_default();

        if event == TriggerEvent::Schedule || branch == main_branch {
            return Ok(Self::main(event));
        }

        Ok(Self {
            event,
            is_main_branch: false,
            change_id: if branch.is_empty() { None } else { Some(branch) },
        })
    }

    fn staging_key(&self) -> Result<String> {
        let raw = self
            .change_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| InfraError::config("Non-main build requires a change id"))?;
        let key = sanitize_tag_component(raw);
        if key.is_empty() {
            return Err(InfraError::config(format!("Change id '{}' is not usable in a tag", raw)));
        }
        Ok(key)
    }
}

/// Tags an image will be published under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedTagSet {
    /// Registry host, e.g. `ghcr.io`.
    pub registry: String,

    /// Repository path below the registry, e.g. `org/infra-containers-devcontainer-gcc`.
    pub image_name: String,

    /// Tag names (without the repository).
    pub tags: BTreeSet<String>,
}

impl ResolvedTagSet {
    /// `<registry>/<image_name>`
    pub fn repository(&self) -> String {
        format!("{}/{}", self.registry, self.image_name)
    }

    /// Fully qualified references, one per tag.
    pub fn references(&self) -> Vec<String> {
        let repo = self.repository();
        self.tags.iter().map(|t| format!("{}:{}", repo, t)).collect()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Computes published tags from the publish config and trigger context.
#[derive(Debug, Clone)]
pub struct TagResolver {
    config: PublishConfig,
}

impl TagResolver {
    pub fn new(config: PublishConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    /// Resolve the tag set for `spec` under `trigger`.
    pub fn resolve(&self, spec: &BuildSpec, trigger: &TriggerContext) -> Result<ResolvedTagSet> {
        let owner = self.config.owner.to_lowercase();
        let base = &self.config.image_base;

        let (image_name, tags) = if trigger.is_main_branch {
            if spec.tags.is_empty() {
                return Err(InfraError::config(format!(
                    "{} has no tags to publish",
                    spec.label()
                )));
            }
            let image_name = format!("{}/{}-{}", owner, base, spec.compiler_kind);
            (image_name, spec.tags.iter().cloned().collect::<BTreeSet<_>>())
        } else {
            let key = trigger.staging_key()?;
            let image_name = format!("{}/{}-{}", owner, base, self.config.staging_suffix);
            let tag = format!("{}-{}-{}", spec.compiler_kind, spec.compiler_version, key);
            (image_name, BTreeSet::from([tag]))
        };

        if let Some(bad) = tags.iter().find(|t| !is_valid_tag(t)) {
            return Err(InfraError::config(format!("Resolved tag '{}' is invalid", bad)));
        }

        Ok(ResolvedTagSet {
            registry: self.config.registry.clone(),
            image_name,
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::CompilerKind;

    fn resolver() -> TagResolver {
        TagResolver::new(PublishConfig::new("ghcr.io", "org", "infra-containers-devcontainer"))
    }

    #[test]
    fn test_main_build_publishes_every_declared_tag() {
        let spec = BuildSpec::new(CompilerKind::Gcc, "14", &["14", "latest"]);
        let set = resolver()
            .resolve(&spec, &TriggerContext::main(TriggerEvent::Push))
            .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(
            set.references(),
            vec![
                "ghcr.io/org/infra-containers-devcontainer-gcc:14".to_string(),
                "ghcr.io/org/infra-containers-devcontainer-gcc:latest".to_string(),
            ]
        );
    }

    #[test]
    fn test_pull_request_build_uses_staging_image() {
        let spec = BuildSpec::new(CompilerKind::Gcc, "14", &["14", "latest"]);
        let set = resolver()
            .resolve(&spec, &TriggerContext::pull_request("42"))
            .unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(
            set.references(),
            vec!["ghcr.io/org/infra-containers-devcontainer-staging:gcc-14-42".to_string()]
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let spec = BuildSpec::new(CompilerKind::ClangP2996, "trunk", &["trunk"]);
        let ctx = TriggerContext::pull_request("7");
        let a = resolver().resolve(&spec, &ctx).unwrap();
        let b = resolver().resolve(&spec, &ctx).unwrap();
        assert_eq!(a, b);
        assert!(a.tags.contains("clang-p2996-trunk-7"));
    }

    #[test]
    fn test_non_main_without_change_id_is_rejected() {
        let spec = BuildSpec::new(CompilerKind::Clang, "19", &["19"]);
        let ctx = TriggerContext {
            event: TriggerEvent::WorkflowDispatch,
            is_main_branch: false,
            change_id: None,
        };
        assert!(matches!(
            resolver().resolve(&spec, &ctx).unwrap_err(),
            InfraError::Configuration(_)
        ));
    }

    #[test]
    fn test_main_without_tags_is_rejected() {
        let spec = BuildSpec::new(CompilerKind::Clang, "19", &[]);
        let ctx = TriggerContext::main(TriggerEvent::Schedule);
        assert!(resolver().resolve(&spec, &ctx).is_err());
    }

    #[test]
    fn test_branch_change_id_is_sanitized() {
        let spec = BuildSpec::new(CompilerKind::Clang, "19", &["19"]);
        let ctx = TriggerContext {
            event: TriggerEvent::Push,
            is_main_branch: false,
            change_id: Some("feature/llvm-20".to_string()),
        };
        let set = resolver().resolve(&spec, &ctx).unwrap();
        assert!(set.tags.contains("clang-19-feature-llvm-20"));
    }

    #[test]
    fn test_owner_is_lowercased() {
        let resolver = TagResolver::new(PublishConfig::new("ghcr.io", "MyOrg", "tools"));
        let spec = BuildSpec::new(CompilerKind::Gcc, "13", &["13"]);
        let set = resolver
            .resolve(&spec, &TriggerContext::main(TriggerEvent::Push))
            .unwrap();
        assert_eq!(set.repository(), "ghcr.io/myorg/tools-gcc");
    }

    #[test]
    fn test_from_github_pull_request() {
        let ctx = TriggerContext::from_github("pull_request", "refs/pull/42/merge", None, "main")
            .unwrap();
        assert_eq!(ctx, TriggerContext::pull_request("42"));
    }

    #[test]
    fn test_from_github_main_push_and_schedule() {
        let push = TriggerContext::from_github("push", "refs/heads/main", Some("main"), "main")
            .unwrap();
        assert!(push.is_main_branch);

        let schedule = TriggerContext::from_github("schedule", "", None, "main").unwrap();
        assert!(schedule.is_main_branch);
        assert_eq!(schedule.event, TriggerEvent::Schedule);
    }

    #[test]
    fn test_from_github_feature_branch_dispatch() {
        let ctx = TriggerContext::from_github(
            "workflow_dispatch",
            "refs/heads/wip",
            None,
            "main",
        )
        .unwrap();
        assert!(!ctx.is_main_branch);
        assert_eq!(ctx.change_id.as_deref(), Some("wip"));
    }

    #[test]
    fn test_from_github_rejects_malformed_pull_ref() {
        assert!(TriggerContext::from_github("pull_request", "refs/heads/x", None, "main").is_err());
    }
}
