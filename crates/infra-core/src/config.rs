//! Registry and image naming configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_REGISTRY: &str = "ghcr.io";
pub const DEFAULT_OWNER: &str = "org";
pub const DEFAULT_IMAGE_BASE: &str = "infra-containers-devcontainer";
pub const DEFAULT_STAGING_SUFFIX: &str = "staging";

/// Registry credential used by the publisher.
///
/// The token never leaves the process: it is not serialised and comes back
/// empty when a credential is deserialised.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    #[serde(skip)]
    pub token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Where images are published and how they are named.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishConfig {
    /// Registry host
    pub registry: String,
    /// Namespace owner below the registry
    pub owner: String,
    /// Image name prefix; kind or staging suffix is appended with `-`
    pub image_base: String,
    /// Suffix of the staging image
    pub staging_suffix: String,
    /// Login credential (optional for local registries)
    pub credential: Option<Credential>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        let owner = std::env::var("INFRA_REGISTRY_OWNER")
            .or_else(|_| std::env::var("GITHUB_REPOSITORY_OWNER"))
            .unwrap_or_else(|_| DEFAULT_OWNER.to_string());

        let credential = match (
            std::env::var("INFRA_REGISTRY_USER").or_else(|_| std::env::var("GITHUB_ACTOR")),
            std::env::var("INFRA_REGISTRY_TOKEN").or_else(|_| std::env::var("GITHUB_TOKEN")),
        ) {
            (Ok(username), Ok(token)) if !token.is_empty() => Some(Credential { username, token }),
            _ => None,
        };

        PublishConfig {
            registry: std::env::var("INFRA_REGISTRY")
                .unwrap_or_else(|_| DEFAULT_REGISTRY.to_string()),
            owner,
            image_base: std::env::var("INFRA_IMAGE_BASE")
                .unwrap_or_else(|_| DEFAULT_IMAGE_BASE.to_string()),
            staging_suffix: DEFAULT_STAGING_SUFFIX.to_string(),
            credential,
        }
    }
}

impl PublishConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific registry, without credentials
    pub fn new(registry: &str, owner: &str, image_base: &str) -> Self {
        PublishConfig {
            registry: registry.to_string(),
            owner: owner.to_string(),
            image_base: image_base.to_string(),
            staging_suffix: DEFAULT_STAGING_SUFFIX.to_string(),
            credential: None,
        }
    }

    /// Set login credential
    pub fn with_credential(mut self, username: &str, token: &str) -> Self {
        self.credential = Some(Credential {
            username: username.to_string(),
            token: token.to_string(),
        });
        self
    }

    /// Override the registry host
    pub fn with_registry(mut self, registry: &str) -> Self {
        self.registry = registry.to_string();
        self
    }

    /// Override the namespace owner
    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = owner.to_string();
        self
    }
}
