//! In-memory container engine (testing only)
//!
//! [`MemoryEngine`] records every call, keeps a local image store and can be
//! told to fail builds, logins or pushes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use infra_core::{Credential, InfraError, Result};

use crate::engine::{BuildRequest, ContainerEngine};

/// Call recorded by [`MemoryEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Build(Vec<String>),
    ImageExists(String),
    Tag { source: String, target: String },
    Login(String),
    Push(String),
}

/// A build the engine accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub tags: Vec<String>,
    pub containerfile: String,
    pub build_args: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct EngineState {
    images: HashSet<String>,
    calls: Vec<EngineCall>,
    built: Vec<BuiltImage>,
    pushed: Vec<String>,
}

/// In-memory engine backed by a set of local image names.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    failing_builds: HashSet<String>,
    failing_pushes: HashSet<String>,
    login_fails: bool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `reference` is already present locally.
    pub fn with_image(self, reference: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(reference.to_string());
        self
    }

    /// Fail builds whose first tag contains `pattern`.
    pub fn fail_build(mut self, pattern: &str) -> Self {
        self.failing_builds.insert(pattern.to_string());
        self
    }

    /// Fail pushes of exactly `reference`.
    pub fn fail_push(mut self, reference: &str) -> Self {
        self.failing_pushes.insert(reference.to_string());
        self
    }

    pub fn fail_login(mut self) -> Self {
        self.login_fails = true;
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn built(&self) -> Vec<BuiltImage> {
        self.state.lock().unwrap().built.clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn build(&self, request: &BuildRequest) -> Result<()> {
        // the containerfile may live in a temp dir removed after the build
        let containerfile = std::fs::read_to_string(&request.containerfile).unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Build(request.tags.clone()));

        if self
            .failing_builds
            .iter()
            .any(|pattern| request.image().contains(pattern.as_str()))
        {
            return Err(InfraError::Build {
                image: request.image().to_string(),
                message: "ERROR: failed to solve".to_string(),
            });
        }

        state.images.extend(request.tags.iter().cloned());
        state.built.push(BuiltImage {
            tags: request.tags.clone(),
            containerfile,
            build_args: request.build_args.clone(),
        });
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(EngineCall::ImageExists(reference.to_string()));
        Ok(state.images.contains(reference))
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Tag {
            source: source.to_string(),
            target: target.to_string(),
        });
        if !state.images.contains(source) {
            return Err(InfraError::Publish {
                reference: target.to_string(),
                message: format!("No such image: {}", source),
            });
        }
        state.images.insert(target.to_string());
        Ok(())
    }

    async fn login(&self, registry: &str, _credential: &Credential) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Login(registry.to_string()));
        if self.login_fails {
            return Err(InfraError::Publish {
                reference: registry.to_string(),
                message: "login failed: unauthorized".to_string(),
            });
        }
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Push(reference.to_string()));
        if self.failing_pushes.contains(reference) {
            return Err(InfraError::Publish {
                reference: reference.to_string(),
                message: "connection reset by peer".to_string(),
            });
        }
        state.pushed.push(reference.to_string());
        Ok(())
    }
}
